//! Write-ahead log.
//!
//! Every commit is appended to the WAL and flushed before it is applied to
//! the segment file, so a crash between the two is repaired by replay on
//! the next open. The WAL is cleared at checkpoints.
//!
//! ## Record format
//!
//! ```text
//! | magic (4) | version (2) | type (1) | length (4) | payload (N) | crc32 (4) |
//! ```
//!
//! ## Recovery policy
//!
//! - A truncated header or payload at the end is an interrupted write and
//!   is dropped together with its uncommitted transaction.
//! - A bad magic, unknown type, unsupported version or CRC mismatch is
//!   corruption; the store refuses to open with `FileCorrupt`.
//! - Only transactions with a complete commit record are replayed.

mod iterator;
mod record;
mod writer;

pub use iterator::WalRecordIterator;
pub use record::{compute_crc32, WalRecord, WalRecordType};
pub use writer::WalManager;
