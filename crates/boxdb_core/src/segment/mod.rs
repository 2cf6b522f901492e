//! Segment storage for committed rows.
//!
//! The segment file is append-only. Every commit appends one record per
//! written row; an in-memory version index maps each row to the chain of
//! its committed versions so readers can resolve the version visible at
//! their snapshot.
//!
//! ## Segment Record Format
//!
//! ```text
//! | record_len (4) | table (4) | object_id (8) | flags (1) | sequence (8) | payload (N) | crc32 (4) |
//! ```
//!
//! Flags:
//! - `0x01` = tombstone (deleted row)

mod record;
mod store;

pub use record::{SegmentRecord, SegmentRecordFlags};
pub use store::{RecoveredSegments, SegmentManager};
