//! # boxdb storage
//!
//! Byte-level persistence targets for boxdb.
//!
//! A backend is an append-only byte store with random reads. It knows
//! nothing about WAL envelopes, segment records or entity payloads; the
//! core crate owns every on-disk format.
//!
//! ## Available backends
//!
//! - [`InMemoryBackend`] - for `memory:<name>` stores and tests
//! - [`FileBackend`] - a single OS file, optionally created with explicit
//!   permission bits
//!
//! ## Example
//!
//! ```rust
//! use boxdb_storage::{InMemoryBackend, StorageBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! let offset = backend.append(b"record").unwrap();
//! assert_eq!(backend.read_at(offset, 6).unwrap(), b"record");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
