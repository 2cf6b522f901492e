//! Error types for storage operations.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors raised by storage backends.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A read touched bytes past the end of the store.
    #[error("read beyond end of storage: offset {offset}, len {len}, size {size}")]
    ReadPastEnd {
        /// The requested read offset.
        offset: u64,
        /// The requested read length.
        len: usize,
        /// The current storage size.
        size: u64,
    },

    /// A truncation asked for a size larger than the current one.
    #[error("cannot truncate to {requested} bytes, storage holds {size}")]
    TruncateBeyondEnd {
        /// Requested size.
        requested: u64,
        /// Current size.
        size: u64,
    },

    /// The backend was closed.
    #[error("storage is closed")]
    Closed,
}
