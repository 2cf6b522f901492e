//! Storage backend trait definition.

use crate::error::{StorageError, StorageResult};

/// An append-only byte store with random reads.
///
/// Backends hold opaque bytes. The WAL and the segment log are both laid
/// on top of this trait, each in its own backend instance.
///
/// # Invariants
///
/// - `append` returns the offset the data starts at, which equals the
///   size before the call
/// - `read_at` returns exactly the bytes previously appended there
/// - after `flush` returns, appended data survives process exit
/// - `truncate` only ever shrinks
pub trait StorageBackend: Send + Sync {
    /// Reads `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::ReadPastEnd`] if the range is not fully
    /// inside the store, or an I/O error.
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>>;

    /// Appends `data` and returns the offset it was written at.
    ///
    /// # Errors
    ///
    /// Returns an error if an I/O error occurs.
    fn append(&mut self, data: &[u8]) -> StorageResult<u64>;

    /// Pushes buffered writes to the OS.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush fails.
    fn flush(&mut self) -> StorageResult<()>;

    /// Returns the current size in bytes, which is where the next append lands.
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be determined.
    fn size(&self) -> StorageResult<u64>;

    /// Forces data and metadata to stable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync fails.
    fn sync(&mut self) -> StorageResult<()>;

    /// Drops everything after `new_size`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::TruncateBeyondEnd`] if `new_size` exceeds
    /// the current size.
    fn truncate(&mut self, new_size: u64) -> StorageResult<()>;

    /// Reads a little-endian `u32` at `offset`.
    ///
    /// Both on-disk formats of the core prefix their records with a
    /// length field read through this helper.
    ///
    /// # Errors
    ///
    /// Same as [`StorageBackend::read_at`].
    fn read_u32_le(&self, offset: u64) -> StorageResult<u32> {
        let bytes = self.read_at(offset, 4)?;
        let arr: [u8; 4] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| StorageError::ReadPastEnd {
                offset,
                len: 4,
                size: offset,
            })?;
        Ok(u32::from_le_bytes(arr))
    }

    /// Returns `true` if nothing has been appended yet.
    ///
    /// # Errors
    ///
    /// Same as [`StorageBackend::size`].
    fn is_empty(&self) -> StorageResult<bool> {
        Ok(self.size()? == 0)
    }
}
