//! In-memory storage backend.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;

/// A backend that keeps its bytes in a growable buffer.
///
/// Used for `memory:<name>` stores, whose contents live exactly as long
/// as the store that owns them, and throughout the test suites.
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    data: RwLock<Vec<u8>>,
}

impl InMemoryBackend {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a backend pre-filled with `data`.
    ///
    /// Recovery tests use this to hand-craft torn or corrupted logs.
    #[must_use]
    pub fn with_data(data: Vec<u8>) -> Self {
        Self {
            data: RwLock::new(data),
        }
    }

    /// Returns a copy of the current contents.
    #[must_use]
    pub fn data(&self) -> Vec<u8> {
        self.data.read().clone()
    }
}

impl StorageBackend for InMemoryBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let data = self.data.read();
        let size = data.len() as u64;
        let start = usize::try_from(offset).map_err(|_| StorageError::ReadPastEnd {
            offset,
            len,
            size,
        })?;
        let end = start.checked_add(len).filter(|end| *end <= data.len());

        match end {
            Some(end) if start <= data.len() => Ok(data[start..end].to_vec()),
            _ => Err(StorageError::ReadPastEnd { offset, len, size }),
        }
    }

    fn append(&mut self, bytes: &[u8]) -> StorageResult<u64> {
        let mut data = self.data.write();
        let offset = data.len() as u64;
        data.extend_from_slice(bytes);
        Ok(offset)
    }

    fn flush(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.data.read().len() as u64)
    }

    fn sync(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        let mut data = self.data.write();
        let size = data.len() as u64;
        if new_size > size {
            return Err(StorageError::TruncateBeyondEnd {
                requested: new_size,
                size,
            });
        }
        // new_size <= len, so the cast cannot truncate
        data.truncate(new_size as usize);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn append_offsets_follow_size() {
        let mut backend = InMemoryBackend::new();
        assert!(backend.is_empty().unwrap());

        assert_eq!(backend.append(b"wal").unwrap(), 0);
        assert_eq!(backend.append(b"segment").unwrap(), 3);
        assert_eq!(backend.size().unwrap(), 10);
    }

    #[test]
    fn read_inside_and_past_end() {
        let mut backend = InMemoryBackend::new();
        backend.append(b"hello world").unwrap();

        assert_eq!(backend.read_at(6, 5).unwrap(), b"world");
        assert!(backend.read_at(2, 0).unwrap().is_empty());
        assert!(matches!(
            backend.read_at(8, 10),
            Err(StorageError::ReadPastEnd { .. })
        ));
        assert!(matches!(
            backend.read_at(u64::MAX, 1),
            Err(StorageError::ReadPastEnd { .. })
        ));
    }

    #[test]
    fn read_u32_le_prefix() {
        let mut backend = InMemoryBackend::new();
        backend.append(&42u32.to_le_bytes()).unwrap();
        assert_eq!(backend.read_u32_le(0).unwrap(), 42);
        assert!(backend.read_u32_le(1).is_err());
    }

    #[test]
    fn truncate_only_shrinks() {
        let mut backend = InMemoryBackend::with_data(b"hello world".to_vec());
        backend.truncate(5).unwrap();
        assert_eq!(backend.data(), b"hello");
        assert!(matches!(
            backend.truncate(100),
            Err(StorageError::TruncateBeyondEnd { requested: 100, size: 5 })
        ));
    }

    proptest! {
        #[test]
        fn appended_chunks_read_back(chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..64), 1..16)) {
            let mut backend = InMemoryBackend::new();
            let mut offsets = Vec::new();
            for chunk in &chunks {
                offsets.push(backend.append(chunk).unwrap());
            }
            for (chunk, offset) in chunks.iter().zip(offsets) {
                prop_assert_eq!(&backend.read_at(offset, chunk.len()).unwrap(), chunk);
            }
        }
    }
}
