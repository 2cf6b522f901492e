//! WAL writer and reader.

use crate::error::{CoreError, CoreResult};
use crate::wal::iterator::{WalRecordIterator, CRC_SIZE, HEADER_SIZE};
use crate::wal::record::{compute_crc32, WalRecord, WAL_MAGIC, WAL_VERSION};
use boxdb_storage::StorageBackend;
use parking_lot::Mutex;

/// Manages WAL writes and reads.
///
/// Records are framed into an envelope and appended in one backend call.
/// Commits append a whole transaction through [`WalManager::append_batch`]
/// so a crash can only ever cut the tail of the log.
pub struct WalManager {
    backend: Mutex<Box<dyn StorageBackend>>,
}

impl WalManager {
    /// Creates a new WAL manager.
    pub fn new(backend: Box<dyn StorageBackend>) -> Self {
        Self {
            backend: Mutex::new(backend),
        }
    }

    fn frame(record: &WalRecord, out: &mut Vec<u8>) -> CoreResult<()> {
        let payload = record.encode_payload()?;
        let len = u32::try_from(payload.len())
            .map_err(|_| CoreError::illegal_argument("WAL record payload too large"))?;

        let start = out.len();
        out.reserve(HEADER_SIZE + payload.len() + CRC_SIZE);
        out.extend_from_slice(&WAL_MAGIC);
        out.extend_from_slice(&WAL_VERSION.to_le_bytes());
        out.push(record.record_type().as_byte());
        out.extend_from_slice(&len.to_le_bytes());
        out.extend_from_slice(&payload);
        let crc = compute_crc32(&out[start..]);
        out.extend_from_slice(&crc.to_le_bytes());
        Ok(())
    }

    /// Returns the number of bytes `records` occupy once framed.
    pub fn framed_len(records: &[WalRecord]) -> CoreResult<u64> {
        let mut total = 0u64;
        for record in records {
            let payload = record.encode_payload()?;
            total += (HEADER_SIZE + payload.len() + CRC_SIZE) as u64;
        }
        Ok(total)
    }

    /// Appends a record to the WAL and returns its offset.
    pub fn append(&self, record: &WalRecord) -> CoreResult<u64> {
        self.append_batch(std::slice::from_ref(record))
    }

    /// Appends several records with a single write and returns the offset
    /// of the first.
    pub fn append_batch(&self, records: &[WalRecord]) -> CoreResult<u64> {
        let mut data = Vec::new();
        for record in records {
            Self::frame(record, &mut data)?;
        }
        let offset = self.backend.lock().append(&data)?;
        Ok(offset)
    }

    /// Flushes buffered writes to the OS.
    pub fn flush(&self) -> CoreResult<()> {
        self.backend.lock().flush()?;
        Ok(())
    }

    /// Flushes and fsyncs the log.
    pub fn sync(&self) -> CoreResult<()> {
        self.backend.lock().sync()?;
        Ok(())
    }

    /// Returns the current WAL size.
    pub fn size(&self) -> CoreResult<u64> {
        Ok(self.backend.lock().size()?)
    }

    /// Returns a streaming iterator over WAL records.
    ///
    /// The iterator holds the WAL lock until dropped.
    pub fn iter(&self) -> CoreResult<WalRecordIterator<'_>> {
        WalRecordIterator::new(self.backend.lock(), 0)
    }

    /// Reads all records from the WAL.
    #[cfg(test)]
    pub fn read_all(&self) -> CoreResult<Vec<(u64, WalRecord)>> {
        self.iter()?.collect()
    }

    /// Truncates the WAL to the specified offset.
    pub fn truncate(&self, offset: u64) -> CoreResult<()> {
        self.backend.lock().truncate(offset)?;
        Ok(())
    }

    /// Clears all data from the WAL after a checkpoint.
    pub fn clear(&self) -> CoreResult<()> {
        self.truncate(0)
    }
}

impl std::fmt::Debug for WalManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalManager").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::types::{EntityTypeId, SequenceNumber, TableId, TransactionId};
    use boxdb_storage::InMemoryBackend;

    fn put(txid: u64, id: u64, payload: &[u8]) -> WalRecord {
        WalRecord::Put {
            txid: TransactionId::new(txid),
            table: TableId::entity(EntityTypeId::new(1)),
            object_id: id,
            payload: payload.to_vec(),
        }
    }

    fn commit(txid: u64, seq: u64) -> WalRecord {
        WalRecord::Commit {
            txid: TransactionId::new(txid),
            sequence: SequenceNumber::new(seq),
        }
    }

    #[test]
    fn append_batch_and_read_back() {
        let wal = WalManager::new(Box::new(InMemoryBackend::new()));
        let batch = vec![
            WalRecord::Begin {
                txid: TransactionId::new(1),
            },
            put(1, 1, b"one"),
            commit(1, 1),
        ];
        wal.append_batch(&batch).unwrap();

        let records: Vec<_> = wal.read_all().unwrap().into_iter().map(|(_, r)| r).collect();
        assert_eq!(records, batch);
        assert_eq!(wal.size().unwrap(), WalManager::framed_len(&batch).unwrap());
    }

    #[test]
    fn read_empty_wal() {
        let wal = WalManager::new(Box::new(InMemoryBackend::new()));
        assert!(wal.read_all().unwrap().is_empty());
    }

    #[test]
    fn truncated_tail_is_ignored() {
        let wal = WalManager::new(Box::new(InMemoryBackend::new()));
        wal.append(&put(1, 1, b"kept")).unwrap();
        let keep = wal.size().unwrap();
        wal.append(&put(2, 2, b"cut short")).unwrap();
        wal.truncate(wal.size().unwrap() - 3).unwrap();

        let records = wal.read_all().unwrap();
        assert_eq!(records.len(), 1);
        assert!(keep < wal.size().unwrap());
    }

    #[test]
    fn checksum_mismatch_is_fatal() {
        let mut bytes = Vec::new();
        WalManager::frame(&put(1, 1, b"payload"), &mut bytes).unwrap();
        let last = bytes.len() - 5;
        bytes[last] ^= 0xFF;
        let corrupt = WalManager::new(Box::new(InMemoryBackend::with_data(bytes)));

        let err = corrupt.read_all().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FileCorrupt);
    }

    #[test]
    fn bad_magic_is_fatal() {
        let corrupt = WalManager::new(Box::new(InMemoryBackend::with_data(vec![0u8; 32])));
        assert!(corrupt.read_all().unwrap_err().is_fatal());
    }

    #[test]
    fn clear_wal() {
        let wal = WalManager::new(Box::new(InMemoryBackend::new()));
        wal.append_batch(&[put(1, 1, b"x"), commit(1, 1)]).unwrap();
        wal.clear().unwrap();
        assert_eq!(wal.size().unwrap(), 0);
        assert!(wal.read_all().unwrap().is_empty());
    }
}
