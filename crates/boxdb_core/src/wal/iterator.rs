//! Streaming WAL record iterator.
//!
//! Reads one envelope at a time from the backend so replay memory stays
//! proportional to the largest record, not the log.

use crate::error::{CoreError, CoreResult};
use crate::wal::record::{compute_crc32, WalRecord, WalRecordType, WAL_MAGIC, WAL_VERSION};
use boxdb_storage::StorageBackend;
use parking_lot::MutexGuard;

/// magic (4) + version (2) + type (1) + length (4)
pub(crate) const HEADER_SIZE: usize = 11;

pub(crate) const CRC_SIZE: usize = 4;

/// A streaming iterator over WAL records.
///
/// A truncated header or payload at the tail ends iteration cleanly: it is
/// the remains of a write interrupted by a crash. Anything else that does
/// not check out (magic, version, type, CRC) is reported as corruption and
/// stops the iterator.
pub struct WalRecordIterator<'a> {
    backend: MutexGuard<'a, Box<dyn StorageBackend>>,
    total_size: u64,
    offset: u64,
    finished: bool,
}

impl<'a> WalRecordIterator<'a> {
    /// Creates an iterator starting at `start_offset`.
    pub fn new(
        backend: MutexGuard<'a, Box<dyn StorageBackend>>,
        start_offset: u64,
    ) -> CoreResult<Self> {
        let total_size = backend.size()?;
        Ok(Self {
            backend,
            total_size,
            offset: start_offset,
            finished: false,
        })
    }

    fn remaining(&self) -> u64 {
        self.total_size.saturating_sub(self.offset)
    }

    fn read_next(&mut self) -> CoreResult<Option<(u64, WalRecord)>> {
        let start = self.offset;
        if self.remaining() < HEADER_SIZE as u64 {
            return Ok(None);
        }

        let header = self.backend.read_at(start, HEADER_SIZE)?;
        if header[0..4] != WAL_MAGIC {
            return Err(CoreError::file_corrupt(format!(
                "invalid WAL magic at offset {start}"
            )));
        }
        let version = u16::from_le_bytes([header[4], header[5]]);
        if version == 0 || version > WAL_VERSION {
            return Err(CoreError::file_corrupt(format!(
                "unsupported WAL version {version} at offset {start}"
            )));
        }
        let type_byte = header[6];
        let record_type = WalRecordType::from_byte(type_byte).ok_or_else(|| {
            CoreError::file_corrupt(format!(
                "unknown WAL record type {type_byte} at offset {start}"
            ))
        })?;
        let len = u32::from_le_bytes([header[7], header[8], header[9], header[10]]) as usize;

        let total = (HEADER_SIZE + len + CRC_SIZE) as u64;
        if self.remaining() < total {
            tracing::debug!(offset = start, "ignoring truncated WAL tail");
            return Ok(None);
        }

        let body = self.backend.read_at(start + HEADER_SIZE as u64, len + CRC_SIZE)?;
        let (payload, crc_bytes) = body.split_at(len);
        let stored = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);

        let mut covered = header;
        covered.extend_from_slice(payload);
        let computed = compute_crc32(&covered);
        if stored != computed {
            return Err(CoreError::file_corrupt(format!(
                "WAL checksum mismatch at offset {start}: expected {stored:08x}, got {computed:08x}"
            )));
        }

        let record = WalRecord::decode_payload(record_type, payload)?;
        self.offset = start + total;
        Ok(Some((start, record)))
    }
}

impl Iterator for WalRecordIterator<'_> {
    type Item = CoreResult<(u64, WalRecord)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.read_next() {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}
