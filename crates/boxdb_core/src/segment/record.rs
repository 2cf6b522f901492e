//! Segment record types.

use crate::error::{CoreError, CoreResult};
use crate::types::{SequenceNumber, TableId};
use crate::wal::compute_crc32;

/// Flags for segment records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SegmentRecordFlags(u8);

impl SegmentRecordFlags {
    /// No flags set.
    pub const NONE: Self = Self(0);
    /// Record is a tombstone (row deleted).
    pub const TOMBSTONE: Self = Self(0x01);

    /// Creates new flags from raw byte.
    #[must_use]
    pub const fn from_byte(b: u8) -> Self {
        Self(b)
    }

    /// Returns the raw byte value.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self.0
    }

    /// Checks if tombstone flag is set.
    #[must_use]
    pub const fn is_tombstone(self) -> bool {
        self.0 & Self::TOMBSTONE.0 != 0
    }
}

/// One committed version of a row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentRecord {
    /// Table holding the row.
    pub table: TableId,
    /// Object ID, or source object ID for link rows.
    pub object_id: u64,
    /// Record flags.
    pub flags: SegmentRecordFlags,
    /// Commit that produced this version.
    pub sequence: SequenceNumber,
    /// Encoded object, or empty for a tombstone.
    pub payload: Vec<u8>,
}

impl SegmentRecord {
    /// record_len (4) + table (4) + object_id (8) + flags (1) + sequence (8)
    pub(crate) const HEADER_SIZE: usize = 25;
    pub(crate) const CRC_SIZE: usize = 4;

    /// Creates a new put record.
    #[must_use]
    pub fn put(table: TableId, object_id: u64, payload: Vec<u8>, sequence: SequenceNumber) -> Self {
        Self {
            table,
            object_id,
            flags: SegmentRecordFlags::NONE,
            sequence,
            payload,
        }
    }

    /// Creates a tombstone record.
    #[must_use]
    pub fn tombstone(table: TableId, object_id: u64, sequence: SequenceNumber) -> Self {
        Self {
            table,
            object_id,
            flags: SegmentRecordFlags::TOMBSTONE,
            sequence,
            payload: Vec::new(),
        }
    }

    /// Returns whether this is a tombstone.
    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        self.flags.is_tombstone()
    }

    /// Returns the encoded size of this record.
    #[must_use]
    pub fn encoded_size(&self) -> usize {
        Self::HEADER_SIZE + self.payload.len() + Self::CRC_SIZE
    }

    /// Appends the encoded record to `buf`.
    pub fn encode_into(&self, buf: &mut Vec<u8>) -> CoreResult<()> {
        let record_len = u32::try_from(self.encoded_size()).map_err(|_| {
            CoreError::illegal_argument(format!(
                "record of {} bytes exceeds the segment record limit",
                self.payload.len()
            ))
        })?;
        let start = buf.len();
        buf.reserve(record_len as usize);
        buf.extend_from_slice(&record_len.to_le_bytes());
        buf.extend_from_slice(&self.table.as_u32().to_le_bytes());
        buf.extend_from_slice(&self.object_id.to_le_bytes());
        buf.push(self.flags.as_byte());
        buf.extend_from_slice(&self.sequence.as_u64().to_le_bytes());
        buf.extend_from_slice(&self.payload);
        let crc = compute_crc32(&buf[start..]);
        buf.extend_from_slice(&crc.to_le_bytes());
        Ok(())
    }

    /// Encodes the record to bytes.
    pub fn encode(&self) -> CoreResult<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.encoded_size());
        self.encode_into(&mut buf)?;
        Ok(buf)
    }

    /// Decodes a record from bytes, verifying its checksum.
    pub fn decode(data: &[u8]) -> CoreResult<Self> {
        if data.len() < Self::HEADER_SIZE + Self::CRC_SIZE {
            return Err(CoreError::pages_corrupt("segment record too short"));
        }
        let record_len = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if record_len < Self::HEADER_SIZE + Self::CRC_SIZE || data.len() < record_len {
            return Err(CoreError::pages_corrupt(format!(
                "segment record length {record_len} is invalid"
            )));
        }

        let crc_at = record_len - Self::CRC_SIZE;
        let stored = u32::from_le_bytes([
            data[crc_at],
            data[crc_at + 1],
            data[crc_at + 2],
            data[crc_at + 3],
        ]);
        let computed = compute_crc32(&data[..crc_at]);
        if stored != computed {
            return Err(CoreError::pages_corrupt(format!(
                "checksum mismatch: expected {stored:08x}, got {computed:08x}"
            )));
        }

        let mut object_id = [0u8; 8];
        object_id.copy_from_slice(&data[8..16]);
        let mut sequence = [0u8; 8];
        sequence.copy_from_slice(&data[17..25]);

        Ok(Self {
            table: TableId::from_raw(u32::from_le_bytes([data[4], data[5], data[6], data[7]])),
            object_id: u64::from_le_bytes(object_id),
            flags: SegmentRecordFlags::from_byte(data[16]),
            sequence: SequenceNumber::new(u64::from_le_bytes(sequence)),
            payload: data[Self::HEADER_SIZE..crc_at].to_vec(),
        })
    }
}
