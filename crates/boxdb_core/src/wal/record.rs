//! WAL record types and serialization.

use crate::error::{CoreError, CoreResult};
use crate::types::{SequenceNumber, TableId, TransactionId};

/// Magic bytes identifying a WAL record.
pub const WAL_MAGIC: [u8; 4] = *b"BWAL";

/// Current WAL format version.
pub const WAL_VERSION: u16 = 1;

/// Type of WAL record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WalRecordType {
    /// Start of a committing transaction.
    Begin = 1,
    /// Put (insert or replace) an object or link row.
    Put = 2,
    /// Delete an object or link row.
    Delete = 3,
    /// Commit a transaction.
    Commit = 4,
    /// Checkpoint marker.
    Checkpoint = 6,
}

impl WalRecordType {
    /// Converts a byte to a record type.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Begin),
            2 => Some(Self::Put),
            3 => Some(Self::Delete),
            4 => Some(Self::Commit),
            6 => Some(Self::Checkpoint),
            _ => None,
        }
    }

    /// Converts the record type to a byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }
}

/// A logged storage operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalRecord {
    /// Start of a committing transaction.
    Begin {
        /// Transaction ID.
        txid: TransactionId,
    },

    /// Put an object or link row.
    Put {
        /// Transaction ID.
        txid: TransactionId,
        /// Table receiving the row.
        table: TableId,
        /// Object ID (source object ID for link rows).
        object_id: u64,
        /// Encoded record.
        payload: Vec<u8>,
    },

    /// Delete an object or link row.
    Delete {
        /// Transaction ID.
        txid: TransactionId,
        /// Table holding the row.
        table: TableId,
        /// Object ID.
        object_id: u64,
    },

    /// Commit a transaction.
    Commit {
        /// Transaction ID.
        txid: TransactionId,
        /// Sequence number assigned to this commit.
        sequence: SequenceNumber,
    },

    /// Checkpoint marker.
    Checkpoint {
        /// Sequence number covered by the checkpoint.
        sequence: SequenceNumber,
    },
}

impl WalRecord {
    /// Returns the record type.
    #[must_use]
    pub fn record_type(&self) -> WalRecordType {
        match self {
            Self::Begin { .. } => WalRecordType::Begin,
            Self::Put { .. } => WalRecordType::Put,
            Self::Delete { .. } => WalRecordType::Delete,
            Self::Commit { .. } => WalRecordType::Commit,
            Self::Checkpoint { .. } => WalRecordType::Checkpoint,
        }
    }

    /// Returns the transaction ID if this record is associated with one.
    #[must_use]
    pub fn txid(&self) -> Option<TransactionId> {
        match self {
            Self::Begin { txid }
            | Self::Put { txid, .. }
            | Self::Delete { txid, .. }
            | Self::Commit { txid, .. } => Some(*txid),
            Self::Checkpoint { .. } => None,
        }
    }

    /// Serializes the record payload (without envelope).
    pub fn encode_payload(&self) -> CoreResult<Vec<u8>> {
        let mut buf = Vec::new();
        match self {
            Self::Begin { txid } => {
                buf.extend_from_slice(&txid.as_u64().to_le_bytes());
            }
            Self::Put {
                txid,
                table,
                object_id,
                payload,
            } => {
                let len = u32::try_from(payload.len()).map_err(|_| {
                    CoreError::illegal_argument(format!(
                        "record of {} bytes is too large to log",
                        payload.len()
                    ))
                })?;
                buf.reserve(24 + payload.len());
                buf.extend_from_slice(&txid.as_u64().to_le_bytes());
                buf.extend_from_slice(&table.as_u32().to_le_bytes());
                buf.extend_from_slice(&object_id.to_le_bytes());
                buf.extend_from_slice(&len.to_le_bytes());
                buf.extend_from_slice(payload);
            }
            Self::Delete {
                txid,
                table,
                object_id,
            } => {
                buf.extend_from_slice(&txid.as_u64().to_le_bytes());
                buf.extend_from_slice(&table.as_u32().to_le_bytes());
                buf.extend_from_slice(&object_id.to_le_bytes());
            }
            Self::Commit { txid, sequence } => {
                buf.extend_from_slice(&txid.as_u64().to_le_bytes());
                buf.extend_from_slice(&sequence.as_u64().to_le_bytes());
            }
            Self::Checkpoint { sequence } => {
                buf.extend_from_slice(&sequence.as_u64().to_le_bytes());
            }
        }
        Ok(buf)
    }

    /// Deserializes a record from its type and payload.
    pub fn decode_payload(record_type: WalRecordType, payload: &[u8]) -> CoreResult<Self> {
        let mut cursor = Cursor { buf: payload, pos: 0 };
        let record = match record_type {
            WalRecordType::Begin => Self::Begin {
                txid: TransactionId::new(cursor.u64()?),
            },
            WalRecordType::Put => {
                let txid = TransactionId::new(cursor.u64()?);
                let table = TableId::from_raw(cursor.u32()?);
                let object_id = cursor.u64()?;
                let len = cursor.u32()? as usize;
                let payload = cursor.bytes(len)?.to_vec();
                Self::Put {
                    txid,
                    table,
                    object_id,
                    payload,
                }
            }
            WalRecordType::Delete => Self::Delete {
                txid: TransactionId::new(cursor.u64()?),
                table: TableId::from_raw(cursor.u32()?),
                object_id: cursor.u64()?,
            },
            WalRecordType::Commit => Self::Commit {
                txid: TransactionId::new(cursor.u64()?),
                sequence: SequenceNumber::new(cursor.u64()?),
            },
            WalRecordType::Checkpoint => Self::Checkpoint {
                sequence: SequenceNumber::new(cursor.u64()?),
            },
        };
        if cursor.pos != payload.len() {
            return Err(CoreError::file_corrupt(format!(
                "trailing bytes in {record_type:?} record: expected {} bytes, got {}",
                cursor.pos,
                payload.len()
            )));
        }
        Ok(record)
    }
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn bytes(&mut self, len: usize) -> CoreResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| CoreError::file_corrupt("unexpected end of WAL payload"))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u32(&mut self) -> CoreResult<u32> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.bytes(4)?);
        Ok(u32::from_le_bytes(raw))
    }

    fn u64(&mut self) -> CoreResult<u64> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.bytes(8)?);
        Ok(u64::from_le_bytes(raw))
    }
}

/// Computes CRC32 checksum for data.
pub fn compute_crc32(data: &[u8]) -> u32 {
    // IEEE polynomial, reflected
    const CRC32_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xEDB8_8320;
                } else {
                    crc >>= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        let index = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[index];
    }
    !crc
}
