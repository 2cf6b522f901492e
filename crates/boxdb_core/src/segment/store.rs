//! Segment store with a multi-version row index.

use crate::error::{CoreError, CoreResult};
use crate::segment::record::SegmentRecord;
use crate::types::{SequenceNumber, TableId};
use boxdb_storage::StorageBackend;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::ops::RangeInclusive;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Version {
    sequence: SequenceNumber,
    offset: u64,
    tombstone: bool,
}

type RowKey = (TableId, u64);

/// Facts gathered while rebuilding the version index on open.
#[derive(Debug, Clone, Default)]
pub struct RecoveredSegments {
    /// Highest commit sequence found in the segment file.
    pub max_sequence: SequenceNumber,
    /// Highest row ID ever written per table, deleted rows included.
    pub max_ids: HashMap<TableId, u64>,
    /// Number of records scanned.
    pub records: usize,
    /// Bytes of an interrupted trailing write that were discarded.
    pub truncated_bytes: u64,
}

/// Manages the segment file and resolves row versions by snapshot.
///
/// Version chains are ordered by sequence. A reader at snapshot `s` sees
/// the newest version with sequence `<= s`; a tombstone hides the row.
/// Chains are pruned against the oldest live snapshot.
pub struct SegmentManager {
    backend: RwLock<Box<dyn StorageBackend>>,
    versions: RwLock<BTreeMap<RowKey, Vec<Version>>>,
}

fn table_range(table: TableId) -> RangeInclusive<RowKey> {
    (table, 0)..=(table, u64::MAX)
}

fn visible(chain: &[Version], snapshot: SequenceNumber) -> Option<Version> {
    chain
        .iter()
        .rev()
        .find(|v| v.sequence <= snapshot)
        .copied()
        .filter(|v| !v.tombstone)
}

impl SegmentManager {
    /// Creates a new segment manager.
    pub fn new(backend: Box<dyn StorageBackend>) -> Self {
        Self {
            backend: RwLock::new(backend),
            versions: RwLock::new(BTreeMap::new()),
        }
    }

    fn insert_version(chain: &mut Vec<Version>, version: Version) {
        match chain.binary_search_by_key(&version.sequence, |v| v.sequence) {
            // the same commit replayed twice: keep the later copy
            Ok(pos) => chain[pos] = version,
            Err(pos) => chain.insert(pos, version),
        }
    }

    /// Appends a single record.
    pub fn append(&self, record: &SegmentRecord) -> CoreResult<u64> {
        self.append_batch(std::slice::from_ref(record))
    }

    /// Appends records with a single backend write and makes them visible
    /// to snapshots at or after their sequence. Returns the first offset.
    pub fn append_batch(&self, records: &[SegmentRecord]) -> CoreResult<u64> {
        let mut data = Vec::new();
        let mut offsets = Vec::with_capacity(records.len());
        for record in records {
            offsets.push(data.len() as u64);
            record.encode_into(&mut data)?;
        }

        // backend lock is released before the index lock is taken
        let base = self.backend.write().append(&data)?;

        let mut versions = self.versions.write();
        for (record, rel) in records.iter().zip(offsets) {
            let chain = versions.entry((record.table, record.object_id)).or_default();
            Self::insert_version(
                chain,
                Version {
                    sequence: record.sequence,
                    offset: base + rel,
                    tombstone: record.is_tombstone(),
                },
            );
        }
        Ok(base)
    }

    /// Reads a record at a specific offset.
    pub fn read_at(&self, offset: u64) -> CoreResult<SegmentRecord> {
        let backend = self.backend.read();
        let size = backend.size()?;
        if offset + 4 > size {
            return Err(CoreError::pages_corrupt(format!(
                "offset {offset} beyond segment end {size}"
            )));
        }
        let record_len = backend.read_u32_le(offset)? as u64;
        if offset + record_len > size {
            return Err(CoreError::pages_corrupt(format!(
                "record at {offset} extends beyond segment end"
            )));
        }
        let data = backend.read_at(offset, record_len as usize)?;
        SegmentRecord::decode(&data)
    }

    fn visible_version(
        &self,
        table: TableId,
        object_id: u64,
        snapshot: SequenceNumber,
    ) -> Option<Version> {
        self.versions
            .read()
            .get(&(table, object_id))
            .and_then(|chain| visible(chain, snapshot))
    }

    /// Returns the payload of the row visible at `snapshot`.
    pub fn get_at(
        &self,
        table: TableId,
        object_id: u64,
        snapshot: SequenceNumber,
    ) -> CoreResult<Option<Vec<u8>>> {
        match self.visible_version(table, object_id, snapshot) {
            Some(version) => Ok(Some(self.read_at(version.offset)?.payload)),
            None => Ok(None),
        }
    }

    /// Returns true if the row exists at `snapshot`.
    pub fn contains_at(&self, table: TableId, object_id: u64, snapshot: SequenceNumber) -> bool {
        self.visible_version(table, object_id, snapshot).is_some()
    }

    /// Returns the IDs of all rows of `table` visible at `snapshot`, ascending.
    pub fn ids_at(&self, table: TableId, snapshot: SequenceNumber) -> Vec<u64> {
        self.versions
            .read()
            .range(table_range(table))
            .filter(|(_, chain)| visible(chain, snapshot).is_some())
            .map(|((_, id), _)| *id)
            .collect()
    }

    /// Returns all rows of `table` visible at `snapshot`, ascending by ID.
    pub fn scan_at(
        &self,
        table: TableId,
        snapshot: SequenceNumber,
    ) -> CoreResult<Vec<(u64, Vec<u8>)>> {
        let located: Vec<(u64, u64)> = self
            .versions
            .read()
            .range(table_range(table))
            .filter_map(|((_, id), chain)| visible(chain, snapshot).map(|v| (*id, v.offset)))
            .collect();

        located
            .into_iter()
            .map(|(id, offset)| Ok((id, self.read_at(offset)?.payload)))
            .collect()
    }

    /// Counts visible rows of `table`, stopping at `limit` (0 = no limit).
    pub fn count_at(&self, table: TableId, snapshot: SequenceNumber, limit: u64) -> u64 {
        let versions = self.versions.read();
        let visible_rows = versions
            .range(table_range(table))
            .filter(|(_, chain)| visible(chain, snapshot).is_some());
        if limit == 0 {
            visible_rows.count() as u64
        } else {
            visible_rows.take(limit as usize).count() as u64
        }
    }

    /// Drops versions no live snapshot can see any more.
    ///
    /// Every snapshot at or after `horizon` resolves a row to its newest
    /// version `<= horizon` or something newer, so older versions go. A
    /// row whose only remaining version is a tombstone is forgotten.
    pub fn prune<I>(&self, keys: I, horizon: SequenceNumber)
    where
        I: IntoIterator<Item = RowKey>,
    {
        let mut versions = self.versions.write();
        for key in keys {
            let remove = match versions.get_mut(&key) {
                Some(chain) => Self::prune_chain(chain, horizon),
                None => false,
            };
            if remove {
                versions.remove(&key);
            }
        }
    }

    /// Prunes every chain against `horizon`.
    pub fn prune_all(&self, horizon: SequenceNumber) {
        let mut versions = self.versions.write();
        versions.retain(|_, chain| !Self::prune_chain(chain, horizon));
    }

    /// Returns true if the whole chain can be dropped.
    fn prune_chain(chain: &mut Vec<Version>, horizon: SequenceNumber) -> bool {
        if let Some(keep_from) = chain.iter().rposition(|v| v.sequence <= horizon) {
            chain.drain(..keep_from);
        }
        chain.len() == 1 && chain[0].tombstone && chain[0].sequence <= horizon
    }

    /// Number of versions held in memory, for diagnostics.
    pub fn version_count(&self) -> usize {
        self.versions.read().values().map(Vec::len).sum()
    }

    /// Rebuilds the version index from the segment file.
    ///
    /// An incomplete record at the end of the file is the remains of an
    /// interrupted apply; it is cut off so later appends start on a record
    /// boundary. A checksum failure anywhere else is fatal.
    pub fn rebuild_index(&self) -> CoreResult<RecoveredSegments> {
        let mut backend = self.backend.write();
        let size = backend.size()?;

        let mut recovered = RecoveredSegments::default();
        let mut versions: BTreeMap<RowKey, Vec<Version>> = BTreeMap::new();
        let mut offset = 0u64;

        while offset < size {
            if offset + 4 > size {
                break;
            }
            let record_len = u64::from(backend.read_u32_le(offset)?);
            if record_len < (SegmentRecord::HEADER_SIZE + SegmentRecord::CRC_SIZE) as u64 {
                return Err(CoreError::pages_corrupt(format!(
                    "invalid record length {record_len} at offset {offset}"
                )));
            }
            if offset + record_len > size {
                break;
            }
            let data = backend.read_at(offset, record_len as usize)?;
            let record = SegmentRecord::decode(&data).map_err(|e| {
                CoreError::pages_corrupt(format!("record at offset {offset}: {e}"))
            })?;

            recovered.records += 1;
            recovered.max_sequence = recovered.max_sequence.max(record.sequence);
            let max_id = recovered.max_ids.entry(record.table).or_insert(0);
            *max_id = (*max_id).max(record.object_id);

            Self::insert_version(
                versions.entry((record.table, record.object_id)).or_default(),
                Version {
                    sequence: record.sequence,
                    offset,
                    tombstone: record.is_tombstone(),
                },
            );
            offset += record_len;
        }

        if offset < size {
            recovered.truncated_bytes = size - offset;
            tracing::warn!(
                offset,
                discarded = recovered.truncated_bytes,
                "discarding incomplete segment tail"
            );
            backend.truncate(offset)?;
        }

        *self.versions.write() = versions;
        Ok(recovered)
    }

    /// Flushes all pending writes.
    pub fn flush(&self) -> CoreResult<()> {
        self.backend.write().flush()?;
        Ok(())
    }

    /// Flushes and fsyncs the segment file.
    pub fn sync(&self) -> CoreResult<()> {
        self.backend.write().sync()?;
        Ok(())
    }

    /// Returns the current segment size.
    pub fn size(&self) -> CoreResult<u64> {
        Ok(self.backend.read().size()?)
    }
}

impl std::fmt::Debug for SegmentManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentManager")
            .field("versions", &self.version_count())
            .finish_non_exhaustive()
    }
}
