//! Transaction manager.

use crate::change_feed::{ChangeSet, ChangeType, ObjectChange};
use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::index::{IndexChange, IndexEngine};
use crate::manifest::Manifest;
use crate::schema::Model;
use crate::segment::{SegmentManager, SegmentRecord};
use crate::transaction::state::{PendingWrite, RowKey, Transaction, TransactionKind};
use crate::types::{EntityTypeId, SequenceNumber, TableId, TransactionId};
use crate::wal::{WalManager, WalRecord};
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

/// Resource limits applied by the manager.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Limits {
    pub max_readers: usize,
    pub max_db_size: u64,
    pub write_lock_timeout: Option<Duration>,
    pub sync_on_commit: bool,
}

impl Limits {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_readers: config.max_readers,
            max_db_size: config.max_db_size,
            write_lock_timeout: config.write_lock_timeout,
            sync_on_commit: config.sync_on_commit,
        }
    }
}

/// Outcome of a successful commit.
#[derive(Debug, Clone)]
pub(crate) struct CommitInfo {
    pub changes: ChangeSet,
    pub wal_size: u64,
}

/// What recovery found when the store was opened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Committed sequence after recovery.
    pub committed: SequenceNumber,
    /// Segment records found on disk.
    pub segment_records: usize,
    /// Commits re-applied from the WAL.
    pub replayed_commits: usize,
    /// Bytes of an interrupted segment write that were cut off.
    pub truncated_bytes: u64,
}

/// Coordinates transactions over the WAL, segments and indexes.
///
/// - One writer at a time, tracked by thread so a thread cannot deadlock
///   on itself.
/// - Readers register their snapshot; versions older than the oldest
///   registered snapshot are pruned after each commit.
/// - Commit order: WAL (flushed, optionally synced), then segments, then
///   indexes, then the committed sequence is published. A failure after
///   the WAL write poisons the manager; the store must be reopened and
///   recovery finishes the commit from the log.
pub struct TransactionManager {
    model: Arc<Model>,
    wal: WalManager,
    segments: SegmentManager,
    indexes: IndexEngine,
    limits: Limits,
    next_txid: AtomicU64,
    committed_seq: AtomicU64,
    writer: Mutex<Option<ThreadId>>,
    writer_released: Condvar,
    readers: Mutex<BTreeMap<SequenceNumber, usize>>,
    id_sequences: Mutex<HashMap<EntityTypeId, u64>>,
    poisoned: Mutex<Option<String>>,
}

impl TransactionManager {
    /// Creates a manager over empty state; call `recover` before use.
    pub(crate) fn new(
        model: Arc<Model>,
        wal: WalManager,
        segments: SegmentManager,
        limits: Limits,
    ) -> Self {
        let indexes = IndexEngine::new(Arc::clone(&model));
        Self {
            model,
            wal,
            segments,
            indexes,
            limits,
            next_txid: AtomicU64::new(1),
            committed_seq: AtomicU64::new(0),
            writer: Mutex::new(None),
            writer_released: Condvar::new(),
            readers: Mutex::new(BTreeMap::new()),
            id_sequences: Mutex::new(HashMap::new()),
            poisoned: Mutex::new(None),
        }
    }

    /// Returns the schema model.
    pub fn model(&self) -> &Arc<Model> {
        &self.model
    }

    pub(crate) fn segments(&self) -> &SegmentManager {
        &self.segments
    }

    pub(crate) fn indexes(&self) -> &IndexEngine {
        &self.indexes
    }

    /// Returns the latest committed sequence.
    pub fn committed(&self) -> SequenceNumber {
        SequenceNumber::new(self.committed_seq.load(Ordering::SeqCst))
    }

    /// Number of registered read transactions.
    pub fn reader_count(&self) -> usize {
        self.readers.lock().values().sum()
    }

    /// Current size of the WAL and segment files.
    pub fn storage_size(&self) -> CoreResult<u64> {
        Ok(self.wal.size()? + self.segments.size()?)
    }

    /// Fails with `StoreMustShutdown` once a fatal error was seen.
    pub fn ensure_healthy(&self) -> CoreResult<()> {
        match self.poisoned.lock().as_ref() {
            Some(reason) => Err(CoreError::must_shutdown(reason.clone())),
            None => Ok(()),
        }
    }

    fn poison(&self, stage: &str, error: &CoreError) -> CoreError {
        let reason = format!("{stage} failed: {error}");
        tracing::error!(%reason, "store poisoned");
        let mut poisoned = self.poisoned.lock();
        poisoned.get_or_insert_with(|| reason.clone());
        CoreError::must_shutdown(reason)
    }

    fn allocate_txid(&self) -> TransactionId {
        TransactionId::new(self.next_txid.fetch_add(1, Ordering::SeqCst))
    }

    /// Begins a read transaction on the latest committed snapshot.
    pub fn begin_read(self: &Arc<Self>) -> CoreResult<Transaction> {
        self.ensure_healthy()?;
        let snapshot = {
            let mut readers = self.readers.lock();
            let active: usize = readers.values().sum();
            if self.limits.max_readers > 0 && active >= self.limits.max_readers {
                return Err(CoreError::MaxReadersExceeded {
                    max: self.limits.max_readers,
                });
            }
            // loaded under the readers lock so pruning cannot overtake it
            let snapshot = self.committed();
            *readers.entry(snapshot).or_insert(0) += 1;
            snapshot
        };
        let txid = self.allocate_txid();
        tracing::debug!(%txid, %snapshot, "read transaction started");
        Ok(Transaction::new(
            Arc::clone(self),
            txid,
            TransactionKind::Read,
            snapshot,
        ))
    }

    /// Begins the write transaction, waiting for the writer slot.
    ///
    /// Blocks while another thread writes, or gives up with `WriterBusy`
    /// after the configured timeout. Fails with `IllegalState` if the
    /// calling thread already holds the slot.
    pub fn begin_write(self: &Arc<Self>) -> CoreResult<Transaction> {
        self.ensure_healthy()?;
        self.acquire_writer()?;
        if let Err(e) = self.ensure_healthy() {
            self.release_writer();
            return Err(e);
        }
        let txid = self.allocate_txid();
        let snapshot = self.committed();
        tracing::debug!(%txid, %snapshot, "write transaction started");
        Ok(Transaction::new(
            Arc::clone(self),
            txid,
            TransactionKind::Write,
            snapshot,
        ))
    }

    fn acquire_writer(&self) -> CoreResult<()> {
        let me = thread::current().id();
        let mut writer = self.writer.lock();
        if *writer == Some(me) {
            return Err(CoreError::illegal_state(
                "this thread already holds the write transaction",
            ));
        }
        match self.limits.write_lock_timeout {
            None => {
                while writer.is_some() {
                    self.writer_released.wait(&mut writer);
                }
            }
            Some(timeout) => {
                let start = Instant::now();
                while writer.is_some() {
                    let waited = start.elapsed();
                    if waited >= timeout {
                        return Err(CoreError::WriterBusy { waited });
                    }
                    let result = self.writer_released.wait_for(&mut writer, timeout - waited);
                    if result.timed_out() && writer.is_some() {
                        return Err(CoreError::WriterBusy {
                            waited: start.elapsed(),
                        });
                    }
                }
            }
        }
        *writer = Some(me);
        Ok(())
    }

    fn try_acquire_writer(&self) -> bool {
        let mut writer = self.writer.lock();
        if writer.is_some() {
            return false;
        }
        *writer = Some(thread::current().id());
        true
    }

    pub(crate) fn release_writer(&self) {
        *self.writer.lock() = None;
        self.writer_released.notify_one();
    }

    pub(crate) fn release_reader(&self, snapshot: SequenceNumber) {
        let mut readers = self.readers.lock();
        if let Some(count) = readers.get_mut(&snapshot) {
            *count -= 1;
            if *count == 0 {
                readers.remove(&snapshot);
            }
        }
    }

    /// Oldest snapshot any reader can still ask for.
    fn horizon(readers: &BTreeMap<SequenceNumber, usize>, committed: SequenceNumber) -> SequenceNumber {
        readers
            .keys()
            .next()
            .map_or(committed, |oldest| (*oldest).min(committed))
    }

    pub(crate) fn next_id(&self, entity: EntityTypeId) -> CoreResult<u64> {
        let mut sequences = self.id_sequences.lock();
        let current = sequences.entry(entity).or_insert(0);
        *current = current
            .checked_add(1)
            .ok_or_else(|| CoreError::overflow(format!("object IDs of {entity} exhausted")))?;
        Ok(*current)
    }

    pub(crate) fn observe_id(&self, entity: EntityTypeId, id: u64) {
        let mut sequences = self.id_sequences.lock();
        let current = sequences.entry(entity).or_insert(0);
        if id > *current {
            *current = id;
        }
    }

    /// Applies the writes of the write transaction `txid`.
    ///
    /// The caller holds the writer slot, so `snapshot` is the latest
    /// committed sequence.
    pub(crate) fn commit(
        &self,
        txid: TransactionId,
        snapshot: SequenceNumber,
        writes: BTreeMap<RowKey, PendingWrite>,
    ) -> CoreResult<CommitInfo> {
        self.ensure_healthy()?;
        let sequence = snapshot.next();

        let mut previous = Vec::with_capacity(writes.len());
        let mut records = Vec::with_capacity(writes.len());
        for ((table, id), write) in writes {
            let old = self.segments.get_at(table, id, snapshot)?;
            let record = match write {
                PendingWrite::Put(payload) => SegmentRecord::put(table, id, payload, sequence),
                // deleting a row the snapshot never had
                PendingWrite::Delete if old.is_none() => continue,
                PendingWrite::Delete => SegmentRecord::tombstone(table, id, sequence),
            };
            previous.push(old);
            records.push(record);
        }

        if records.is_empty() {
            return Ok(CommitInfo {
                changes: ChangeSet {
                    sequence: snapshot,
                    ..ChangeSet::default()
                },
                wal_size: self.wal.size()?,
            });
        }

        let mut by_entity: BTreeMap<EntityTypeId, Vec<IndexChange<'_>>> = BTreeMap::new();
        for (record, old) in records.iter().zip(&previous) {
            if let Some(entity) = record.table.entity_type() {
                by_entity.entry(entity).or_default().push(IndexChange {
                    id: record.object_id,
                    old: old.as_deref(),
                    new: (!record.is_tombstone()).then_some(record.payload.as_slice()),
                });
            }
        }
        for (entity, changes) in &by_entity {
            self.indexes.check_unique(*entity, changes)?;
        }

        let mut log = Vec::with_capacity(records.len() + 2);
        log.push(WalRecord::Begin { txid });
        for record in &records {
            log.push(if record.is_tombstone() {
                WalRecord::Delete {
                    txid,
                    table: record.table,
                    object_id: record.object_id,
                }
            } else {
                WalRecord::Put {
                    txid,
                    table: record.table,
                    object_id: record.object_id,
                    payload: record.payload.clone(),
                }
            });
        }
        log.push(WalRecord::Commit { txid, sequence });

        let wal_before = self.wal.size()?;
        let log_len = WalManager::framed_len(&log)?;
        if self.limits.max_db_size > 0 {
            let segment_len: u64 = records.iter().map(|r| r.encoded_size() as u64).sum();
            let required = self.segments.size()? + wal_before + log_len + segment_len;
            if required > self.limits.max_db_size {
                return Err(CoreError::DbFull {
                    limit: self.limits.max_db_size,
                    required,
                });
            }
        }

        self.write_log(&log, wal_before)?;

        if let Err(e) = self.segments.append_batch(&records) {
            return Err(self.poison("segment apply", &e));
        }
        for (entity, changes) in &by_entity {
            if let Err(e) = self.indexes.apply(*entity, changes, sequence) {
                return Err(self.poison("index update", &e));
            }
        }
        self.indexes.advance(sequence);
        self.committed_seq.store(sequence.as_u64(), Ordering::SeqCst);

        {
            let readers = self.readers.lock();
            let horizon = Self::horizon(&readers, sequence);
            self.segments
                .prune(records.iter().map(|r| (r.table, r.object_id)), horizon);
        }

        let changes = self.change_set(sequence, &records);
        tracing::debug!(%txid, %sequence, rows = records.len(), "transaction committed");
        Ok(CommitInfo {
            changes,
            wal_size: wal_before + log_len,
        })
    }

    /// Appends a commit to the WAL, cutting it off again on failure.
    fn write_log(&self, log: &[WalRecord], rollback_to: u64) -> CoreResult<()> {
        let written = self
            .wal
            .append_batch(log)
            .and_then(|_| self.wal.flush())
            .and_then(|()| {
                if self.limits.sync_on_commit {
                    self.wal.sync()
                } else {
                    Ok(())
                }
            });
        if let Err(e) = written {
            if let Err(undo) = self.wal.truncate(rollback_to) {
                self.poison("WAL rollback", &undo);
            }
            return Err(e);
        }
        Ok(())
    }

    fn change_set(&self, sequence: SequenceNumber, records: &[SegmentRecord]) -> ChangeSet {
        let mut touched = BTreeSet::new();
        let mut changes = Vec::new();
        for record in records {
            if let Some(entity) = record.table.entity_type() {
                touched.insert(entity);
                changes.push(ObjectChange {
                    entity_type: entity,
                    object_id: record.object_id,
                    change_type: if record.is_tombstone() {
                        ChangeType::Remove
                    } else {
                        ChangeType::Put
                    },
                });
            } else if let Some(relation) = record
                .table
                .relation_id()
                .and_then(|id| self.model.relation(id).ok())
            {
                touched.insert(relation.source);
                touched.insert(relation.target);
            }
        }
        ChangeSet {
            sequence,
            changes,
            touched: touched.into_iter().collect(),
        }
    }

    /// Rebuilds in-memory state from disk.
    ///
    /// Segments are scanned first. WAL commits at or after the newest
    /// sequence found there are then re-applied; re-applying the last one
    /// completes a commit whose segment write was interrupted. Commits
    /// without a commit record are ignored.
    pub(crate) fn recover(&self, manifest: &Manifest) -> CoreResult<RecoveryReport> {
        let recovered = self.segments.rebuild_index()?;
        let mut max_ids = recovered.max_ids.clone();
        let mut committed = recovered.max_sequence.max(manifest.last_checkpoint);
        let mut replayed = 0;

        let mut open: HashMap<TransactionId, Vec<(TableId, u64, Option<Vec<u8>>)>> =
            HashMap::new();
        for entry in self.wal.iter()? {
            let (_, record) = entry?;
            match record {
                WalRecord::Begin { txid } => {
                    open.insert(txid, Vec::new());
                }
                WalRecord::Put {
                    txid,
                    table,
                    object_id,
                    payload,
                } => open
                    .entry(txid)
                    .or_default()
                    .push((table, object_id, Some(payload))),
                WalRecord::Delete {
                    txid,
                    table,
                    object_id,
                } => open.entry(txid).or_default().push((table, object_id, None)),
                WalRecord::Commit { txid, sequence } => {
                    let Some(ops) = open.remove(&txid) else {
                        continue;
                    };
                    if sequence < recovered.max_sequence {
                        continue;
                    }
                    let records: Vec<SegmentRecord> = ops
                        .into_iter()
                        .map(|(table, id, payload)| {
                            let max = max_ids.entry(table).or_insert(0);
                            *max = (*max).max(id);
                            match payload {
                                Some(payload) => SegmentRecord::put(table, id, payload, sequence),
                                None => SegmentRecord::tombstone(table, id, sequence),
                            }
                        })
                        .collect();
                    self.segments.append_batch(&records)?;
                    committed = committed.max(sequence);
                    replayed += 1;
                }
                WalRecord::Checkpoint { .. } => {}
            }
        }
        if !open.is_empty() {
            tracing::debug!(
                transactions = open.len(),
                "discarding uncommitted WAL transactions"
            );
        }

        self.committed_seq.store(committed.as_u64(), Ordering::SeqCst);
        for entity in self.model.entities() {
            let rows = self.segments.scan_at(TableId::entity(entity.id), committed)?;
            self.indexes.rebuild_entity(entity.id, &rows, committed)?;
        }
        self.indexes.advance(committed);

        let mut sequences = self.id_sequences.lock();
        for entity in self.model.entities() {
            let stored = manifest.id_sequences.get(&entity.id).copied().unwrap_or(0);
            let seen = max_ids
                .get(&TableId::entity(entity.id))
                .copied()
                .unwrap_or(0);
            sequences.insert(entity.id, stored.max(seen));
        }

        let report = RecoveryReport {
            committed,
            segment_records: recovered.records,
            replayed_commits: replayed,
            truncated_bytes: recovered.truncated_bytes,
        };
        tracing::info!(
            committed = %report.committed,
            records = report.segment_records,
            replayed = report.replayed_commits,
            "recovery complete"
        );
        Ok(report)
    }

    /// Makes all committed state durable in the segments, hands the
    /// committed sequence and ID sequences to `persist`, then empties the
    /// WAL. Waits for the writer slot.
    pub(crate) fn checkpoint<F>(&self, persist: F) -> CoreResult<SequenceNumber>
    where
        F: FnOnce(SequenceNumber, BTreeMap<EntityTypeId, u64>) -> CoreResult<()>,
    {
        self.acquire_writer()?;
        let result = self.checkpoint_locked(persist);
        self.release_writer();
        result
    }

    /// Like `checkpoint`, but skips if a writer is active.
    pub(crate) fn try_checkpoint<F>(&self, persist: F) -> CoreResult<Option<SequenceNumber>>
    where
        F: FnOnce(SequenceNumber, BTreeMap<EntityTypeId, u64>) -> CoreResult<()>,
    {
        if !self.try_acquire_writer() {
            return Ok(None);
        }
        let result = self.checkpoint_locked(persist);
        self.release_writer();
        result.map(Some)
    }

    fn checkpoint_locked<F>(&self, persist: F) -> CoreResult<SequenceNumber>
    where
        F: FnOnce(SequenceNumber, BTreeMap<EntityTypeId, u64>) -> CoreResult<()>,
    {
        self.ensure_healthy()?;
        let sequence = self.committed();
        self.segments.flush()?;
        self.segments.sync()?;

        let sequences: BTreeMap<EntityTypeId, u64> = self
            .id_sequences
            .lock()
            .iter()
            .map(|(entity, id)| (*entity, *id))
            .collect();
        persist(sequence, sequences)?;

        self.wal.clear()?;
        self.wal.append(&WalRecord::Checkpoint { sequence })?;
        self.wal.sync()?;

        let readers = self.readers.lock();
        self.segments.prune_all(Self::horizon(&readers, sequence));
        drop(readers);

        tracing::info!(%sequence, "checkpoint complete");
        Ok(sequence)
    }
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("committed", &self.committed())
            .field("readers", &self.reader_count())
            .field("writer", &self.writer.lock().is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::schema::{EntityBuilder, ModelBuilder, PropertyFlags};
    use boxdb_codec::{PropertyType, RecordBuilder, Value};
    use boxdb_storage::InMemoryBackend;

    const ITEM: EntityTypeId = EntityTypeId::new(1);
    const ITEMS: TableId = TableId::entity(ITEM);

    fn model() -> Arc<Model> {
        Arc::new(
            ModelBuilder::new()
                .entity(
                    EntityBuilder::new(1, "Item")
                        .id_property(1, "id")
                        .property_with_flags(
                            2,
                            "code",
                            PropertyType::String,
                            PropertyFlags::UNIQUE,
                        ),
                )
                .build()
                .unwrap(),
        )
    }

    fn limits() -> Limits {
        Limits::from_config(&Config::default())
    }

    pub(crate) fn memory_manager() -> Arc<TransactionManager> {
        manager_with(limits())
    }

    fn manager_with(limits: Limits) -> Arc<TransactionManager> {
        let manager = TransactionManager::new(
            model(),
            WalManager::new(Box::new(InMemoryBackend::new())),
            SegmentManager::new(Box::new(InMemoryBackend::new())),
            limits,
        );
        manager.recover(&Manifest::new()).unwrap();
        Arc::new(manager)
    }

    fn item(id: u64, code: &str) -> Vec<u8> {
        RecordBuilder::from_values(&[
            (1, PropertyType::Long, Value::Int(id as i64)),
            (2, PropertyType::String, Value::Text(code.into())),
        ])
        .unwrap()
    }

    #[test]
    fn commit_publishes_sequence_and_changes() {
        let manager = memory_manager();
        let txn = manager.begin_write().unwrap();
        txn.put(ITEMS, 1, item(1, "a")).unwrap();
        let info = txn.commit().unwrap();

        assert_eq!(manager.committed(), SequenceNumber::new(1));
        assert_eq!(info.changes.sequence, SequenceNumber::new(1));
        assert_eq!(info.changes.touched, vec![ITEM]);
        assert_eq!(info.changes.changes[0].change_type, ChangeType::Put);
        assert!(info.wal_size > 0);
    }

    #[test]
    fn empty_commit_changes_nothing() {
        let manager = memory_manager();
        let txn = manager.begin_write().unwrap();
        assert!(!txn.delete(ITEMS, 5).unwrap());
        let info = txn.commit().unwrap();
        assert!(info.changes.is_empty());
        assert_eq!(manager.committed(), SequenceNumber::new(0));
    }

    #[test]
    fn unique_violation_aborts_commit() {
        let manager = memory_manager();
        let txn = manager.begin_write().unwrap();
        txn.put(ITEMS, 1, item(1, "dup")).unwrap();
        txn.commit().unwrap();

        let txn = manager.begin_write().unwrap();
        txn.put(ITEMS, 2, item(2, "fresh")).unwrap();
        txn.put(ITEMS, 3, item(3, "dup")).unwrap();
        let err = txn.commit().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UniqueViolation);

        let reader = manager.begin_read().unwrap();
        assert_eq!(reader.ids(ITEMS).unwrap(), vec![1]);
        assert_eq!(manager.committed(), SequenceNumber::new(1));
    }

    #[test]
    fn moving_a_unique_value_is_allowed() {
        let manager = memory_manager();
        let txn = manager.begin_write().unwrap();
        txn.put(ITEMS, 1, item(1, "x")).unwrap();
        txn.commit().unwrap();

        let txn = manager.begin_write().unwrap();
        txn.put(ITEMS, 1, item(1, "y")).unwrap();
        txn.put(ITEMS, 2, item(2, "x")).unwrap();
        txn.commit().unwrap();
    }

    #[test]
    fn max_readers_is_enforced() {
        let manager = manager_with(Limits {
            max_readers: 2,
            ..limits()
        });
        let first = manager.begin_read().unwrap();
        let _second = manager.begin_read().unwrap();
        let err = manager.begin_read().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MaxReadersExceeded);

        drop(first);
        assert!(manager.begin_read().is_ok());
        assert_eq!(manager.reader_count(), 1);
    }

    #[test]
    fn writer_busy_after_timeout() {
        let manager = manager_with(Limits {
            write_lock_timeout: Some(Duration::from_millis(20)),
            ..limits()
        });
        let _held = manager.begin_write().unwrap();

        let other = Arc::clone(&manager);
        let err = thread::spawn(move || other.begin_write().map(|_| ()).unwrap_err())
            .join()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::WriterBusy);
    }

    #[test]
    fn same_thread_cannot_take_writer_twice() {
        let manager = memory_manager();
        let _held = manager.begin_write().unwrap();
        let err = manager.begin_write().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IllegalState);
    }

    #[test]
    fn second_writer_waits_for_first() {
        let manager = memory_manager();
        let held = manager.begin_write().unwrap();

        let other = Arc::clone(&manager);
        let waiter = thread::spawn(move || {
            let txn = other.begin_write().unwrap();
            txn.put(ITEMS, 2, item(2, "later")).unwrap();
            txn.commit().unwrap().changes.sequence
        });

        thread::sleep(Duration::from_millis(20));
        held.put(ITEMS, 1, item(1, "first")).unwrap();
        assert_eq!(held.commit().unwrap().changes.sequence, SequenceNumber::new(1));
        assert_eq!(waiter.join().unwrap(), SequenceNumber::new(2));
    }

    #[test]
    fn db_full_rejects_commit() {
        let manager = manager_with(Limits {
            max_db_size: 64,
            ..limits()
        });
        let txn = manager.begin_write().unwrap();
        txn.put(ITEMS, 1, item(1, &"x".repeat(100))).unwrap();
        let err = txn.commit().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DbFull);
        assert_eq!(manager.storage_size().unwrap(), 0);
    }

    #[test]
    fn versions_are_pruned_once_readers_leave() {
        let manager = memory_manager();
        for code in ["a", "b", "c"] {
            let txn = manager.begin_write().unwrap();
            txn.put(ITEMS, 1, item(1, code)).unwrap();
            txn.commit().unwrap();
        }
        assert_eq!(manager.segments().version_count(), 1);

        let reader = manager.begin_read().unwrap();
        let txn = manager.begin_write().unwrap();
        txn.put(ITEMS, 1, item(1, "d")).unwrap();
        txn.commit().unwrap();
        assert_eq!(manager.segments().version_count(), 2);

        drop(reader);
        manager.checkpoint(|_, _| Ok(())).unwrap();
        assert_eq!(manager.segments().version_count(), 1);
    }

    #[test]
    fn checkpoint_hands_over_id_sequences() {
        let manager = memory_manager();
        let txn = manager.begin_write().unwrap();
        let id = txn.next_id(ITEM).unwrap();
        txn.put(ITEMS, id, item(id, "a")).unwrap();
        txn.commit().unwrap();

        let mut seen = None;
        manager
            .checkpoint(|sequence, ids| {
                seen = Some((sequence, ids));
                Ok(())
            })
            .unwrap();
        let (sequence, ids) = seen.unwrap();
        assert_eq!(sequence, SequenceNumber::new(1));
        assert_eq!(ids.get(&ITEM), Some(&1));
    }

    #[test]
    fn try_checkpoint_skips_while_writing() {
        let manager = memory_manager();
        let held = manager.begin_write().unwrap();
        let other = Arc::clone(&manager);
        let skipped = thread::spawn(move || other.try_checkpoint(|_, _| Ok(())).unwrap())
            .join()
            .unwrap();
        assert_eq!(skipped, None);
        drop(held);
        assert!(manager.try_checkpoint(|_, _| Ok(())).unwrap().is_some());
    }

    #[test]
    fn recovery_replays_committed_wal_only() {
        let wal = InMemoryBackend::new();
        let wal_manager = WalManager::new(Box::new(wal));
        let txid = TransactionId::new(7);
        wal_manager
            .append_batch(&[
                WalRecord::Begin { txid },
                WalRecord::Put {
                    txid,
                    table: ITEMS,
                    object_id: 4,
                    payload: item(4, "replayed"),
                },
                WalRecord::Commit {
                    txid,
                    sequence: SequenceNumber::new(3),
                },
                WalRecord::Begin {
                    txid: TransactionId::new(8),
                },
                WalRecord::Put {
                    txid: TransactionId::new(8),
                    table: ITEMS,
                    object_id: 5,
                    payload: item(5, "lost"),
                },
            ])
            .unwrap();

        let manager = TransactionManager::new(
            model(),
            wal_manager,
            SegmentManager::new(Box::new(InMemoryBackend::new())),
            limits(),
        );
        let report = manager.recover(&Manifest::new()).unwrap();
        assert_eq!(report.replayed_commits, 1);
        assert_eq!(report.committed, SequenceNumber::new(3));

        let manager = Arc::new(manager);
        let reader = manager.begin_read().unwrap();
        assert_eq!(reader.ids(ITEMS).unwrap(), vec![4]);
        drop(reader);

        // ID sequence resumes after the replayed row
        assert_eq!(manager.next_id(ITEM).unwrap(), 5);
        // unique index was rebuilt
        let txn = manager.begin_write().unwrap();
        txn.put(ITEMS, 9, item(9, "replayed")).unwrap();
        assert_eq!(txn.commit().unwrap_err().kind(), ErrorKind::UniqueViolation);
    }

    #[test]
    fn poisoned_manager_refuses_work() {
        let manager = memory_manager();
        manager.poison("test", &CoreError::file_corrupt("boom"));
        assert_eq!(
            manager.begin_read().unwrap_err().kind(),
            ErrorKind::StoreMustShutdown
        );
        assert_eq!(
            manager.begin_write().unwrap_err().kind(),
            ErrorKind::StoreMustShutdown
        );
    }
}
