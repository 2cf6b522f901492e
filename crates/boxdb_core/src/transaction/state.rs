//! Transaction state.

use crate::error::{CoreError, CoreResult};
use crate::transaction::manager::{CommitInfo, TransactionManager};
use crate::types::{EntityTypeId, SequenceNumber, TableId, TransactionId};
use parking_lot::{Mutex, MutexGuard};
use std::collections::BTreeMap;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::thread::{self, ThreadId};

pub(crate) type RowKey = (TableId, u64);

fn table_range(table: TableId) -> RangeInclusive<RowKey> {
    (table, 0)..=(table, u64::MAX)
}

/// Whether a transaction may write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionKind {
    /// Snapshot reads only.
    Read,
    /// Exclusive writer.
    Write,
}

/// State of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Transaction is active and can perform operations.
    Active,
    /// Transaction has been committed.
    Committed,
    /// Transaction was closed without committing.
    Aborted,
}

/// A buffered write, applied at commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PendingWrite {
    /// Insert or replace the row.
    Put(Vec<u8>),
    /// Delete the row.
    Delete,
}

#[derive(Debug)]
struct TxnInner {
    state: TransactionState,
    writes: BTreeMap<RowKey, PendingWrite>,
    rollback_only: bool,
}

/// A transaction over one store.
///
/// Reads see the snapshot taken when the transaction began, overlaid with
/// the transaction's own buffered writes. A transaction is confined to the
/// thread that created it; using it from another thread fails with
/// `IllegalState`. Dropping an active transaction discards its writes.
pub struct Transaction {
    manager: Arc<TransactionManager>,
    id: TransactionId,
    kind: TransactionKind,
    snapshot: SequenceNumber,
    owner: ThreadId,
    inner: Mutex<TxnInner>,
}

impl Transaction {
    pub(crate) fn new(
        manager: Arc<TransactionManager>,
        id: TransactionId,
        kind: TransactionKind,
        snapshot: SequenceNumber,
    ) -> Self {
        Self {
            manager,
            id,
            kind,
            snapshot,
            owner: thread::current().id(),
            inner: Mutex::new(TxnInner {
                state: TransactionState::Active,
                writes: BTreeMap::new(),
                rollback_only: false,
            }),
        }
    }

    /// Returns the transaction ID.
    #[must_use]
    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// Returns whether this is a read or write transaction.
    #[must_use]
    pub fn kind(&self) -> TransactionKind {
        self.kind
    }

    /// Returns true for read transactions.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.kind == TransactionKind::Read
    }

    /// Returns the sequence number the transaction reads at.
    #[must_use]
    pub fn snapshot(&self) -> SequenceNumber {
        self.snapshot
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> TransactionState {
        self.inner.lock().state
    }

    /// Checks if the transaction is still active.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state() == TransactionState::Active
    }

    /// Number of buffered writes.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.lock().writes.len()
    }

    pub(crate) fn manager(&self) -> &Arc<TransactionManager> {
        &self.manager
    }

    fn usable(&self) -> CoreResult<MutexGuard<'_, TxnInner>> {
        if thread::current().id() != self.owner {
            return Err(CoreError::illegal_state(format!(
                "{} used from a thread that did not create it",
                self.id
            )));
        }
        let inner = self.inner.lock();
        match inner.state {
            TransactionState::Active => Ok(inner),
            TransactionState::Committed => Err(CoreError::illegal_state(format!(
                "{} is already committed",
                self.id
            ))),
            TransactionState::Aborted => Err(CoreError::illegal_state(format!(
                "{} is already closed",
                self.id
            ))),
        }
    }

    fn writable(&self) -> CoreResult<MutexGuard<'_, TxnInner>> {
        let inner = self.usable()?;
        if self.kind == TransactionKind::Read {
            return Err(CoreError::illegal_state(
                "cannot write inside a read transaction",
            ));
        }
        Ok(inner)
    }

    /// Returns the row payload visible to this transaction.
    pub(crate) fn get(&self, table: TableId, id: u64) -> CoreResult<Option<Vec<u8>>> {
        let inner = self.usable()?;
        match inner.writes.get(&(table, id)) {
            Some(PendingWrite::Put(payload)) => Ok(Some(payload.clone())),
            Some(PendingWrite::Delete) => Ok(None),
            None => self.manager.segments().get_at(table, id, self.snapshot),
        }
    }

    /// Returns true if the row exists for this transaction.
    pub(crate) fn contains(&self, table: TableId, id: u64) -> CoreResult<bool> {
        let inner = self.usable()?;
        Ok(Self::exists(&self.manager, &inner, self.snapshot, table, id))
    }

    fn exists(
        manager: &TransactionManager,
        inner: &TxnInner,
        snapshot: SequenceNumber,
        table: TableId,
        id: u64,
    ) -> bool {
        match inner.writes.get(&(table, id)) {
            Some(PendingWrite::Put(_)) => true,
            Some(PendingWrite::Delete) => false,
            None => manager.segments().contains_at(table, id, snapshot),
        }
    }

    /// Returns the IDs of all visible rows of `table`, ascending.
    pub(crate) fn ids(&self, table: TableId) -> CoreResult<Vec<u64>> {
        let inner = self.usable()?;
        let committed = self.manager.segments().ids_at(table, self.snapshot);
        let mut pending = inner.writes.range(table_range(table)).peekable();
        if pending.peek().is_none() {
            return Ok(committed);
        }
        let mut ids: std::collections::BTreeSet<u64> = committed.into_iter().collect();
        for ((_, id), write) in pending {
            match write {
                PendingWrite::Put(_) => ids.insert(*id),
                PendingWrite::Delete => ids.remove(id),
            };
        }
        Ok(ids.into_iter().collect())
    }

    /// Returns all visible rows of `table`, ascending by ID.
    pub(crate) fn scan(&self, table: TableId) -> CoreResult<Vec<(u64, Vec<u8>)>> {
        let inner = self.usable()?;
        let committed = self.manager.segments().scan_at(table, self.snapshot)?;
        let mut pending = inner.writes.range(table_range(table)).peekable();
        if pending.peek().is_none() {
            return Ok(committed);
        }
        let mut rows: BTreeMap<u64, Vec<u8>> = committed.into_iter().collect();
        for ((_, id), write) in pending {
            match write {
                PendingWrite::Put(payload) => {
                    rows.insert(*id, payload.clone());
                }
                PendingWrite::Delete => {
                    rows.remove(id);
                }
            }
        }
        Ok(rows.into_iter().collect())
    }

    /// Counts visible rows of `table`, stopping at `limit` (0 = no limit).
    pub(crate) fn count(&self, table: TableId, limit: u64) -> CoreResult<u64> {
        if !self.has_pending(table)? {
            return Ok(self
                .manager
                .segments()
                .count_at(table, self.snapshot, limit));
        }
        let total = self.ids(table)?.len() as u64;
        Ok(if limit == 0 { total } else { total.min(limit) })
    }

    /// Returns true if this transaction buffered writes to `table`.
    pub(crate) fn has_pending(&self, table: TableId) -> CoreResult<bool> {
        let inner = self.usable()?;
        Ok(inner.writes.range(table_range(table)).next().is_some())
    }

    /// Buffers an insert or replace.
    pub(crate) fn put(&self, table: TableId, id: u64, payload: Vec<u8>) -> CoreResult<()> {
        let mut inner = self.writable()?;
        inner.writes.insert((table, id), PendingWrite::Put(payload));
        Ok(())
    }

    /// Buffers a delete. Returns false, recording nothing, if the row does
    /// not exist.
    pub(crate) fn delete(&self, table: TableId, id: u64) -> CoreResult<bool> {
        let mut inner = self.writable()?;
        if !Self::exists(&self.manager, &inner, self.snapshot, table, id) {
            return Ok(false);
        }
        inner.writes.insert((table, id), PendingWrite::Delete);
        Ok(true)
    }

    /// Draws the next object ID of `entity`. IDs drawn by a transaction
    /// that is later closed are not handed out again.
    pub(crate) fn next_id(&self, entity: EntityTypeId) -> CoreResult<u64> {
        drop(self.writable()?);
        self.manager.next_id(entity)
    }

    /// Moves the ID sequence of `entity` past an explicitly chosen ID.
    pub(crate) fn observe_id(&self, entity: EntityTypeId, id: u64) -> CoreResult<()> {
        drop(self.writable()?);
        self.manager.observe_id(entity, id);
        Ok(())
    }

    /// Makes the final commit fail; used when a nested scope failed.
    pub(crate) fn mark_rollback_only(&self) {
        self.inner.lock().rollback_only = true;
    }

    /// Commits the buffered writes and releases the writer slot.
    ///
    /// On failure nothing is applied and the transaction ends closed.
    pub(crate) fn commit(&self) -> CoreResult<CommitInfo> {
        let mut inner = self.usable()?;
        if self.kind == TransactionKind::Read {
            return Err(CoreError::illegal_state("read transactions cannot commit"));
        }
        if inner.rollback_only {
            inner.state = TransactionState::Aborted;
            inner.writes.clear();
            drop(inner);
            self.release();
            return Err(CoreError::illegal_state(
                "a nested transaction failed; all changes were rolled back",
            ));
        }

        let writes = std::mem::take(&mut inner.writes);
        let result = self.manager.commit(self.id, self.snapshot, writes);
        inner.state = if result.is_ok() {
            TransactionState::Committed
        } else {
            TransactionState::Aborted
        };
        drop(inner);
        self.release();
        result
    }

    /// Closes the transaction without committing. Idempotent.
    pub(crate) fn close(&self) {
        let mut inner = self.inner.lock();
        if inner.state != TransactionState::Active {
            return;
        }
        inner.state = TransactionState::Aborted;
        let discarded = inner.writes.len();
        inner.writes.clear();
        drop(inner);
        self.release();
        tracing::debug!(txid = %self.id, discarded, "transaction closed without commit");
    }

    fn release(&self) {
        match self.kind {
            TransactionKind::Read => self.manager.release_reader(self.snapshot),
            TransactionKind::Write => self.manager.release_writer(),
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("snapshot", &self.snapshot)
            .field("state", &inner.state)
            .field("pending", &inner.writes.len())
            .finish()
    }
}
