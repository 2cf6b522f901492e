//! Scoped transaction handles.

use crate::error::CoreResult;
use crate::store::StoreInner;
use crate::transaction::state::{Transaction, TransactionKind};
use std::sync::Arc;
use std::thread::{self, ThreadId};

/// RAII handle of a transaction scope, returned by
/// [`Store::begin_write`](crate::Store::begin_write) and
/// [`Store::begin_read`](crate::Store::begin_read).
///
/// A scope opened while the thread already runs a transaction joins it
/// instead of starting a new one. Only the outermost scope commits; a
/// nested write scope dropped without [`TxGuard::commit`] makes the outer
/// commit fail. Dropping the outermost scope without committing discards
/// its writes.
pub struct TxGuard {
    store: Arc<StoreInner>,
    txn: Arc<Transaction>,
    scope: TransactionKind,
    thread: ThreadId,
    owns: bool,
    finished: bool,
}

impl TxGuard {
    pub(crate) fn owning(
        store: Arc<StoreInner>,
        txn: Arc<Transaction>,
        scope: TransactionKind,
    ) -> Self {
        Self {
            store,
            txn,
            scope,
            thread: thread::current().id(),
            owns: true,
            finished: false,
        }
    }

    pub(crate) fn nested(
        store: Arc<StoreInner>,
        txn: Arc<Transaction>,
        scope: TransactionKind,
    ) -> Self {
        Self {
            store,
            txn,
            scope,
            thread: thread::current().id(),
            owns: false,
            finished: false,
        }
    }

    /// The underlying transaction.
    #[must_use]
    pub fn transaction(&self) -> &Transaction {
        &self.txn
    }

    /// Returns true if this scope joined an outer transaction.
    #[must_use]
    pub fn is_nested(&self) -> bool {
        !self.owns
    }

    /// Ends the scope successfully.
    ///
    /// The outermost write scope commits and notifies observers; the
    /// outermost read scope simply ends. Nested scopes leave the decision
    /// to the outer one.
    pub fn commit(mut self) -> CoreResult<()> {
        self.finished = true;
        if !self.owns {
            return Ok(());
        }
        if self.txn.is_read_only() {
            self.txn.close();
            self.store.deregister(self.thread, &self.txn);
            return Ok(());
        }
        let result = self.txn.commit();
        // observers may start their own transactions on this thread
        self.store.deregister(self.thread, &self.txn);
        let info = result?;
        self.store.publish(info);
        Ok(())
    }
}

impl Drop for TxGuard {
    fn drop(&mut self) {
        if self.owns {
            self.txn.close();
            self.store.deregister(self.thread, &self.txn);
        } else if !self.finished && self.scope == TransactionKind::Write {
            self.txn.mark_rollback_only();
        }
    }
}

impl std::fmt::Debug for TxGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxGuard")
            .field("transaction", &self.txn)
            .field("nested", &!self.owns)
            .finish()
    }
}
