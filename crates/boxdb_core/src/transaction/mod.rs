//! Transactions.
//!
//! - One write transaction at a time; any number of read transactions,
//!   each reading a stable snapshot.
//! - Commits are all-or-nothing and durable once they return.
//! - Transactions nest per thread: inner scopes join the outer one.

mod guard;
mod manager;
mod state;

pub use guard::TxGuard;
pub use manager::{RecoveryReport, TransactionManager};
pub use state::{Transaction, TransactionKind, TransactionState};

pub(crate) use manager::{CommitInfo, Limits};
