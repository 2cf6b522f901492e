//! Change feed for observing committed writes.
//!
//! Every write transaction that changes something produces one
//! [`ChangeSet`] after it commits. Subscribers receive them through plain
//! `mpsc` channels, in commit order:
//!
//! ```rust,ignore
//! let changes = store.subscribe_changes()?;
//! std::thread::spawn(move || {
//!     while let Ok(set) = changes.recv() {
//!         println!("commit {} touched {:?}", set.sequence, set.touched);
//!     }
//! });
//! ```

use crate::types::{EntityTypeId, ObjectId, SequenceNumber};
use parking_lot::RwLock;
use std::sync::mpsc::{self, Receiver, Sender};

/// Type of change made to an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeType {
    /// The object was inserted or replaced.
    Put,
    /// The object was removed.
    Remove,
}

/// A single object changed by a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectChange {
    /// Entity type of the object.
    pub entity_type: EntityTypeId,
    /// Object ID.
    pub object_id: ObjectId,
    /// What happened to it.
    pub change_type: ChangeType,
}

/// Everything one commit changed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChangeSet {
    /// Sequence number of the commit.
    pub sequence: SequenceNumber,
    /// Changed objects, in key order.
    pub changes: Vec<ObjectChange>,
    /// Entity types touched by the commit, ascending. Relation writes
    /// touch both endpoint types.
    pub touched: Vec<EntityTypeId>,
}

impl ChangeSet {
    /// Returns true if the commit changed nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.touched.is_empty()
    }

    /// Returns true if the commit touched `entity_type`.
    #[must_use]
    pub fn touches(&self, entity_type: EntityTypeId) -> bool {
        self.touched.binary_search(&entity_type).is_ok()
    }
}

/// Distributes committed change sets to channel subscribers.
///
/// Disconnected receivers are dropped on the next emit.
pub struct ChangeFeed {
    subscribers: RwLock<Vec<Sender<ChangeSet>>>,
}

impl ChangeFeed {
    /// Creates a feed without subscribers.
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
        }
    }

    /// Subscribes to all future change sets.
    ///
    /// The receiver should be drained regularly; the channel is unbounded.
    pub fn subscribe(&self) -> Receiver<ChangeSet> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.write().push(tx);
        rx
    }

    /// Sends `set` to every live subscriber.
    pub fn emit(&self, set: &ChangeSet) {
        if set.is_empty() {
            return;
        }
        let mut subscribers = self.subscribers.write();
        subscribers.retain(|tx| tx.send(set.clone()).is_ok());
    }

    /// Returns the number of subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Disconnects every subscriber.
    pub fn clear(&self) {
        self.subscribers.write().clear();
    }
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ChangeFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeFeed")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn set(sequence: u64, entity: u32, id: u64) -> ChangeSet {
        ChangeSet {
            sequence: SequenceNumber::new(sequence),
            changes: vec![ObjectChange {
                entity_type: EntityTypeId::new(entity),
                object_id: id,
                change_type: ChangeType::Put,
            }],
            touched: vec![EntityTypeId::new(entity)],
        }
    }

    #[test]
    fn emit_and_receive() {
        let feed = ChangeFeed::new();
        let rx = feed.subscribe();

        feed.emit(&set(1, 1, 7));

        let received = rx.recv_timeout(Duration::from_millis(100)).unwrap();
        assert_eq!(received.sequence, SequenceNumber::new(1));
        assert!(received.touches(EntityTypeId::new(1)));
        assert!(!received.touches(EntityTypeId::new(2)));
    }

    #[test]
    fn multiple_subscribers() {
        let feed = ChangeFeed::new();
        let rx1 = feed.subscribe();
        let rx2 = feed.subscribe();

        let change = set(3, 2, 1);
        feed.emit(&change);

        assert_eq!(rx1.recv().unwrap(), change);
        assert_eq!(rx2.recv().unwrap(), change);
    }

    #[test]
    fn empty_sets_are_not_sent() {
        let feed = ChangeFeed::new();
        let rx = feed.subscribe();
        feed.emit(&ChangeSet::default());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn subscriber_cleanup() {
        let feed = ChangeFeed::new();
        let rx = feed.subscribe();
        assert_eq!(feed.subscriber_count(), 1);

        drop(rx);
        feed.emit(&set(1, 1, 1));
        assert_eq!(feed.subscriber_count(), 0);
    }

    #[test]
    fn clear_disconnects() {
        let feed = ChangeFeed::new();
        let rx = feed.subscribe();
        feed.clear();
        assert!(rx.recv_timeout(Duration::from_millis(10)).is_err());
    }

    #[test]
    fn order_is_preserved_across_threads() {
        let feed = Arc::new(ChangeFeed::new());
        let rx = feed.subscribe();

        let producer = Arc::clone(&feed);
        let handle = thread::spawn(move || {
            for i in 1..=20 {
                producer.emit(&set(i, 1, i));
            }
        });

        let received: Vec<u64> = (0..20)
            .map(|_| rx.recv_timeout(Duration::from_secs(1)).unwrap().sequence.as_u64())
            .collect();
        assert_eq!(received, (1..=20).collect::<Vec<_>>());
        handle.join().unwrap();
    }
}
