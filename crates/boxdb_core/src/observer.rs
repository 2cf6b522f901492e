//! Observer bus.
//!
//! Observers register for one or more entity types and are called after
//! every commit touching any of them, on a [`Dispatcher`] of their
//! choice. By the time a callback runs, the commit is visible to new
//! transactions. Notifications may be spurious: an observer fires for any
//! commit touching its types, whether or not the data it cares about
//! changed.

use crate::error::{CoreError, CoreResult};
use crate::types::EntityTypeId;
use parking_lot::{Mutex, ReentrantMutex};
use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

/// Subscription options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverFlags(u8);

impl ObserverFlags {
    /// No options.
    pub const NONE: Self = Self(0);
    /// Deliver one notification right after subscribing.
    pub const SEND_INITIAL: Self = Self(0x01);
    /// Do not register for later changes; only valid together with
    /// `SEND_INITIAL`, making a one-shot notification.
    pub const DONT_SUBSCRIBE: Self = Self(0x02);

    /// Returns true if all flags of `other` are set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Rejects `DONT_SUBSCRIBE` without `SEND_INITIAL`, which would never
    /// call the observer.
    pub(crate) fn check(self) -> CoreResult<()> {
        if self.contains(Self::DONT_SUBSCRIBE) && !self.contains(Self::SEND_INITIAL) {
            return Err(CoreError::illegal_argument(
                "DONT_SUBSCRIBE without SEND_INITIAL would never notify",
            ));
        }
        Ok(())
    }
}

impl Default for ObserverFlags {
    fn default() -> Self {
        Self::SEND_INITIAL
    }
}

impl std::ops::BitOr for ObserverFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// A unit of work handed to a dispatcher.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Execution context for observer callbacks.
pub trait Dispatcher: Send + Sync {
    /// Runs `job` at some point; jobs handed to one dispatcher should run
    /// in the order they were dispatched.
    fn dispatch(&self, job: Job);
}

/// Runs a job, logging instead of propagating a panic so one broken
/// callback does not starve the others.
fn run_guarded(job: Job) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        tracing::warn!(%message, "observer callback panicked");
    }
}

/// Runs callbacks inline on the committing thread, after the commit.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImmediateDispatcher;

impl Dispatcher for ImmediateDispatcher {
    fn dispatch(&self, job: Job) {
        run_guarded(job);
    }
}

/// Runs callbacks one after another on a dedicated thread.
pub struct SerialDispatcher {
    name: String,
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SerialDispatcher {
    /// Starts the worker thread.
    pub fn new(name: impl Into<String>) -> CoreResult<Self> {
        let name = name.into();
        let (sender, receiver) = mpsc::channel::<Job>();
        let worker = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                while let Ok(job) = receiver.recv() {
                    run_guarded(job);
                }
            })
            .map_err(CoreError::Io)?;
        Ok(Self {
            name,
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Stops accepting jobs, lets queued ones finish and joins the worker.
    ///
    /// Called from a callback running on this dispatcher, it only stops
    /// accepting jobs.
    pub fn shutdown(&self) {
        drop(self.sender.lock().take());
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if worker.thread().id() == thread::current().id() {
                return;
            }
            if worker.join().is_err() {
                tracing::warn!(dispatcher = %self.name, "dispatcher thread panicked");
            }
        }
    }
}

impl Dispatcher for SerialDispatcher {
    fn dispatch(&self, job: Job) {
        let sender = self.sender.lock();
        match sender.as_ref() {
            Some(sender) => {
                if sender.send(job).is_err() {
                    tracing::debug!(dispatcher = %self.name, "dispatcher worker gone");
                }
            }
            None => tracing::debug!(dispatcher = %self.name, "dispatch after shutdown ignored"),
        }
    }
}

impl Drop for SerialDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for SerialDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialDispatcher")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

pub(crate) type Callback = Arc<dyn Fn() + Send + Sync + 'static>;

struct Subscription {
    id: u64,
    entities: Vec<EntityTypeId>,
    dispatcher: Arc<dyn Dispatcher>,
    callback: Callback,
    // held while a callback runs; reentrant so a callback may unsubscribe
    // itself
    active: ReentrantMutex<Cell<bool>>,
}

impl Subscription {
    fn deliver(self: &Arc<Self>) {
        let subscription = Arc::clone(self);
        self.dispatcher.dispatch(Box::new(move || {
            let active = subscription.active.lock();
            if active.get() {
                (subscription.callback)();
            }
        }));
    }

    fn deactivate(&self) {
        self.active.lock().set(false);
    }
}

/// Registry of live observers of one store.
pub(crate) struct ObserverBus {
    next_id: AtomicU64,
    subscriptions: Mutex<Vec<Arc<Subscription>>>,
}

impl ObserverBus {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    /// Registers `callback` for commits touching any of `entities`.
    pub fn subscribe(
        self: &Arc<Self>,
        entities: Vec<EntityTypeId>,
        dispatcher: Arc<dyn Dispatcher>,
        flags: ObserverFlags,
        callback: Callback,
    ) -> Observer {
        let subscription = Arc::new(Subscription {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            entities,
            dispatcher,
            callback,
            active: ReentrantMutex::new(Cell::new(true)),
        });
        let registered = !flags.contains(ObserverFlags::DONT_SUBSCRIBE);
        if registered {
            self.subscriptions.lock().push(Arc::clone(&subscription));
        }
        if flags.contains(ObserverFlags::SEND_INITIAL) {
            subscription.deliver();
        }
        if !registered {
            // the initial delivery, if any, is already queued
            return Observer {
                bus: Weak::new(),
                subscription: None,
            };
        }
        tracing::debug!(
            observer = subscription.id,
            entities = ?subscription.entities,
            "observer subscribed"
        );
        Observer {
            bus: Arc::downgrade(self),
            subscription: Some(subscription),
        }
    }

    /// Dispatches a notification to every observer of `touched`.
    pub fn notify(&self, touched: &[EntityTypeId]) {
        if touched.is_empty() {
            return;
        }
        let targets: Vec<Arc<Subscription>> = self
            .subscriptions
            .lock()
            .iter()
            .filter(|s| s.entities.iter().any(|e| touched.contains(e)))
            .cloned()
            .collect();
        for subscription in targets {
            subscription.deliver();
        }
    }

    fn remove(&self, id: u64) {
        self.subscriptions.lock().retain(|s| s.id != id);
    }

    /// Deactivates and drops every observer.
    pub fn clear(&self) {
        let drained: Vec<_> = self.subscriptions.lock().drain(..).collect();
        for subscription in drained {
            subscription.deactivate();
        }
    }

    /// Number of registered observers.
    pub fn len(&self) -> usize {
        self.subscriptions.lock().len()
    }
}

impl std::fmt::Debug for ObserverBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverBus")
            .field("observers", &self.len())
            .finish()
    }
}

/// Handle of a live subscription.
///
/// Dropping the handle unsubscribes. Once [`Observer::unsubscribe`]
/// returns, no new callback starts; a callback already running on another
/// thread is waited for.
#[must_use = "dropping an Observer unsubscribes it"]
pub struct Observer {
    bus: Weak<ObserverBus>,
    subscription: Option<Arc<Subscription>>,
}

impl Observer {
    /// Cancels the subscription. Idempotent.
    pub fn unsubscribe(&self) {
        let Some(subscription) = &self.subscription else {
            return;
        };
        subscription.deactivate();
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(subscription.id);
        }
    }

    /// Returns true while notifications are delivered.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.subscription
            .as_ref()
            .is_some_and(|s| s.active.lock().get())
    }
}

impl Drop for Observer {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Observer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observer")
            .field("id", &self.subscription.as_ref().map(|s| s.id))
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    const NOTE: EntityTypeId = EntityTypeId::new(1);
    const TAG: EntityTypeId = EntityTypeId::new(2);

    fn counter() -> (Arc<AtomicUsize>, Callback) {
        let count = Arc::new(AtomicUsize::new(0));
        let inner = Arc::clone(&count);
        (
            count,
            Arc::new(move || {
                inner.fetch_add(1, Ordering::SeqCst);
            }),
        )
    }

    fn immediate() -> Arc<dyn Dispatcher> {
        Arc::new(ImmediateDispatcher)
    }

    #[test]
    fn notifies_matching_types_only() {
        let bus = Arc::new(ObserverBus::new());
        let (count, callback) = counter();
        let _observer = bus.subscribe(vec![NOTE], immediate(), ObserverFlags::NONE, callback);

        bus.notify(&[TAG]);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        bus.notify(&[NOTE, TAG]);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn send_initial_delivers_once_without_changes() {
        let bus = Arc::new(ObserverBus::new());
        let (count, callback) = counter();
        let _observer = bus.subscribe(vec![NOTE], immediate(), ObserverFlags::default(), callback);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        bus.notify(&[NOTE]);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn dont_subscribe_is_one_shot() {
        let bus = Arc::new(ObserverBus::new());
        let (count, callback) = counter();
        let observer = bus.subscribe(
            vec![NOTE],
            immediate(),
            ObserverFlags::SEND_INITIAL | ObserverFlags::DONT_SUBSCRIBE,
            callback,
        );
        assert!(!observer.is_active());
        assert_eq!(bus.len(), 0);

        bus.notify(&[NOTE]);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let bus = Arc::new(ObserverBus::new());
        let (count, callback) = counter();
        let observer = bus.subscribe(vec![NOTE], immediate(), ObserverFlags::NONE, callback);
        assert!(observer.is_active());

        observer.unsubscribe();
        observer.unsubscribe();
        assert!(!observer.is_active());
        assert_eq!(bus.len(), 0);

        bus.notify(&[NOTE]);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn dropping_the_handle_unsubscribes() {
        let bus = Arc::new(ObserverBus::new());
        let (count, callback) = counter();
        drop(bus.subscribe(vec![NOTE], immediate(), ObserverFlags::NONE, callback));
        bus.notify(&[NOTE]);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn panicking_observer_does_not_block_others() {
        let bus = Arc::new(ObserverBus::new());
        let _broken = bus.subscribe(
            vec![NOTE],
            immediate(),
            ObserverFlags::NONE,
            Arc::new(|| panic!("observer failure")),
        );
        let (count, callback) = counter();
        let _healthy = bus.subscribe(vec![NOTE], immediate(), ObserverFlags::NONE, callback);

        bus.notify(&[NOTE]);
        bus.notify(&[NOTE]);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn callback_may_unsubscribe_itself() {
        let bus = Arc::new(ObserverBus::new());
        let slot: Arc<Mutex<Option<Observer>>> = Arc::new(Mutex::new(None));
        let inner = Arc::clone(&slot);
        let observer = bus.subscribe(
            vec![NOTE],
            immediate(),
            ObserverFlags::NONE,
            Arc::new(move || {
                if let Some(observer) = inner.lock().as_ref() {
                    observer.unsubscribe();
                }
            }),
        );
        *slot.lock() = Some(observer);

        bus.notify(&[NOTE]);
        assert_eq!(bus.len(), 0);
    }

    #[test]
    fn serial_dispatcher_runs_in_order() {
        let dispatcher = SerialDispatcher::new("test-observers").unwrap();
        let (tx, rx) = mpsc::channel();
        for i in 0..10 {
            let tx = tx.clone();
            dispatcher.dispatch(Box::new(move || tx.send(i).unwrap()));
        }
        let seen: Vec<i32> = (0..10)
            .map(|_| rx.recv_timeout(Duration::from_secs(1)).unwrap())
            .collect();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());

        dispatcher.shutdown();
        dispatcher.dispatch(Box::new(|| panic!("must not run")));
    }

    #[test]
    fn serial_dispatcher_survives_panics() {
        let dispatcher = SerialDispatcher::new("test-panics").unwrap();
        let (tx, rx) = mpsc::channel();
        dispatcher.dispatch(Box::new(|| panic!("first job fails")));
        dispatcher.dispatch(Box::new(move || tx.send(()).unwrap()));
        assert!(rx.recv_timeout(Duration::from_secs(1)).is_ok());
    }

    #[test]
    fn clear_deactivates_everything() {
        let bus = Arc::new(ObserverBus::new());
        let (_, callback) = counter();
        let observer = bus.subscribe(vec![NOTE], immediate(), ObserverFlags::NONE, callback);
        bus.clear();
        assert!(!observer.is_active());
        assert_eq!(bus.len(), 0);
    }
}
