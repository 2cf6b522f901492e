//! Asynchronous box: writes applied on a background worker.
//!
//! IDs are drawn and objects encoded on the calling thread; the worker
//! applies queued operations one transaction each, in submission order.
//! A failing operation is logged and dropped: callers that need to see
//! errors use the synchronous [`EntityBox`].

use crate::collection::codec::{encode_record, EntityCodec};
use crate::collection::typed::EntityBox;
use crate::entity::PutMode;
use crate::error::{CoreError, CoreResult};
use crate::store::StoreInner;
use crate::types::ObjectId;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

pub(crate) type AsyncOp = Box<dyn FnOnce(&Arc<StoreInner>) -> CoreResult<()> + Send + 'static>;

struct QueueState {
    pending: VecDeque<(u64, AsyncOp)>,
    submitted: u64,
    applied: u64,
    in_flight: bool,
    stopping: bool,
}

/// FIFO of operations shared by every async box of a store.
pub(crate) struct AsyncQueue {
    state: Mutex<QueueState>,
    changed: Condvar,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl AsyncQueue {
    pub fn start(store: Weak<StoreInner>) -> CoreResult<Arc<Self>> {
        let queue = Arc::new(Self {
            state: Mutex::new(QueueState {
                pending: VecDeque::new(),
                submitted: 0,
                applied: 0,
                in_flight: false,
                stopping: false,
            }),
            changed: Condvar::new(),
            worker: Mutex::new(None),
        });
        let worker_queue = Arc::clone(&queue);
        let handle = thread::Builder::new()
            .name("boxdb-async".to_string())
            .spawn(move || worker_queue.run(&store))
            .map_err(CoreError::Io)?;
        *queue.worker.lock() = Some(handle);
        Ok(queue)
    }

    fn run(&self, store: &Weak<StoreInner>) {
        loop {
            let (seq, op) = {
                let mut state = self.state.lock();
                loop {
                    if let Some(next) = state.pending.pop_front() {
                        state.in_flight = true;
                        break next;
                    }
                    if state.stopping {
                        return;
                    }
                    self.changed.wait(&mut state);
                }
            };

            match store.upgrade() {
                Some(store) => {
                    if let Err(e) = op(&store) {
                        tracing::warn!(error = %e, operation = seq, "async box operation failed and was dropped");
                    }
                }
                None => tracing::warn!(operation = seq, "store is gone; async box operation dropped"),
            }

            let mut state = self.state.lock();
            state.applied = seq;
            state.in_flight = false;
            drop(state);
            self.changed.notify_all();
        }
    }

    /// Queues `op`; returns its position in submission order.
    pub fn submit(&self, op: AsyncOp) -> CoreResult<u64> {
        let mut state = self.state.lock();
        if state.stopping {
            return Err(CoreError::illegal_state("async queue is shut down"));
        }
        state.submitted += 1;
        let seq = state.submitted;
        state.pending.push_back((seq, op));
        drop(state);
        self.changed.notify_all();
        Ok(seq)
    }

    fn wait_while(&self, timeout: Option<Duration>, blocked: impl Fn(&QueueState) -> bool) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();
        while blocked(&state) {
            match deadline {
                None => self.changed.wait(&mut state),
                Some(deadline) => {
                    if self.changed.wait_until(&mut state, deadline).timed_out() {
                        return !blocked(&state);
                    }
                }
            }
        }
        true
    }

    /// Waits until everything submitted before the call was applied.
    pub fn await_submitted(&self, timeout: Option<Duration>) -> bool {
        let target = self.state.lock().submitted;
        self.wait_while(timeout, |state| state.applied < target)
    }

    /// Waits until the queue is empty and nothing is being applied.
    pub fn await_idle(&self, timeout: Option<Duration>) -> bool {
        self.wait_while(timeout, |state| !state.pending.is_empty() || state.in_flight)
    }

    /// Applies what is queued, then stops the worker.
    pub fn stop(&self) {
        self.state.lock().stopping = true;
        self.changed.notify_all();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if worker.thread().id() == thread::current().id() {
                return;
            }
            if worker.join().is_err() {
                tracing::warn!("async box worker panicked");
            }
        }
    }
}

impl std::fmt::Debug for AsyncQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("AsyncQueue")
            .field("pending", &state.pending.len())
            .field("submitted", &state.submitted)
            .field("applied", &state.applied)
            .finish()
    }
}

/// A box whose puts and removes return immediately and are applied later
/// on a background thread, in submission order.
///
/// Pending to-many links of put objects are not written; use
/// [`EntityBox::apply_relations`] for those.
pub struct AsyncBox<T: EntityCodec> {
    store: Arc<StoreInner>,
    queue: Arc<AsyncQueue>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: EntityCodec> AsyncBox<T> {
    pub(crate) fn new(store: Arc<StoreInner>, queue: Arc<AsyncQueue>) -> Self {
        Self {
            store,
            queue,
            _marker: PhantomData,
        }
    }

    /// Queues a put and writes the assigned ID back right away.
    pub fn put(&self, entity: &mut T) -> CoreResult<ObjectId> {
        self.put_with_mode(entity, PutMode::Put)
    }

    /// Like [`AsyncBox::put`] with an explicit mode; a mode violation is
    /// only logged when the put is applied.
    pub fn put_with_mode(&self, entity: &mut T, mode: PutMode) -> CoreResult<ObjectId> {
        let id = self.submit_put(entity, mode)?;
        entity.set_id(id);
        Ok(id)
    }

    /// Queues a put; returns the ID the object will be stored under.
    pub fn put_immutable(&self, entity: &T) -> CoreResult<ObjectId> {
        self.submit_put(entity, PutMode::Put)
    }

    fn submit_put(&self, entity: &T, mode: PutMode) -> CoreResult<ObjectId> {
        self.store.ensure_open()?;
        let manager = self.store.manager();
        let id = match entity.id() {
            0 => manager.next_id(T::ENTITY_TYPE)?,
            id => {
                manager.observe_id(T::ENTITY_TYPE, id);
                id
            }
        };
        let payload = encode_record(entity, id)?;
        self.queue.submit(Box::new(move |store: &Arc<StoreInner>| {
            let target = EntityBox::<T>::new(Arc::clone(store), store.box_schema::<T>()?);
            store.write(|tx| target.put_payload(tx, id, payload, mode).map(|_| ()))
        }))?;
        Ok(id)
    }

    /// Queues the removal of `id`.
    pub fn remove(&self, id: ObjectId) -> CoreResult<()> {
        self.remove_many(&[id])
    }

    /// Queues the removal of every one of `ids`, applied in one
    /// transaction.
    pub fn remove_many(&self, ids: &[ObjectId]) -> CoreResult<()> {
        self.store.ensure_open()?;
        let ids: Vec<ObjectId> = ids.iter().copied().filter(|id| *id != 0).collect();
        if ids.is_empty() {
            return Ok(());
        }
        self.queue.submit(Box::new(move |store: &Arc<StoreInner>| {
            let target = EntityBox::<T>::new(Arc::clone(store), store.box_schema::<T>()?);
            store.write(|tx| {
                for id in ids {
                    target.remove_in(tx, id)?;
                }
                Ok(())
            })
        }))?;
        Ok(())
    }

    /// Waits until every operation submitted so far, by any async box of
    /// this store, was applied. Returns false on timeout.
    pub fn await_submitted(&self, timeout: Option<Duration>) -> bool {
        self.queue.await_submitted(timeout)
    }

    /// Waits until the queue is idle. Returns false on timeout.
    pub fn await_idle(&self, timeout: Option<Duration>) -> bool {
        self.queue.await_idle(timeout)
    }
}

impl<T: EntityCodec> Clone for AsyncBox<T> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            queue: Arc::clone(&self.queue),
            _marker: PhantomData,
        }
    }
}

impl<T: EntityCodec> std::fmt::Debug for AsyncBox<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncBox")
            .field("type_id", &T::ENTITY_TYPE)
            .field("queue", &self.queue)
            .finish()
    }
}
