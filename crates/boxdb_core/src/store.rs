//! Store facade, lifecycle and transaction scoping.

use crate::change_feed::{ChangeFeed, ChangeSet};
use crate::collection::{AsyncBox, AsyncQueue, EntityBox, EntityCodec, BINDING_VERSION};
use crate::config::{Config, StoreLocation};
use crate::dir::StoreDir;
use crate::error::{CoreError, CoreResult};
use crate::manifest::Manifest;
use crate::observer::{Dispatcher, ObserverBus, SerialDispatcher};
use crate::schema::{EntitySchema, Model};
use crate::segment::SegmentManager;
use crate::transaction::{
    CommitInfo, Limits, RecoveryReport, Transaction, TransactionKind, TransactionManager, TxGuard,
};
use crate::types::{EntityTypeId, SequenceNumber};
use crate::wal::WalManager;
use boxdb_storage::{InMemoryBackend, StorageBackend};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, OnceLock, Weak};
use std::thread::{self, ThreadId};

type Registry = Mutex<HashMap<String, Weak<StoreInner>>>;

/// Stores open in this process, by location.
fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

fn live(registry: &HashMap<String, Weak<StoreInner>>, key: &str) -> Option<Arc<StoreInner>> {
    registry
        .get(key)
        .and_then(Weak::upgrade)
        .filter(|inner| !inner.is_closed())
}

/// Engine state shared by every handle, box and query of one store.
pub(crate) struct StoreInner {
    key: String,
    location: StoreLocation,
    config: Config,
    model: Arc<Model>,
    manager: Arc<TransactionManager>,
    recovery: RecoveryReport,
    dir: Mutex<Option<StoreDir>>,
    manifest: Mutex<Manifest>,
    active: Mutex<HashMap<ThreadId, Arc<Transaction>>>,
    boxes: Mutex<HashMap<EntityTypeId, Arc<EntitySchema>>>,
    observers: Arc<ObserverBus>,
    changes: ChangeFeed,
    dispatcher: Mutex<Option<Arc<SerialDispatcher>>>,
    async_queue: Mutex<Option<Arc<AsyncQueue>>>,
    handles: AtomicUsize,
    closed: AtomicBool,
}

impl StoreInner {
    fn open(model: Model, location: StoreLocation, config: Config) -> CoreResult<Arc<Self>> {
        let model = Arc::new(model);
        let (dir, wal, segments, stored): (
            Option<StoreDir>,
            Box<dyn StorageBackend>,
            Box<dyn StorageBackend>,
            Option<Manifest>,
        ) = match &location {
            StoreLocation::Directory(path) => {
                let dir = StoreDir::open(path, config.create_if_missing, config.file_mode)?;
                let wal = Box::new(dir.open_wal()?);
                let segments = Box::new(dir.open_segments()?);
                let manifest = dir.load_manifest()?;
                (Some(dir), wal, segments, manifest)
            }
            StoreLocation::Memory(_) => (
                None,
                Box::new(InMemoryBackend::new()),
                Box::new(InMemoryBackend::new()),
                None,
            ),
        };

        let mut manifest = stored.unwrap_or_else(Manifest::new);
        manifest.check_compatible(&model)?;
        manifest.absorb_model(&model);

        let manager = Arc::new(TransactionManager::new(
            Arc::clone(&model),
            WalManager::new(wal),
            SegmentManager::new(segments),
            Limits::from_config(&config),
        ));
        let recovery = manager.recover(&manifest)?;

        let inner = Arc::new(Self {
            key: location.registry_key(),
            location,
            config,
            model,
            manager,
            recovery,
            dir: Mutex::new(dir),
            manifest: Mutex::new(manifest),
            active: Mutex::new(HashMap::new()),
            boxes: Mutex::new(HashMap::new()),
            observers: Arc::new(ObserverBus::new()),
            changes: ChangeFeed::new(),
            dispatcher: Mutex::new(None),
            async_queue: Mutex::new(None),
            handles: AtomicUsize::new(1),
            closed: AtomicBool::new(false),
        });
        // persists the absorbed model and folds replayed commits into the segments
        inner.checkpoint()?;
        tracing::info!(
            location = %inner.key,
            committed = %recovery.committed,
            replayed = recovery.replayed_commits,
            "store opened"
        );
        Ok(inner)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Gives up one handle under the registry lock, which also guards
    /// `attach`. With `only_if_last` the count must be exactly one.
    /// Returns true for the last handle; the engine is then marked closed
    /// so nothing attaches before shutdown runs.
    fn release_handle(&self, only_if_last: bool) -> CoreResult<bool> {
        let _registry = registry().lock();
        if only_if_last {
            if self
                .handles
                .compare_exchange(1, 0, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return Err(CoreError::illegal_state(
                    "cannot delete store files while other handles are open",
                ));
            }
        } else if self.handles.fetch_sub(1, Ordering::AcqRel) != 1 {
            return Ok(false);
        }
        self.closed.store(true, Ordering::Release);
        Ok(true)
    }

    pub(crate) fn ensure_open(&self) -> CoreResult<()> {
        if self.is_closed() {
            return Err(CoreError::illegal_state(format!(
                "store {} is closed",
                self.key
            )));
        }
        Ok(())
    }

    pub(crate) fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn model(&self) -> &Arc<Model> {
        &self.model
    }

    pub(crate) fn manager(&self) -> &Arc<TransactionManager> {
        &self.manager
    }

    pub(crate) fn observers(&self) -> &Arc<ObserverBus> {
        &self.observers
    }

    /// Opens a scope of `kind` on the calling thread, joining the thread's
    /// current transaction if there is one.
    pub(crate) fn begin(self: &Arc<Self>, kind: TransactionKind) -> CoreResult<TxGuard> {
        self.ensure_open()?;
        let thread = thread::current().id();
        let current = self.active.lock().get(&thread).cloned();
        if let Some(txn) = current.filter(|txn| txn.is_active()) {
            if kind == TransactionKind::Write && txn.is_read_only() {
                return Err(CoreError::CannotWriteWhileReading);
            }
            return Ok(TxGuard::nested(Arc::clone(self), txn, kind));
        }

        let txn = Arc::new(match kind {
            TransactionKind::Read => self.manager.begin_read()?,
            TransactionKind::Write => self.manager.begin_write()?,
        });
        self.active.lock().insert(thread, Arc::clone(&txn));
        Ok(TxGuard::owning(Arc::clone(self), txn, kind))
    }

    /// Runs `f` in a write scope and commits if it succeeds.
    pub(crate) fn write<R>(
        self: &Arc<Self>,
        f: impl FnOnce(&Transaction) -> CoreResult<R>,
    ) -> CoreResult<R> {
        let guard = self.begin(TransactionKind::Write)?;
        let out = f(guard.transaction())?;
        guard.commit()?;
        Ok(out)
    }

    /// Runs `f` in a read scope.
    pub(crate) fn read<R>(
        self: &Arc<Self>,
        f: impl FnOnce(&Transaction) -> CoreResult<R>,
    ) -> CoreResult<R> {
        let guard = self.begin(TransactionKind::Read)?;
        f(guard.transaction())
    }

    pub(crate) fn deregister(&self, thread: ThreadId, txn: &Arc<Transaction>) {
        let mut active = self.active.lock();
        if active.get(&thread).is_some_and(|t| Arc::ptr_eq(t, txn)) {
            active.remove(&thread);
        }
    }

    /// Fans a successful commit out to the change feed and observers, then
    /// checkpoints if the WAL grew past its threshold.
    pub(crate) fn publish(&self, info: CommitInfo) {
        if !info.changes.is_empty() {
            self.changes.emit(&info.changes);
            self.observers.notify(&info.changes.touched);
        }
        let threshold = self.config.checkpoint_wal_size;
        if threshold > 0 && info.wal_size > threshold {
            match self.try_checkpoint() {
                Ok(Some(sequence)) => {
                    tracing::debug!(%sequence, wal_size = info.wal_size, "automatic checkpoint");
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(error = %e, "automatic checkpoint failed"),
            }
        }
    }

    fn persist_manifest(
        &self,
        sequence: SequenceNumber,
        id_sequences: BTreeMap<EntityTypeId, u64>,
    ) -> CoreResult<()> {
        let mut manifest = self.manifest.lock();
        manifest.last_checkpoint = sequence;
        manifest.id_sequences = id_sequences;
        if let Some(dir) = self.dir.lock().as_ref() {
            dir.save_manifest(&manifest)?;
        }
        Ok(())
    }

    pub(crate) fn checkpoint(&self) -> CoreResult<SequenceNumber> {
        self.manager
            .checkpoint(|sequence, ids| self.persist_manifest(sequence, ids))
    }

    fn try_checkpoint(&self) -> CoreResult<Option<SequenceNumber>> {
        self.manager
            .try_checkpoint(|sequence, ids| self.persist_manifest(sequence, ids))
    }

    /// Schema of `T`'s entity type, checking the binding on first use.
    ///
    /// # Panics
    ///
    /// Panics if `T` was generated for another binding version.
    pub(crate) fn box_schema<T: EntityCodec>(&self) -> CoreResult<Arc<EntitySchema>> {
        let mut boxes = self.boxes.lock();
        if let Some(schema) = boxes.get(&T::ENTITY_TYPE) {
            return Ok(Arc::clone(schema));
        }
        let version = T::binding_version();
        assert!(
            version == BINDING_VERSION,
            "binding {} was generated for binding version {version}, this engine implements {BINDING_VERSION}",
            std::any::type_name::<T>()
        );
        let schema = Arc::clone(self.model.entity(T::ENTITY_TYPE)?);
        boxes.insert(T::ENTITY_TYPE, Arc::clone(&schema));
        Ok(schema)
    }

    pub(crate) fn default_dispatcher(&self) -> CoreResult<Arc<dyn Dispatcher>> {
        self.ensure_open()?;
        let mut slot = self.dispatcher.lock();
        if let Some(dispatcher) = slot.as_ref() {
            return Ok(Arc::clone(dispatcher) as Arc<dyn Dispatcher>);
        }
        let dispatcher = Arc::new(SerialDispatcher::new("boxdb-observers")?);
        *slot = Some(Arc::clone(&dispatcher));
        Ok(dispatcher)
    }

    pub(crate) fn async_queue(self: &Arc<Self>) -> CoreResult<Arc<AsyncQueue>> {
        self.ensure_open()?;
        let mut slot = self.async_queue.lock();
        if let Some(queue) = slot.as_ref() {
            return Ok(Arc::clone(queue));
        }
        let queue = AsyncQueue::start(Arc::downgrade(self))?;
        *slot = Some(Arc::clone(&queue));
        Ok(queue)
    }

    /// Stops the engine. Returns the directory, still locked, so the
    /// caller can delete it; the checkpoint result comes second.
    fn shutdown(&self) -> (Option<StoreDir>, CoreResult<()>) {
        let queue = self.async_queue.lock().take();
        if let Some(queue) = queue {
            queue.stop();
        }
        self.closed.store(true, Ordering::Release);

        let result = match self.manager.ensure_healthy() {
            Ok(()) => self.checkpoint().map(|_| ()),
            // nothing more can be made durable; recovery replays the WAL
            Err(_) => Ok(()),
        };

        self.observers.clear();
        self.changes.clear();
        let dispatcher = self.dispatcher.lock().take();
        if let Some(dispatcher) = dispatcher {
            dispatcher.shutdown();
        }
        self.boxes.lock().clear();

        {
            let mut registry = registry().lock();
            let ours = registry
                .get(&self.key)
                .is_some_and(|weak| std::ptr::eq(weak.as_ptr(), self));
            if ours {
                registry.remove(&self.key);
            }
        }

        let dir = self.dir.lock().take();
        tracing::info!(location = %self.key, "store closed");
        (dir, result)
    }
}

impl std::fmt::Debug for StoreInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreInner")
            .field("location", &self.location)
            .field("closed", &self.is_closed())
            .field("manager", &self.manager)
            .finish_non_exhaustive()
    }
}

/// Handle to an open store.
///
/// A store is opened once per location and process; further handles come
/// from [`Store::clone_handle`] or [`Store::attach`]. The engine shuts
/// down, checkpointing, when the last handle is closed or dropped.
///
/// # Example
///
/// ```rust,ignore
/// use boxdb_core::{Config, Store};
///
/// let store = Store::open(model(), "notes-db", Config::default())?;
/// let notes = store.entity_box::<Note>()?;
///
/// store.run_in_transaction(|_| {
///     let mut note = Note::new("groceries");
///     notes.put(&mut note)?;
///     Ok(())
/// })?;
///
/// store.close()?;
/// ```
pub struct Store {
    inner: Arc<StoreInner>,
    closed: AtomicBool,
}

impl Store {
    /// Opens or creates the store at `location`.
    ///
    /// # Errors
    ///
    /// - `StoreLocked` if the location is already open in this process, or
    ///   a directory is locked by another process.
    /// - `Schema` if `model` is incompatible with the stored model.
    /// - `FileCorrupt`/`FilePagesCorrupt` if recovery finds damaged files.
    pub fn open(
        model: Model,
        location: impl Into<StoreLocation>,
        config: Config,
    ) -> CoreResult<Self> {
        let location = location.into();
        let mut registry = registry().lock();
        if live(&registry, &location.registry_key()).is_some() {
            return Err(CoreError::StoreLocked {
                location: location.registry_key(),
            });
        }
        let inner = StoreInner::open(model, location, config)?;
        registry.insert(inner.key.clone(), Arc::downgrade(&inner));
        Ok(Self::from_inner(inner))
    }

    /// Opens the in-memory store `name` with default configuration.
    pub fn open_in_memory(model: Model, name: &str) -> CoreResult<Self> {
        Self::open(
            model,
            StoreLocation::Memory(name.to_string()),
            Config::default(),
        )
    }

    /// Returns a new handle on the store already open at `location`.
    ///
    /// # Errors
    ///
    /// `CannotAttachToStore` if nothing is open there.
    pub fn attach(location: impl Into<StoreLocation>) -> CoreResult<Self> {
        let location = location.into();
        let key = location.registry_key();
        let registry = registry().lock();
        let inner = live(&registry, &key)
            .ok_or(CoreError::CannotAttachToStore { location: key })?;
        inner.handles.fetch_add(1, Ordering::AcqRel);
        Ok(Self::from_inner(inner))
    }

    fn from_inner(inner: Arc<StoreInner>) -> Self {
        Self {
            inner,
            closed: AtomicBool::new(false),
        }
    }

    /// Returns another handle on this store.
    pub fn clone_handle(&self) -> CoreResult<Self> {
        let _registry = registry().lock();
        self.ensure_open()?;
        self.inner.handles.fetch_add(1, Ordering::AcqRel);
        Ok(Self::from_inner(Arc::clone(&self.inner)))
    }

    fn ensure_open(&self) -> CoreResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CoreError::illegal_state("store handle is closed"));
        }
        self.inner.ensure_open()
    }

    /// Closes this handle. The last handle to close shuts the engine down.
    /// Idempotent.
    pub fn close(&self) -> CoreResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if !self.inner.release_handle(false)? {
            return Ok(());
        }
        let (dir, result) = self.inner.shutdown();
        drop(dir);
        result
    }

    /// Closes the store and deletes its files.
    ///
    /// # Errors
    ///
    /// `IllegalState` if other handles are still open.
    pub fn close_and_delete_files(self) -> CoreResult<()> {
        self.ensure_open()?;
        self.inner.release_handle(true)?;
        self.closed.store(true, Ordering::Release);
        let (dir, result) = self.inner.shutdown();
        if let Err(e) = result {
            tracing::warn!(error = %e, "checkpoint before deleting store files failed");
        }
        match dir {
            Some(dir) => dir.remove_files(),
            None => Ok(()),
        }
    }

    /// Returns true once this handle was closed or the engine shut down.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.inner.is_closed()
    }

    /// Location the store was opened at.
    #[must_use]
    pub fn location(&self) -> &StoreLocation {
        &self.inner.location
    }

    /// The schema model.
    #[must_use]
    pub fn model(&self) -> &Arc<Model> {
        &self.inner.model
    }

    /// What recovery found when the store was opened.
    #[must_use]
    pub fn recovery_report(&self) -> RecoveryReport {
        self.inner.recovery
    }

    /// Latest committed sequence number.
    #[must_use]
    pub fn committed_sequence(&self) -> SequenceNumber {
        self.inner.manager.committed()
    }

    /// Bytes used by the store's files, or by its buffers for in-memory
    /// stores.
    pub fn size_on_disk(&self) -> CoreResult<u64> {
        self.ensure_open()?;
        if let Some(dir) = self.inner.dir.lock().as_ref() {
            return dir.size_on_disk();
        }
        self.inner.manager.storage_size()
    }

    /// Makes every commit durable in the segment files and empties the WAL.
    /// Waits for a running write transaction to finish.
    pub fn checkpoint(&self) -> CoreResult<SequenceNumber> {
        self.ensure_open()?;
        self.inner.checkpoint()
    }

    /// Runs `f` in a write transaction, committing if it returns `Ok`.
    ///
    /// Called inside another write transaction on the same thread, `f`
    /// joins it and a failure makes the outer commit fail too. Called
    /// inside a read transaction, fails with `CannotWriteWhileReading`.
    pub fn run_in_transaction<R>(
        &self,
        f: impl FnOnce(&Transaction) -> CoreResult<R>,
    ) -> CoreResult<R> {
        self.ensure_open()?;
        self.inner.write(f)
    }

    /// Runs `f` in a read transaction, or inside the thread's current
    /// transaction if there is one.
    pub fn run_in_read_transaction<R>(
        &self,
        f: impl FnOnce(&Transaction) -> CoreResult<R>,
    ) -> CoreResult<R> {
        self.ensure_open()?;
        self.inner.read(f)
    }

    /// Opens a write scope; see [`TxGuard`].
    pub fn begin_write(&self) -> CoreResult<TxGuard> {
        self.ensure_open()?;
        self.inner.begin(TransactionKind::Write)
    }

    /// Opens a read scope; see [`TxGuard`].
    pub fn begin_read(&self) -> CoreResult<TxGuard> {
        self.ensure_open()?;
        self.inner.begin(TransactionKind::Read)
    }

    /// Returns the box of entity type `T`.
    ///
    /// # Panics
    ///
    /// Panics the first time a box of `T` is requested if `T` was
    /// generated for another binding version.
    pub fn entity_box<T: EntityCodec>(&self) -> CoreResult<EntityBox<T>> {
        self.ensure_open()?;
        let schema = self.inner.box_schema::<T>()?;
        Ok(EntityBox::new(Arc::clone(&self.inner), schema))
    }

    /// Returns a box whose writes are applied on a background thread.
    pub fn async_box<T: EntityCodec>(&self) -> CoreResult<AsyncBox<T>> {
        self.ensure_open()?;
        self.inner.box_schema::<T>()?;
        let queue = self.inner.async_queue()?;
        Ok(AsyncBox::new(Arc::clone(&self.inner), queue))
    }

    /// Serial dispatcher shared by observers that do not bring their own.
    pub fn default_dispatcher(&self) -> CoreResult<Arc<dyn Dispatcher>> {
        self.inner.default_dispatcher()
    }

    /// Returns a channel receiving the change set of every commit.
    pub fn subscribe_changes(&self) -> CoreResult<Receiver<ChangeSet>> {
        self.ensure_open()?;
        Ok(self.inner.changes.subscribe())
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(error = %e, "closing store on drop failed");
        }
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("location", &self.inner.location)
            .field("closed", &self.is_closed())
            .finish()
    }
}
