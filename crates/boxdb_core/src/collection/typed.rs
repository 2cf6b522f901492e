//! Typed box implementation.

use crate::collection::codec::{decode_record, encode_record, EntityCodec};
use crate::entity::{self, PutMode, RelationHandle, RelationWriter};
use crate::error::{CoreError, CoreResult};
use crate::index::IndexValue;
use crate::observer::{Dispatcher, Observer, ObserverFlags};
use crate::query::{QueryBuilder, ToOneProperty};
use crate::schema::EntitySchema;
use crate::store::StoreInner;
use crate::transaction::Transaction;
use crate::types::{EntityTypeId, ObjectId, TableId};
use boxdb_codec::{PropertyType, RecordReader};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

/// A typed box: put, get, remove and query objects of one entity type.
///
/// Every operation runs in its own transaction, or joins the calling
/// thread's transaction when called inside
/// [`Store::run_in_transaction`](crate::Store::run_in_transaction) and
/// friends.
///
/// # Example
///
/// ```rust,ignore
/// let notes: EntityBox<Note> = store.entity_box()?;
///
/// let mut note = Note::new("groceries");
/// let id = notes.put(&mut note)?;
/// assert_eq!(note.id, id);
///
/// let found = notes.get(id)?;
/// assert!(notes.remove(id)?);
/// ```
pub struct EntityBox<T: EntityCodec> {
    store: Arc<StoreInner>,
    schema: Arc<EntitySchema>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: EntityCodec> EntityBox<T> {
    pub(crate) fn new(store: Arc<StoreInner>, schema: Arc<EntitySchema>) -> Self {
        Self {
            store,
            schema,
            _marker: PhantomData,
        }
    }

    /// Entity type of this box.
    #[must_use]
    pub fn entity_type(&self) -> EntityTypeId {
        T::ENTITY_TYPE
    }

    /// Declared schema of the entity type.
    #[must_use]
    pub fn schema(&self) -> &Arc<EntitySchema> {
        &self.schema
    }

    fn table(&self) -> TableId {
        TableId::entity(T::ENTITY_TYPE)
    }

    // ---- writes ----

    /// Inserts or updates `entity` and writes an assigned ID back into it.
    pub fn put(&self, entity: &mut T) -> CoreResult<ObjectId> {
        self.put_with_mode(entity, PutMode::Put)
    }

    /// Like [`EntityBox::put`] with an explicit mode.
    ///
    /// # Errors
    ///
    /// - `UniqueViolation` for `Insert` of an existing ID, or a duplicate
    ///   value of a unique property.
    /// - `NotFound` for `Update` of an ID that does not exist.
    /// - `CannotRelateToUnsavedEntities` if a to-one target is not stored.
    pub fn put_with_mode(&self, entity: &mut T, mode: PutMode) -> CoreResult<ObjectId> {
        let id = self.store.write(|tx| self.put_in(tx, &*entity, mode))?;
        entity.set_id(id);
        Ok(id)
    }

    /// Puts `entity` without touching it; returns the ID it was stored
    /// under.
    pub fn put_immutable(&self, entity: &T) -> CoreResult<ObjectId> {
        self.store.write(|tx| self.put_in(tx, entity, PutMode::Put))
    }

    /// Puts all `entities` in one transaction: either every one is stored
    /// and receives its ID, or none is.
    pub fn put_many(&self, entities: &mut [T]) -> CoreResult<Vec<ObjectId>> {
        let ids = self.put_many_immutable(entities)?;
        for (entity, id) in entities.iter_mut().zip(&ids) {
            entity.set_id(*id);
        }
        Ok(ids)
    }

    /// Like [`EntityBox::put_many`] without writing IDs back.
    pub fn put_many_immutable(&self, entities: &[T]) -> CoreResult<Vec<ObjectId>> {
        self.store.write(|tx| {
            entities
                .iter()
                .map(|entity| self.put_in(tx, entity, PutMode::Put))
                .collect()
        })
    }

    pub(crate) fn put_in(
        &self,
        tx: &Transaction,
        entity: &T,
        mode: PutMode,
    ) -> CoreResult<ObjectId> {
        let id = match entity.id() {
            0 => tx.next_id(T::ENTITY_TYPE)?,
            id => {
                tx.observe_id(T::ENTITY_TYPE, id)?;
                id
            }
        };
        let payload = encode_record(entity, id)?;
        let existed = self.put_payload(tx, id, payload, mode)?;
        if !existed {
            let mut links = RelationWriter::new(tx, T::ENTITY_TYPE, id);
            entity.write_relations(&mut links)?;
        }
        Ok(id)
    }

    /// Stores an encoded record under `id`, honoring `mode`; returns
    /// whether the object existed before.
    pub(crate) fn put_payload(
        &self,
        tx: &Transaction,
        id: ObjectId,
        payload: Vec<u8>,
        mode: PutMode,
    ) -> CoreResult<bool> {
        let table = self.table();
        let exists = tx.contains(table, id)?;
        match mode {
            PutMode::Insert if exists => {
                return Err(CoreError::UniqueViolation {
                    entity: self.schema.name.clone(),
                    property: self.id_property_name(),
                    value: id.to_string(),
                });
            }
            PutMode::Update if !exists => {
                return Err(CoreError::not_found(format!(
                    "{} object {id} cannot be updated",
                    self.schema.name
                )));
            }
            _ => {}
        }
        self.check_to_one_targets(tx, &payload)?;
        tx.put(table, id, payload)?;
        Ok(exists)
    }

    fn id_property_name(&self) -> String {
        self.schema
            .property(self.schema.id_property())
            .map_or_else(|| "id".to_string(), |p| p.name.clone())
    }

    fn check_to_one_targets(&self, tx: &Transaction, payload: &[u8]) -> CoreResult<()> {
        let reader = RecordReader::new(payload);
        for prop in self.schema.properties() {
            let (PropertyType::Relation, Some(target_type)) = (prop.ty, prop.target) else {
                continue;
            };
            let target = reader.read_u64(prop.id.as_u16());
            if target != 0 && !tx.contains(TableId::entity(target_type), target)? {
                return Err(CoreError::unsaved_relation(format!(
                    "{}.{} points at {target_type} object {target}, which is not stored",
                    self.schema.name, prop.name
                )));
            }
        }
        Ok(())
    }

    /// Writes the pending to-many changes of a stored `entity`.
    ///
    /// Puts of existing objects leave links alone; call this after changing
    /// a to-many field of one.
    pub fn apply_relations(&self, entity: &T) -> CoreResult<()> {
        let id = entity.id();
        if id == 0 {
            return Err(CoreError::unsaved_relation(format!(
                "{} object has no ID; put it first",
                self.schema.name
            )));
        }
        self.store.write(|tx| {
            if !tx.contains(self.table(), id)? {
                return Err(CoreError::not_found(format!(
                    "{} object {id}",
                    self.schema.name
                )));
            }
            let mut links = RelationWriter::new(tx, T::ENTITY_TYPE, id);
            entity.write_relations(&mut links)
        })
    }

    // ---- reads ----

    /// Returns the object stored under `id`, if any.
    pub fn get(&self, id: ObjectId) -> CoreResult<Option<T>> {
        if id == 0 {
            return Ok(None);
        }
        self.store.read(|tx| self.get_in(tx, id))
    }

    pub(crate) fn get_in(&self, tx: &Transaction, id: ObjectId) -> CoreResult<Option<T>> {
        match tx.get(self.table(), id)? {
            Some(payload) => Ok(Some(decode_record(id, &payload)?)),
            None => Ok(None),
        }
    }

    /// Returns the stored objects among `ids`, in input order; missing IDs
    /// are skipped.
    pub fn get_many(&self, ids: &[ObjectId]) -> CoreResult<Vec<T>> {
        self.store.read(|tx| {
            let mut out = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(entity) = self.get_in(tx, *id)? {
                    out.push(entity);
                }
            }
            Ok(out)
        })
    }

    /// Returns the stored objects among `ids` keyed by ID.
    pub fn get_map(&self, ids: &[ObjectId]) -> CoreResult<HashMap<ObjectId, T>> {
        self.store.read(|tx| {
            let mut out = HashMap::with_capacity(ids.len());
            for id in ids {
                if let Some(entity) = self.get_in(tx, *id)? {
                    out.insert(*id, entity);
                }
            }
            Ok(out)
        })
    }

    /// Returns every object, ascending by ID, from one snapshot.
    pub fn all(&self) -> CoreResult<Vec<T>> {
        let table = self.table();
        self.store.read(|tx| {
            if self.store.config().stream_reads {
                // one payload alive at a time
                let ids = tx.ids(table)?;
                let mut out = Vec::with_capacity(ids.len());
                for id in ids {
                    if let Some(payload) = tx.get(table, id)? {
                        out.push(decode_record(id, &payload)?);
                    }
                }
                Ok(out)
            } else {
                tx.scan(table)?
                    .into_iter()
                    .map(|(id, payload)| decode_record(id, &payload))
                    .collect()
            }
        })
    }

    /// IDs of every object, ascending.
    pub fn ids(&self) -> CoreResult<Vec<ObjectId>> {
        self.store.read(|tx| tx.ids(self.table()))
    }

    /// Calls `visitor` with one object at a time until it returns
    /// `Ok(false)` or an error, which is returned after the transaction
    /// closed.
    ///
    /// `ids` restricts the visit to those objects, in that order. With
    /// `writable`, the visit runs in a write transaction the visitor may
    /// write through; an error discards those writes.
    pub fn visit(
        &self,
        ids: Option<&[ObjectId]>,
        writable: bool,
        mut visitor: impl FnMut(T) -> CoreResult<bool>,
    ) -> CoreResult<()> {
        let table = self.table();
        let body = |tx: &Transaction| -> CoreResult<()> {
            let ids = match ids {
                Some(ids) => ids.to_vec(),
                None => tx.ids(table)?,
            };
            for id in ids {
                let Some(payload) = tx.get(table, id)? else {
                    continue;
                };
                if !visitor(decode_record(id, &payload)?)? {
                    break;
                }
            }
            Ok(())
        };
        if writable {
            self.store.write(body)
        } else {
            self.store.read(body)
        }
    }

    /// Read-only visit of the given objects.
    pub fn visit_ids(
        &self,
        ids: &[ObjectId],
        visitor: impl FnMut(T) -> CoreResult<bool>,
    ) -> CoreResult<()> {
        self.visit(Some(ids), false, visitor)
    }

    /// Calls `f` with every object, ascending by ID.
    pub fn for_each(&self, mut f: impl FnMut(T)) -> CoreResult<()> {
        self.visit(None, false, |entity| {
            f(entity);
            Ok(true)
        })
    }

    /// Number of stored objects.
    pub fn count(&self) -> CoreResult<u64> {
        self.count_with_limit(0)
    }

    /// Number of stored objects, counting no further than `limit`
    /// (0 = no limit).
    pub fn count_with_limit(&self, limit: u64) -> CoreResult<u64> {
        self.store.read(|tx| tx.count(self.table(), limit))
    }

    /// Returns true if the box holds no objects.
    pub fn is_empty(&self) -> CoreResult<bool> {
        Ok(self.count_with_limit(1)? == 0)
    }

    /// Returns true if an object is stored under `id`.
    pub fn contains(&self, id: ObjectId) -> CoreResult<bool> {
        if id == 0 {
            return Ok(false);
        }
        self.store.read(|tx| tx.contains(self.table(), id))
    }

    /// Returns true only if every one of `ids` is stored.
    pub fn contains_all(&self, ids: &[ObjectId]) -> CoreResult<bool> {
        self.store.read(|tx| {
            for id in ids {
                if *id == 0 || !tx.contains(self.table(), *id)? {
                    return Ok(false);
                }
            }
            Ok(true)
        })
    }

    // ---- removal ----

    /// Removes the object stored under `id`; returns false if there was
    /// none.
    pub fn remove(&self, id: ObjectId) -> CoreResult<bool> {
        if id == 0 {
            return Ok(false);
        }
        self.store.write(|tx| self.remove_in(tx, id))
    }

    /// Removes `entity` by its ID; an entity never put is a no-op.
    pub fn remove_entity(&self, entity: &T) -> CoreResult<bool> {
        self.remove(entity.id())
    }

    /// Removes every one of `ids` in one transaction; returns how many
    /// existed.
    pub fn remove_many(&self, ids: &[ObjectId]) -> CoreResult<u64> {
        self.store.write(|tx| {
            let mut removed = 0;
            for id in ids {
                if self.remove_in(tx, *id)? {
                    removed += 1;
                }
            }
            Ok(removed)
        })
    }

    /// Removes every object; returns how many there were.
    pub fn remove_all(&self) -> CoreResult<u64> {
        self.store.write(|tx| {
            let ids = tx.ids(self.table())?;
            for id in &ids {
                self.remove_in(tx, *id)?;
            }
            Ok(ids.len() as u64)
        })
    }

    pub(crate) fn remove_in(&self, tx: &Transaction, id: ObjectId) -> CoreResult<bool> {
        if id == 0 || !tx.delete(self.table(), id)? {
            return Ok(false);
        }
        entity::detach(tx, T::ENTITY_TYPE, id)?;
        Ok(true)
    }

    // ---- relations ----

    /// IDs of objects whose to-one `property` points at `target`,
    /// ascending.
    pub fn backlink_ids<U: EntityCodec>(
        &self,
        property: ToOneProperty<T, U>,
        target: ObjectId,
    ) -> CoreResult<Vec<ObjectId>> {
        if target == 0 {
            return Ok(Vec::new());
        }
        let prop = self.schema.require_property(property.id())?;
        let prop_id = prop.id;
        self.store.read(|tx| {
            let indexes = tx.manager().indexes();
            if !tx.has_pending(self.table())? {
                if let Some(hits) =
                    indexes.lookup(T::ENTITY_TYPE, prop_id, &IndexValue::Int(target as i64))
                {
                    if hits.as_of == tx.snapshot() {
                        return Ok(hits.ids);
                    }
                }
            }
            let mut ids = Vec::new();
            for (id, payload) in tx.scan(self.table())? {
                if RecordReader::new(&payload).read_u64(prop_id.as_u16()) == target {
                    ids.push(id);
                }
            }
            Ok(ids)
        })
    }

    /// Links `source` to `target` through a standalone relation.
    ///
    /// # Errors
    ///
    /// `CannotRelateToUnsavedEntities` if `target` is not stored,
    /// `NotFound` if `source` is not.
    pub fn link<U: EntityCodec>(
        &self,
        relation: RelationHandle<T, U>,
        source: ObjectId,
        target: ObjectId,
    ) -> CoreResult<()> {
        self.store.write(|tx| {
            let schema = entity::relation_schema(tx, relation.id())?;
            if source == 0 || !tx.contains(self.table(), source)? {
                return Err(CoreError::not_found(format!(
                    "{} source {source} is not stored",
                    schema.name
                )));
            }
            entity::add_links(tx, &schema, source, &[target])
        })
    }

    /// Removes the link from `source` to `target`; a missing link is a
    /// no-op.
    pub fn unlink<U: EntityCodec>(
        &self,
        relation: RelationHandle<T, U>,
        source: ObjectId,
        target: ObjectId,
    ) -> CoreResult<()> {
        self.store.write(|tx| {
            let schema = entity::relation_schema(tx, relation.id())?;
            entity::remove_links(tx, &schema, source, &[target])
        })
    }

    /// IDs linked from `source`, ascending.
    pub fn targets<U: EntityCodec>(
        &self,
        relation: RelationHandle<T, U>,
        source: ObjectId,
    ) -> CoreResult<Vec<ObjectId>> {
        self.store
            .read(|tx| entity::targets(tx, relation.id(), source))
    }

    /// Objects linked from `source`, ascending by ID.
    pub fn related<U: EntityCodec>(
        &self,
        relation: RelationHandle<T, U>,
        source: ObjectId,
    ) -> CoreResult<Vec<U>> {
        let table = TableId::entity(U::ENTITY_TYPE);
        self.store.read(|tx| {
            let mut out = Vec::new();
            for id in entity::targets(tx, relation.id(), source)? {
                if let Some(payload) = tx.get(table, id)? {
                    out.push(decode_record(id, &payload)?);
                }
            }
            Ok(out)
        })
    }

    /// IDs of objects linking to `target` through `relation`, ascending.
    pub fn sources<S: EntityCodec>(
        &self,
        relation: RelationHandle<S, T>,
        target: ObjectId,
    ) -> CoreResult<Vec<ObjectId>> {
        self.store
            .read(|tx| entity::sources(tx, relation.id(), target))
    }

    // ---- queries and observers ----

    /// Starts a query over this box.
    #[must_use]
    pub fn query(&self) -> QueryBuilder<T> {
        QueryBuilder::new(Arc::clone(&self.store), Arc::clone(&self.schema))
    }

    /// Calls `callback` on the store's default dispatcher after every
    /// commit touching this entity type.
    pub fn subscribe(
        &self,
        flags: ObserverFlags,
        callback: impl Fn() + Send + Sync + 'static,
    ) -> CoreResult<Observer> {
        let dispatcher = self.store.default_dispatcher()?;
        self.subscribe_on(dispatcher, flags, callback)
    }

    /// Like [`EntityBox::subscribe`] on the given dispatcher.
    ///
    /// # Errors
    ///
    /// `IllegalArgument` for `DONT_SUBSCRIBE` without `SEND_INITIAL`.
    pub fn subscribe_on(
        &self,
        dispatcher: Arc<dyn Dispatcher>,
        flags: ObserverFlags,
        callback: impl Fn() + Send + Sync + 'static,
    ) -> CoreResult<Observer> {
        self.store.ensure_open()?;
        flags.check()?;
        Ok(self.store.observers().subscribe(
            vec![T::ENTITY_TYPE],
            dispatcher,
            flags,
            Arc::new(callback),
        ))
    }

    /// Delivers every object of the box to `handler` on the store's
    /// default dispatcher after every commit touching this entity type.
    pub fn subscribe_results(
        &self,
        flags: ObserverFlags,
        handler: impl Fn(CoreResult<Vec<T>>) + Send + Sync + 'static,
    ) -> CoreResult<Observer> {
        let dispatcher = self.store.default_dispatcher()?;
        self.subscribe_results_on(dispatcher, flags, handler)
    }

    /// Like [`EntityBox::subscribe_results`] on the given dispatcher.
    pub fn subscribe_results_on(
        &self,
        dispatcher: Arc<dyn Dispatcher>,
        flags: ObserverFlags,
        handler: impl Fn(CoreResult<Vec<T>>) + Send + Sync + 'static,
    ) -> CoreResult<Observer> {
        // weak, so a live observer does not keep the store open
        let store = Arc::downgrade(&self.store);
        let schema = Arc::clone(&self.schema);
        self.subscribe_on(dispatcher, flags, move || {
            let Some(store) = store.upgrade() else {
                return;
            };
            handler(EntityBox::<T>::new(store, Arc::clone(&schema)).all());
        })
    }
}

impl<T: EntityCodec> Clone for EntityBox<T> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            schema: Arc::clone(&self.schema),
            _marker: PhantomData,
        }
    }
}

impl<T: EntityCodec> std::fmt::Debug for EntityBox<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityBox")
            .field("entity", &self.schema.name)
            .field("type_id", &T::ENTITY_TYPE)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::fixtures::{memory_store, Company, Person, MEMBERS};
    use crate::observer::ImmediateDispatcher;
    use crate::store::Store;
    use crate::Config;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn put_assigns_and_writes_back_ids() {
        let store = memory_store();
        let people = store.entity_box::<Person>().unwrap();

        let mut ada = Person::named("ada");
        let id = people.put(&mut ada).unwrap();
        assert_ne!(id, 0);
        assert_eq!(ada.id, id);

        let stored = people.get(id).unwrap().unwrap();
        assert_eq!(stored, ada);
    }

    #[test]
    fn ids_increase_across_puts() {
        let store = memory_store();
        let people = store.entity_box::<Person>().unwrap();
        let first = people.put_immutable(&Person::named("a")).unwrap();
        let batch = people
            .put_many_immutable(&[Person::named("b"), Person::named("c")])
            .unwrap();
        assert!(batch[0] > first);
        assert!(batch[1] > batch[0]);
    }

    #[test]
    fn explicit_id_moves_the_sequence() {
        let store = memory_store();
        let people = store.entity_box::<Person>().unwrap();
        let mut p = Person::named("fixed");
        p.id = 100;
        assert_eq!(people.put(&mut p).unwrap(), 100);
        assert_eq!(people.put_immutable(&Person::named("next")).unwrap(), 101);
    }

    #[test]
    fn put_modes() {
        let store = memory_store();
        let people = store.entity_box::<Person>().unwrap();
        let mut p = Person::named("mode");

        let err = people.put_with_mode(&mut p, PutMode::Update).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let id = people.put_with_mode(&mut p, PutMode::Insert).unwrap();
        let err = people.put_with_mode(&mut p, PutMode::Insert).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UniqueViolation);

        p.age = 7;
        assert_eq!(people.put_with_mode(&mut p, PutMode::Update).unwrap(), id);
        assert_eq!(people.get(id).unwrap().unwrap().age, 7);
    }

    #[test]
    fn put_many_is_all_or_nothing() {
        let store = memory_store();
        let people = store.entity_box::<Person>().unwrap();
        let mut batch = vec![
            Person::named("a").with_email("a@x"),
            Person::named("b").with_email("dup@x"),
            Person::named("c").with_email("dup@x"),
            Person::named("d").with_email("d@x"),
        ];
        let err = people.put_many(&mut batch).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UniqueViolation);
        assert_eq!(people.count().unwrap(), 0);
        assert!(batch.iter().all(|p| p.id == 0));

        batch[2].email = Some("c@x".into());
        let ids = people.put_many(&mut batch).unwrap();
        assert_eq!(ids.len(), 4);
        assert!(batch.iter().zip(&ids).all(|(p, id)| p.id == *id));
    }

    #[test]
    fn get_many_follows_input_order() {
        let store = memory_store();
        let people = store.entity_box::<Person>().unwrap();
        let a = people.put_immutable(&Person::named("a")).unwrap();
        let b = people.put_immutable(&Person::named("b")).unwrap();

        let names: Vec<String> = people
            .get_many(&[b, 999, a])
            .unwrap()
            .into_iter()
            .map(|p| p.name)
            .collect();
        assert_eq!(names, vec!["b", "a"]);

        let map = people.get_map(&[a, 999]).unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(map[&a].name, "a");
        assert!(people.get(0).unwrap().is_none());
    }

    #[test]
    fn streamed_all_matches_bulk_all() {
        let bulk_store = memory_store();
        let streamed = Store::open(
            crate::fixtures::company_model(),
            crate::StoreLocation::Memory("typed-streamed".into()),
            Config::default().stream_reads(true),
        )
        .unwrap();
        for store in [&bulk_store, &streamed] {
            let people = store.entity_box::<Person>().unwrap();
            people
                .put_many_immutable(&[Person::named("x"), Person::named("y")])
                .unwrap();
        }
        let bulk = bulk_store.entity_box::<Person>().unwrap().all().unwrap();
        let stream = streamed.entity_box::<Person>().unwrap().all().unwrap();
        assert_eq!(bulk, stream);
        assert_eq!(bulk.len(), 2);
    }

    #[test]
    fn visit_stops_early_and_propagates_errors() {
        let store = memory_store();
        let people = store.entity_box::<Person>().unwrap();
        people
            .put_many_immutable(&[Person::named("a"), Person::named("b"), Person::named("c")])
            .unwrap();

        let mut seen = Vec::new();
        people
            .visit(None, false, |p| {
                seen.push(p.name);
                Ok(seen.len() < 2)
            })
            .unwrap();
        assert_eq!(seen, vec!["a", "b"]);

        let err = people
            .visit(None, false, |_| Err(CoreError::constraint("stop")))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConstraintViolated);
        // the read transaction was closed; writes still work
        people.put_immutable(&Person::named("d")).unwrap();
    }

    #[test]
    fn writable_visit_may_update() {
        let store = memory_store();
        let people = store.entity_box::<Person>().unwrap();
        people
            .put_many_immutable(&[Person::new("a", 1), Person::new("b", 2)])
            .unwrap();
        people
            .visit(None, true, |mut p| {
                p.age += 10;
                people.put(&mut p)?;
                Ok(true)
            })
            .unwrap();
        let ages: Vec<i32> = people.all().unwrap().into_iter().map(|p| p.age).collect();
        assert_eq!(ages, vec![11, 12]);

        let err = people
            .visit(None, false, |mut p| {
                people.put(&mut p)?;
                Ok(true)
            })
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CannotWriteWhileReading);
    }

    #[test]
    fn remove_semantics() {
        let store = memory_store();
        let people = store.entity_box::<Person>().unwrap();
        assert!(!people.remove(0).unwrap());
        assert!(!people.remove(12345).unwrap());
        assert!(!people.remove_entity(&Person::named("never put")).unwrap());

        let id = people.put_immutable(&Person::named("x")).unwrap();
        assert!(people.remove(id).unwrap());
        assert!(people.get(id).unwrap().is_none());
        assert!(!people.remove(id).unwrap());

        let ids = people
            .put_many_immutable(&[Person::named("a"), Person::named("b")])
            .unwrap();
        assert_eq!(people.remove_many(&[ids[0], 999]).unwrap(), 1);
        assert_eq!(people.remove_all().unwrap(), 1);
        assert!(people.is_empty().unwrap());
    }

    #[test]
    fn counting_and_contains() {
        let store = memory_store();
        let people = store.entity_box::<Person>().unwrap();
        let ids = people
            .put_many_immutable(&[Person::named("a"), Person::named("b"), Person::named("c")])
            .unwrap();
        assert_eq!(people.count().unwrap(), 3);
        assert_eq!(people.count_with_limit(2).unwrap(), 2);
        assert!(people.contains(ids[1]).unwrap());
        assert!(!people.contains(0).unwrap());
        assert!(people.contains_all(&ids).unwrap());
        assert!(!people.contains_all(&[ids[0], 77]).unwrap());
    }

    #[test]
    fn to_one_requires_stored_target() {
        let store = memory_store();
        let people = store.entity_box::<Person>().unwrap();
        let companies = store.entity_box::<Company>().unwrap();

        let unsaved = Company::named("ghost");
        let mut p = Person::named("emp");
        p.employer.set(&unsaved);
        let err = people.put(&mut p).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CannotRelateToUnsavedEntities);

        p.employer.set_id(42);
        let err = people.put(&mut p).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CannotRelateToUnsavedEntities);

        let mut acme = Company::named("acme");
        companies.put(&mut acme).unwrap();
        p.employer.set(&acme);
        let id = people.put(&mut p).unwrap();

        let back = people.backlink_ids(Person::EMPLOYER, acme.id).unwrap();
        assert_eq!(back, vec![id]);
        let resolved = people.get(id).unwrap().unwrap().employer.resolve(&companies).unwrap();
        assert_eq!(resolved.map(|c| c.name), Some("acme".to_string()));
    }

    #[test]
    fn backlinks_see_pending_writes() {
        let store = memory_store();
        let people = store.entity_box::<Person>().unwrap();
        let companies = store.entity_box::<Company>().unwrap();
        let acme = companies.put_immutable(&Company::named("acme")).unwrap();
        store
            .run_in_transaction(|_| {
                let mut p = Person::named("inside");
                p.employer.set_id(acme);
                let id = people.put(&mut p)?;
                assert_eq!(people.backlink_ids(Person::EMPLOYER, acme)?, vec![id]);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn to_many_is_written_on_first_insert() {
        let store = memory_store();
        let people = store.entity_box::<Person>().unwrap();
        let companies = store.entity_box::<Company>().unwrap();
        let mut alice = Person::named("alice");
        let mut bob = Person::named("bob");
        people.put(&mut alice).unwrap();
        people.put(&mut bob).unwrap();

        let mut acme = Company::named("acme");
        acme.members.add(&alice);
        acme.members.add(&bob);
        let acme_id = companies.put(&mut acme).unwrap();
        assert_eq!(companies.targets(MEMBERS, acme_id).unwrap(), vec![alice.id, bob.id]);

        // updates leave links alone until applied explicitly
        acme.members = crate::entity::ToMany::new();
        acme.members.remove(&bob);
        companies.put(&mut acme).unwrap();
        assert_eq!(companies.targets(MEMBERS, acme_id).unwrap().len(), 2);
        companies.apply_relations(&acme).unwrap();
        assert_eq!(companies.targets(MEMBERS, acme_id).unwrap(), vec![alice.id]);

        assert_eq!(people.sources(MEMBERS, alice.id).unwrap(), vec![acme_id]);
        let related = companies.related(MEMBERS, acme_id).unwrap();
        assert_eq!(related, vec![alice.clone()]);
    }

    #[test]
    fn unsaved_to_many_target_fails_the_put() {
        let store = memory_store();
        let companies = store.entity_box::<Company>().unwrap();
        let mut acme = Company::named("acme");
        acme.members.add(&Person::named("unsaved"));
        let err = companies.put(&mut acme).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CannotRelateToUnsavedEntities);
        assert_eq!(companies.count().unwrap(), 0);
    }

    #[test]
    fn link_unlink_and_removal_cleanup() {
        let store = memory_store();
        let people = store.entity_box::<Person>().unwrap();
        let companies = store.entity_box::<Company>().unwrap();
        let p = people.put_immutable(&Person::named("p")).unwrap();
        let c = companies.put_immutable(&Company::named("c")).unwrap();

        let err = companies.link(MEMBERS, c, 999).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CannotRelateToUnsavedEntities);
        let err = companies.link(MEMBERS, 999, p).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        companies.link(MEMBERS, c, p).unwrap();
        companies.link(MEMBERS, c, p).unwrap();
        assert_eq!(companies.targets(MEMBERS, c).unwrap(), vec![p]);

        companies.unlink(MEMBERS, c, p).unwrap();
        assert!(companies.targets(MEMBERS, c).unwrap().is_empty());

        companies.link(MEMBERS, c, p).unwrap();
        assert!(people.remove(p).unwrap());
        assert!(companies.targets(MEMBERS, c).unwrap().is_empty());
    }

    #[test]
    fn box_observer_fires_after_commit() {
        let store = memory_store();
        let people = store.entity_box::<Person>().unwrap();
        let companies = store.entity_box::<Company>().unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let inner = Arc::clone(&count);
        let observer = people
            .subscribe_on(
                Arc::new(ImmediateDispatcher),
                ObserverFlags::NONE,
                move || {
                    inner.fetch_add(1, Ordering::SeqCst);
                },
            )
            .unwrap();

        people.put_immutable(&Person::named("a")).unwrap();
        companies.put_immutable(&Company::named("c")).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // nothing changed, nothing to report
        assert!(!people.remove(999).unwrap());
        assert_eq!(count.load(Ordering::SeqCst), 1);

        observer.unsubscribe();
        people.put_immutable(&Person::named("b")).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn result_observer_receives_all_objects() {
        let store = memory_store();
        let people = store.entity_box::<Person>().unwrap();
        people.put_immutable(&Person::named("a")).unwrap();

        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _observer = people
            .subscribe_results_on(
                Arc::new(ImmediateDispatcher),
                ObserverFlags::SEND_INITIAL,
                move |result| {
                    let names: Vec<String> = result.unwrap().into_iter().map(|p| p.name).collect();
                    sink.lock().unwrap().push(names);
                },
            )
            .unwrap();

        people.put_immutable(&Person::named("b")).unwrap();
        assert_eq!(
            *seen.lock().unwrap(),
            vec![vec!["a".to_string()], vec!["a".to_string(), "b".to_string()]]
        );
    }

    #[test]
    fn dont_subscribe_needs_send_initial() {
        let store = memory_store();
        let people = store.entity_box::<Person>().unwrap();

        let err = people
            .subscribe_on(Arc::new(ImmediateDispatcher), ObserverFlags::DONT_SUBSCRIBE, || {})
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IllegalArgument);
        let err = people
            .query()
            .build()
            .unwrap()
            .subscribe_on(Arc::new(ImmediateDispatcher), ObserverFlags::DONT_SUBSCRIBE, |_| {})
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IllegalArgument);

        let count = Arc::new(AtomicUsize::new(0));
        let inner = Arc::clone(&count);
        let _once = people
            .subscribe_on(
                Arc::new(ImmediateDispatcher),
                ObserverFlags::SEND_INITIAL | ObserverFlags::DONT_SUBSCRIBE,
                move || {
                    inner.fetch_add(1, Ordering::SeqCst);
                },
            )
            .unwrap();
        people.put_immutable(&Person::named("a")).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
