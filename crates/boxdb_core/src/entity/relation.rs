//! Relations between entities.
//!
//! A to-one relation is a `Relation` property holding the target's object
//! ID. A to-many relation has its own table: one row per source object,
//! holding the sorted target IDs as little-endian `u64`s. A row whose
//! target list becomes empty is deleted.

use crate::collection::{EntityBox, EntityCodec};
use crate::error::{CoreError, CoreResult};
use crate::schema::RelationSchema;
use crate::transaction::Transaction;
use crate::types::{EntityTypeId, ObjectId, RelationId, TableId};
use std::fmt;
use std::marker::PhantomData;

/// Typed handle of a standalone to-many relation from `S` to `T`.
pub struct RelationHandle<S, T> {
    id: RelationId,
    _marker: PhantomData<fn() -> (S, T)>,
}

impl<S, T> RelationHandle<S, T> {
    /// Creates a handle for relation `id`.
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self {
            id: RelationId::new(id),
            _marker: PhantomData,
        }
    }

    /// Returns the relation ID.
    #[must_use]
    pub const fn id(&self) -> RelationId {
        self.id
    }
}

impl<S, T> Clone for RelationHandle<S, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<S, T> Copy for RelationHandle<S, T> {}

impl<S, T> fmt::Debug for RelationHandle<S, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RelationHandle").field(&self.id).finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Null,
    Id(ObjectId),
    Unsaved,
}

/// A to-one reference stored in a `Relation` property.
///
/// Pointing it at an object that was never put is allowed until the owner
/// is put, which then fails with `CannotRelateToUnsavedEntities`.
pub struct ToOne<T> {
    target: Target,
    _marker: PhantomData<fn() -> T>,
}

impl<T> ToOne<T> {
    /// A reference to nothing.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            target: Target::Null,
            _marker: PhantomData,
        }
    }

    /// A reference to object `id`; 0 means no target.
    #[must_use]
    pub const fn from_id(id: ObjectId) -> Self {
        Self {
            target: if id == 0 { Target::Null } else { Target::Id(id) },
            _marker: PhantomData,
        }
    }

    /// Points the reference at object `id`; 0 clears it.
    pub fn set_id(&mut self, id: ObjectId) {
        *self = Self::from_id(id);
    }

    /// Clears the reference.
    pub fn clear(&mut self) {
        self.target = Target::Null;
    }

    /// Returns the target ID, or `None` if there is no persisted target.
    #[must_use]
    pub fn target_id(&self) -> Option<ObjectId> {
        match self.target {
            Target::Id(id) => Some(id),
            Target::Null | Target::Unsaved => None,
        }
    }

    /// Returns true if the reference points nowhere.
    #[must_use]
    pub fn is_null(&self) -> bool {
        self.target == Target::Null
    }

    /// Returns the ID to store in the owner's record, 0 for no target.
    ///
    /// # Errors
    ///
    /// Fails with `CannotRelateToUnsavedEntities` if the target was never
    /// put.
    pub fn encode_id(&self) -> CoreResult<ObjectId> {
        match self.target {
            Target::Null => Ok(0),
            Target::Id(id) => Ok(id),
            Target::Unsaved => Err(CoreError::unsaved_relation(
                "to-one target has no object ID; put it first",
            )),
        }
    }
}

impl<T: EntityCodec> ToOne<T> {
    /// A reference to `target`, which must already be stored.
    #[must_use]
    pub fn to(target: &T) -> Self {
        let mut one = Self::none();
        one.set(target);
        one
    }

    /// Points the reference at `target`.
    pub fn set(&mut self, target: &T) {
        self.target = match target.id() {
            0 => Target::Unsaved,
            id => Target::Id(id),
        };
    }

    /// Loads the target object.
    pub fn resolve(&self, targets: &EntityBox<T>) -> CoreResult<Option<T>> {
        match self.target_id() {
            Some(id) => targets.get(id),
            None => Ok(None),
        }
    }
}

impl<T> Default for ToOne<T> {
    fn default() -> Self {
        Self::none()
    }
}

impl<T> Clone for ToOne<T> {
    fn clone(&self) -> Self {
        Self {
            target: self.target,
            _marker: PhantomData,
        }
    }
}

impl<T> PartialEq for ToOne<T> {
    fn eq(&self, other: &Self) -> bool {
        self.target == other.target
    }
}

impl<T> fmt::Debug for ToOne<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.target {
            Target::Null => f.write_str("ToOne(none)"),
            Target::Id(id) => write!(f, "ToOne({id})"),
            Target::Unsaved => f.write_str("ToOne(unsaved)"),
        }
    }
}

/// Pending changes to a standalone to-many relation.
///
/// Additions and removals are written when the owner is first inserted,
/// or explicitly through [`EntityBox::apply_relations`]. Applying the same
/// changes twice has no further effect.
pub struct ToMany<T> {
    added: Vec<ObjectId>,
    removed: Vec<ObjectId>,
    unsaved: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T> ToMany<T> {
    /// An empty change set.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            added: Vec::new(),
            removed: Vec::new(),
            unsaved: 0,
            _marker: PhantomData,
        }
    }

    /// Links target `id`.
    pub fn add_id(&mut self, id: ObjectId) {
        if id == 0 {
            self.unsaved += 1;
            return;
        }
        self.removed.retain(|r| *r != id);
        if !self.added.contains(&id) {
            self.added.push(id);
        }
    }

    /// Unlinks target `id`.
    pub fn remove_id(&mut self, id: ObjectId) {
        if id == 0 {
            return;
        }
        self.added.retain(|a| *a != id);
        if !self.removed.contains(&id) {
            self.removed.push(id);
        }
    }

    /// Targets to link.
    #[must_use]
    pub fn added(&self) -> &[ObjectId] {
        &self.added
    }

    /// Targets to unlink.
    #[must_use]
    pub fn removed(&self) -> &[ObjectId] {
        &self.removed
    }

    /// Returns true if there is anything to apply.
    #[must_use]
    pub fn has_pending_changes(&self) -> bool {
        !self.added.is_empty() || !self.removed.is_empty() || self.unsaved > 0
    }
}

impl<T: EntityCodec> ToMany<T> {
    /// Links `target`, which must already be stored when the changes are
    /// applied.
    pub fn add(&mut self, target: &T) {
        self.add_id(target.id());
    }

    /// Unlinks `target`.
    pub fn remove(&mut self, target: &T) {
        self.remove_id(target.id());
    }
}

impl<T> Default for ToMany<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for ToMany<T> {
    fn clone(&self) -> Self {
        Self {
            added: self.added.clone(),
            removed: self.removed.clone(),
            unsaved: self.unsaved,
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for ToMany<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToMany")
            .field("added", &self.added)
            .field("removed", &self.removed)
            .field("unsaved", &self.unsaved)
            .finish()
    }
}

/// Writes to-many links of one freshly stored object.
pub struct RelationWriter<'a> {
    tx: &'a Transaction,
    source_type: EntityTypeId,
    source: ObjectId,
}

impl<'a> RelationWriter<'a> {
    pub(crate) fn new(tx: &'a Transaction, source_type: EntityTypeId, source: ObjectId) -> Self {
        Self {
            tx,
            source_type,
            source,
        }
    }

    /// ID of the object whose links are written.
    #[must_use]
    pub fn source(&self) -> ObjectId {
        self.source
    }

    /// Applies the pending changes of `links` to `relation`.
    pub fn apply<S: EntityCodec, T: EntityCodec>(
        &mut self,
        relation: RelationHandle<S, T>,
        links: &ToMany<T>,
    ) -> CoreResult<()> {
        let schema = relation_schema(self.tx, relation.id())?;
        if schema.source != self.source_type || S::ENTITY_TYPE != self.source_type {
            return Err(CoreError::illegal_argument(format!(
                "relation {} does not start at {}",
                schema.name, self.source_type
            )));
        }
        if links.unsaved > 0 {
            return Err(CoreError::unsaved_relation(format!(
                "{} of {} targets of {} were never put",
                links.unsaved,
                links.unsaved + links.added.len(),
                schema.name
            )));
        }
        if !links.has_pending_changes() {
            return Ok(());
        }
        add_links(self.tx, &schema, self.source, links.added())?;
        remove_links(self.tx, &schema, self.source, links.removed())
    }
}

pub(crate) fn relation_schema(tx: &Transaction, id: RelationId) -> CoreResult<RelationSchema> {
    Ok(tx.manager().model().relation(id)?.clone())
}

fn encode_targets(targets: &[ObjectId]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(targets.len() * 8);
    for target in targets {
        buf.extend_from_slice(&target.to_le_bytes());
    }
    buf
}

fn decode_targets(payload: &[u8]) -> CoreResult<Vec<ObjectId>> {
    if payload.len() % 8 != 0 {
        return Err(CoreError::pages_corrupt(format!(
            "link row of {} bytes is not a list of IDs",
            payload.len()
        )));
    }
    Ok(payload
        .chunks_exact(8)
        .map(|chunk| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(chunk);
            u64::from_le_bytes(raw)
        })
        .collect())
}

/// Sorted targets linked from `source`.
pub(crate) fn targets(
    tx: &Transaction,
    relation: RelationId,
    source: ObjectId,
) -> CoreResult<Vec<ObjectId>> {
    match tx.get(TableId::relation(relation), source)? {
        Some(payload) => decode_targets(&payload),
        None => Ok(Vec::new()),
    }
}

fn set_targets(
    tx: &Transaction,
    relation: RelationId,
    source: ObjectId,
    mut list: Vec<ObjectId>,
) -> CoreResult<()> {
    list.sort_unstable();
    list.dedup();
    let table = TableId::relation(relation);
    if list.is_empty() {
        tx.delete(table, source)?;
        Ok(())
    } else {
        tx.put(table, source, encode_targets(&list))
    }
}

/// Every link row of `relation`, ascending by source.
pub(crate) fn all_links(
    tx: &Transaction,
    relation: RelationId,
) -> CoreResult<Vec<(ObjectId, Vec<ObjectId>)>> {
    tx.scan(TableId::relation(relation))?
        .into_iter()
        .map(|(source, payload)| Ok((source, decode_targets(&payload)?)))
        .collect()
}

/// Sources linking to `target`, ascending.
pub(crate) fn sources(
    tx: &Transaction,
    relation: RelationId,
    target: ObjectId,
) -> CoreResult<Vec<ObjectId>> {
    Ok(all_links(tx, relation)?
        .into_iter()
        .filter(|(_, list)| list.binary_search(&target).is_ok())
        .map(|(source, _)| source)
        .collect())
}

/// Links `source` to each of `new_targets`, which must exist.
pub(crate) fn add_links(
    tx: &Transaction,
    relation: &RelationSchema,
    source: ObjectId,
    new_targets: &[ObjectId],
) -> CoreResult<()> {
    if new_targets.is_empty() {
        return Ok(());
    }
    let target_table = TableId::entity(relation.target);
    for target in new_targets {
        if *target == 0 || !tx.contains(target_table, *target)? {
            return Err(CoreError::unsaved_relation(format!(
                "{} target {target} is not stored",
                relation.name
            )));
        }
    }
    let mut list = targets(tx, relation.id, source)?;
    list.extend_from_slice(new_targets);
    set_targets(tx, relation.id, source, list)
}

/// Unlinks `source` from each of `old_targets`.
pub(crate) fn remove_links(
    tx: &Transaction,
    relation: &RelationSchema,
    source: ObjectId,
    old_targets: &[ObjectId],
) -> CoreResult<()> {
    if old_targets.is_empty() {
        return Ok(());
    }
    let mut list = targets(tx, relation.id, source)?;
    let before = list.len();
    list.retain(|t| !old_targets.contains(t));
    if list.len() == before {
        return Ok(());
    }
    set_targets(tx, relation.id, source, list)
}

/// Removes every link row that mentions object `id` of `entity`.
pub(crate) fn detach(tx: &Transaction, entity: EntityTypeId, id: ObjectId) -> CoreResult<()> {
    let relations: Vec<RelationSchema> = tx
        .manager()
        .model()
        .relations_involving(entity)
        .cloned()
        .collect();
    for relation in relations {
        if relation.source == entity {
            tx.delete(TableId::relation(relation.id), id)?;
        }
        if relation.target == entity {
            for (source, mut list) in all_links(tx, relation.id)? {
                if let Ok(pos) = list.binary_search(&id) {
                    list.remove(pos);
                    set_targets(tx, relation.id, source, list)?;
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Tag;

    #[test]
    fn targets_encode_as_sorted_ids() {
        let bytes = encode_targets(&[1, 300]);
        assert_eq!(bytes.len(), 16);
        assert_eq!(decode_targets(&bytes).unwrap(), vec![1, 300]);
        assert!(decode_targets(&bytes[..5]).is_err());
    }

    #[test]
    fn to_one_states() {
        let mut one: ToOne<Tag> = ToOne::none();
        assert!(one.is_null());
        assert_eq!(one.encode_id().unwrap(), 0);

        one.set_id(5);
        assert_eq!(one.target_id(), Some(5));
        assert_eq!(one.encode_id().unwrap(), 5);
        assert_eq!(format!("{one:?}"), "ToOne(5)");

        one.set_id(0);
        assert!(one.is_null());
        assert_eq!(ToOne::<Tag>::from_id(0), ToOne::none());
    }

    #[test]
    fn unsaved_to_one_fails_to_encode() {
        let one: ToOne<Tag> = ToOne {
            target: Target::Unsaved,
            _marker: PhantomData,
        };
        assert_eq!(one.target_id(), None);
        assert_eq!(
            one.encode_id().unwrap_err().kind(),
            crate::error::ErrorKind::CannotRelateToUnsavedEntities
        );
    }

    #[test]
    fn to_many_tracks_changes() {
        let mut many: ToMany<Tag> = ToMany::new();
        assert!(!many.has_pending_changes());

        many.add_id(3);
        many.add_id(3);
        many.add_id(4);
        many.remove_id(4);
        assert_eq!(many.added(), &[3]);
        assert_eq!(many.removed(), &[4]);

        many.add_id(4);
        assert_eq!(many.added(), &[3, 4]);
        assert!(many.removed().is_empty());

        many.add_id(0);
        assert!(many.has_pending_changes());
        assert_eq!(many.unsaved, 1);
    }
}
