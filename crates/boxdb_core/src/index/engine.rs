//! Index engine: keeps every secondary index in step with committed data.
//!
//! The engine is updated by the commit path while the writer slot is held,
//! after the commit's rows reached the segment file and before the commit
//! becomes visible. `as_of` records which committed sequence the indexes
//! reflect, so a reader only uses them when its snapshot matches.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use boxdb_codec::RecordReader;
use parking_lot::RwLock;

use crate::error::{CoreError, CoreResult};
use crate::index::{BTreeIndex, HashIndex, Index, IndexSpec, IndexValue};
use crate::schema::{EntitySchema, Model, PropertyFlags};
use crate::types::{EntityTypeId, ObjectId, PropertyId, SequenceNumber};

enum PropertyIndex {
    Hash(HashIndex<IndexValue>),
    Ordered(BTreeIndex<IndexValue>),
}

impl PropertyIndex {
    fn get(&self) -> &dyn Index<IndexValue> {
        match self {
            Self::Hash(index) => index as &dyn Index<IndexValue>,
            Self::Ordered(index) => index as &dyn Index<IndexValue>,
        }
    }

    fn get_mut(&mut self) -> &mut dyn Index<IndexValue> {
        match self {
            Self::Hash(index) => index as &mut dyn Index<IndexValue>,
            Self::Ordered(index) => index as &mut dyn Index<IndexValue>,
        }
    }
}

struct IndexState {
    indexes: HashMap<(EntityTypeId, PropertyId), PropertyIndex>,
    as_of: SequenceNumber,
}

/// One object's change as seen by the indexes.
#[derive(Debug, Clone, Copy)]
pub struct IndexChange<'a> {
    /// Changed object.
    pub id: ObjectId,
    /// Committed payload before the change, if the object existed.
    pub old: Option<&'a [u8]>,
    /// Payload after the change, `None` for a removal.
    pub new: Option<&'a [u8]>,
}

/// Result of an index probe: matching IDs plus the sequence the index
/// reflects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexHits {
    /// Matching object IDs, ascending.
    pub ids: Vec<ObjectId>,
    /// Committed sequence the index reflects.
    pub as_of: SequenceNumber,
}

/// Owns the secondary indexes of all entity types.
pub struct IndexEngine {
    model: Arc<Model>,
    state: RwLock<IndexState>,
}

fn keys_of(schema: &EntitySchema, payload: &[u8]) -> Vec<(PropertyId, IndexValue)> {
    let reader = RecordReader::new(payload);
    schema
        .indexed_properties()
        .filter_map(|prop| {
            IndexValue::from_value(&reader.read_value(prop.id.as_u16(), prop.ty))
                .map(|key| (prop.id, key))
        })
        .collect()
}

impl IndexEngine {
    /// Creates empty indexes for every indexed property of `model`.
    pub fn new(model: Arc<Model>) -> Self {
        let mut indexes = HashMap::new();
        for entity in model.entities() {
            for prop in entity.indexed_properties() {
                let mut spec = IndexSpec::new(
                    entity.id,
                    prop.id,
                    format!("{}.{}", entity.name, prop.name),
                );
                if prop.is_unique() {
                    spec = spec.unique();
                }
                let index = if prop.flags.contains(PropertyFlags::INDEX_HASH) {
                    PropertyIndex::Hash(HashIndex::new(spec))
                } else {
                    PropertyIndex::Ordered(BTreeIndex::new(spec))
                };
                indexes.insert((entity.id, prop.id), index);
            }
        }
        Self {
            model,
            state: RwLock::new(IndexState {
                indexes,
                as_of: SequenceNumber::default(),
            }),
        }
    }

    /// Sequence the indexes currently reflect.
    pub fn as_of(&self) -> SequenceNumber {
        self.state.read().as_of
    }

    /// Rebuilds all indexes of `entity` from its committed rows.
    pub fn rebuild_entity(
        &self,
        entity: EntityTypeId,
        rows: &[(ObjectId, Vec<u8>)],
        as_of: SequenceNumber,
    ) -> CoreResult<()> {
        let schema = self.model.entity(entity)?;
        let mut state = self.state.write();
        for prop in schema.indexed_properties() {
            if let Some(index) = state.indexes.get_mut(&(entity, prop.id)) {
                index.get_mut().clear();
            }
        }
        for (id, payload) in rows {
            for (prop, key) in keys_of(schema, payload) {
                if let Some(index) = state.indexes.get_mut(&(entity, prop)) {
                    index.get_mut().insert(key, *id)?;
                }
            }
        }
        state.as_of = as_of;
        Ok(())
    }

    /// Verifies that committing `changes` keeps every unique index unique.
    ///
    /// Must run while the indexes reflect the committing transaction's
    /// snapshot. Objects changed by the transaction are judged by their new
    /// payload only.
    pub fn check_unique(&self, entity: EntityTypeId, changes: &[IndexChange<'_>]) -> CoreResult<()> {
        let schema = self.model.entity(entity)?;
        let unique: Vec<_> = schema
            .indexed_properties()
            .filter(|p| p.is_unique())
            .collect();
        if unique.is_empty() {
            return Ok(());
        }

        let touched: HashSet<ObjectId> = changes.iter().map(|c| c.id).collect();
        let state = self.state.read();
        for prop in unique {
            let Some(index) = state.indexes.get(&(entity, prop.id)) else {
                continue;
            };
            let mut claimed: HashMap<IndexValue, ObjectId> = HashMap::new();
            for change in changes {
                let Some(payload) = change.new else {
                    continue;
                };
                let value = RecordReader::new(payload).read_value(prop.id.as_u16(), prop.ty);
                let Some(key) = IndexValue::from_value(&value) else {
                    continue;
                };
                let taken_by_committed = index
                    .get()
                    .lookup(&key)
                    .into_iter()
                    .any(|owner| owner != change.id && !touched.contains(&owner));
                let taken_in_batch = claimed
                    .insert(key.clone(), change.id)
                    .is_some_and(|owner| owner != change.id);
                if taken_by_committed || taken_in_batch {
                    return Err(CoreError::UniqueViolation {
                        entity: schema.name.clone(),
                        property: prop.name.clone(),
                        value: key.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Applies committed changes of `entity` and advances `as_of`.
    pub fn apply(
        &self,
        entity: EntityTypeId,
        changes: &[IndexChange<'_>],
        as_of: SequenceNumber,
    ) -> CoreResult<()> {
        let schema = self.model.entity(entity)?;
        let mut state = self.state.write();
        // all removals first so a value moving between objects never
        // collides with itself in a unique index
        for change in changes {
            if let Some(old) = change.old {
                for (prop, key) in keys_of(schema, old) {
                    if let Some(index) = state.indexes.get_mut(&(entity, prop)) {
                        index.get_mut().remove(&key, change.id);
                    }
                }
            }
        }
        for change in changes {
            if let Some(new) = change.new {
                for (prop, key) in keys_of(schema, new) {
                    if let Some(index) = state.indexes.get_mut(&(entity, prop)) {
                        index.get_mut().insert(key, change.id)?;
                    }
                }
            }
        }
        state.as_of = as_of;
        Ok(())
    }

    /// Marks the indexes current at `as_of` when a commit changed nothing
    /// indexed.
    pub fn advance(&self, as_of: SequenceNumber) {
        self.state.write().as_of = as_of;
    }

    /// Exact-match probe.
    pub fn lookup(
        &self,
        entity: EntityTypeId,
        property: PropertyId,
        key: &IndexValue,
    ) -> Option<IndexHits> {
        let state = self.state.read();
        let index = state.indexes.get(&(entity, property))?;
        Some(IndexHits {
            ids: index.get().lookup(key),
            as_of: state.as_of,
        })
    }

    /// Inclusive range probe; only ordered indexes answer it.
    pub fn range(
        &self,
        entity: EntityTypeId,
        property: PropertyId,
        low: &IndexValue,
        high: &IndexValue,
    ) -> Option<IndexHits> {
        let state = self.state.read();
        match state.indexes.get(&(entity, property))? {
            PropertyIndex::Ordered(index) if low <= high => Some(IndexHits {
                ids: index.range(low.clone()..=high.clone()),
                as_of: state.as_of,
            }),
            PropertyIndex::Ordered(_) => Some(IndexHits {
                ids: Vec::new(),
                as_of: state.as_of,
            }),
            PropertyIndex::Hash(_) => None,
        }
    }
}

impl std::fmt::Debug for IndexEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("IndexEngine")
            .field("indexes", &state.indexes.len())
            .field("as_of", &state.as_of)
            .finish()
    }
}
