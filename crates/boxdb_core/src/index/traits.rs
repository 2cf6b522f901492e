//! Index traits and key types.

use std::fmt;
use std::hash::Hash;
use std::marker::PhantomData;

use boxdb_codec::Value;

use crate::error::CoreResult;
use crate::types::{EntityTypeId, ObjectId, PropertyId};

/// A key that can be indexed.
pub trait IndexKey: Clone + Eq + Hash + Ord + fmt::Debug + Send + Sync + 'static {}

impl IndexKey for i64 {}
impl IndexKey for String {}
impl IndexKey for Vec<u8> {}
impl IndexKey for IndexValue {}

/// The indexable form of a property value.
///
/// Floats are never indexed; nulls are simply absent from the index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IndexValue {
    /// Integer-like value, booleans included.
    Int(i64),
    /// Text value, compared case-sensitively.
    Text(String),
    /// Byte vector.
    Bytes(Vec<u8>),
}

impl IndexValue {
    /// Converts a property value; returns `None` for nulls and floats.
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Bool(b) => Some(Self::Int(i64::from(*b))),
            Value::Int(v) => Some(Self::Int(*v)),
            Value::Text(s) => Some(Self::Text(s.clone())),
            Value::Bytes(b) => Some(Self::Bytes(b.clone())),
            Value::Null | Value::Float(_) => None,
        }
    }
}

impl fmt::Display for IndexValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Text(s) => write!(f, "{s:?}"),
            Self::Bytes(b) => write!(f, "{} bytes", b.len()),
        }
    }
}

/// Specification for an index on one property.
#[derive(Debug, Clone)]
pub struct IndexSpec<K: IndexKey> {
    /// Entity type this index belongs to.
    pub entity: EntityTypeId,
    /// Indexed property.
    pub property: PropertyId,
    /// Human-readable name, `Entity.property`.
    pub name: String,
    /// Whether the index enforces uniqueness.
    pub unique: bool,
    _marker: PhantomData<K>,
}

impl<K: IndexKey> IndexSpec<K> {
    /// Creates a new index specification.
    pub fn new(entity: EntityTypeId, property: PropertyId, name: impl Into<String>) -> Self {
        Self {
            entity,
            property,
            name: name.into(),
            unique: false,
            _marker: PhantomData,
        }
    }

    /// Makes this a unique index.
    #[must_use]
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

/// Core index trait.
pub trait Index<K: IndexKey>: Send + Sync {
    /// Returns the index specification.
    fn spec(&self) -> &IndexSpec<K>;

    /// Inserts a key-object mapping. Unique indexes reject a key that
    /// already maps to a different object.
    fn insert(&mut self, key: K, id: ObjectId) -> CoreResult<()>;

    /// Removes a key-object mapping.
    fn remove(&mut self, key: &K, id: ObjectId) -> bool;

    /// Looks up objects by exact key, ascending by ID.
    fn lookup(&self, key: &K) -> Vec<ObjectId>;

    /// Checks if the index contains a key.
    fn contains(&self, key: &K) -> bool;

    /// Returns the number of entries in the index.
    fn len(&self) -> usize;

    /// Returns true if the index is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clears the index.
    fn clear(&mut self);
}

/// Builds the error for a key that is already taken in a unique index.
pub(crate) fn duplicate_key<K: IndexKey>(spec: &IndexSpec<K>, key: &K) -> crate::error::CoreError {
    let (entity, property) = spec
        .name
        .split_once('.')
        .unwrap_or((spec.name.as_str(), ""));
    crate::error::CoreError::UniqueViolation {
        entity: entity.to_string(),
        property: property.to_string(),
        value: format!("{key:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_convert() {
        assert_eq!(IndexValue::from_value(&Value::Bool(true)), Some(IndexValue::Int(1)));
        assert_eq!(
            IndexValue::from_value(&Value::Text("a".into())),
            Some(IndexValue::Text("a".into()))
        );
        assert_eq!(IndexValue::from_value(&Value::Float(1.5)), None);
        assert_eq!(IndexValue::from_value(&Value::Null), None);
    }

    #[test]
    fn index_spec_builder() {
        let spec: IndexSpec<String> =
            IndexSpec::new(EntityTypeId::new(1), PropertyId::new(2), "Author.email").unique();
        assert_eq!(spec.entity, EntityTypeId::new(1));
        assert_eq!(spec.name, "Author.email");
        assert!(spec.unique);
    }

    #[test]
    fn duplicate_key_names_the_property() {
        let spec: IndexSpec<i64> =
            IndexSpec::new(EntityTypeId::new(1), PropertyId::new(2), "Author.age").unique();
        match duplicate_key(&spec, &7) {
            crate::error::CoreError::UniqueViolation {
                entity, property, ..
            } => {
                assert_eq!(entity, "Author");
                assert_eq!(property, "age");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
