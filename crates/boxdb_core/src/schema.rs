//! Entity model: entity types, their properties and standalone relations.
//!
//! A [`Model`] is built once through [`ModelBuilder`] and handed to the
//! store at open time. IDs are the stable identity of every element;
//! names are informational and may change between versions of a model.

use std::collections::{BTreeMap, HashSet};
use std::ops::BitOr;
use std::sync::Arc;

use boxdb_codec::PropertyType;

use crate::error::{CoreError, CoreResult};
use crate::types::{EntityTypeId, PropertyId, RelationId};

/// Flags attached to a property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PropertyFlags(u16);

impl PropertyFlags {
    /// No flags.
    pub const NONE: Self = Self(0);
    /// The object ID property.
    pub const ID: Self = Self(0x01);
    /// Maintain an ordered secondary index.
    pub const INDEXED: Self = Self(0x02);
    /// Values must be unique across all objects of the type. Implies an index.
    pub const UNIQUE: Self = Self(0x04);
    /// Integer values are compared as unsigned.
    pub const UNSIGNED: Self = Self(0x08);
    /// Use a hash index instead of an ordered one.
    pub const INDEX_HASH: Self = Self(0x10);

    /// Returns the raw bits.
    #[must_use]
    pub const fn bits(self) -> u16 {
        self.0
    }

    /// Rebuilds flags from raw bits.
    #[must_use]
    pub const fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    /// Returns true if every flag in `other` is set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Combines two flag sets.
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl BitOr for PropertyFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

/// Declaration of one property.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertySchema {
    /// Stable property ID, at least 1.
    pub id: PropertyId,
    /// Property name.
    pub name: String,
    /// Stored type.
    pub ty: PropertyType,
    /// Flags.
    pub flags: PropertyFlags,
    /// Target entity type of a to-one relation property.
    pub target: Option<EntityTypeId>,
}

impl PropertySchema {
    /// Returns true if a secondary index is maintained for this property.
    /// To-one relations are always indexed to serve backlink lookups.
    #[must_use]
    pub fn is_indexed(&self) -> bool {
        self.ty == PropertyType::Relation
            || self.flags.contains(PropertyFlags::INDEXED)
            || self.flags.contains(PropertyFlags::UNIQUE)
            || self.flags.contains(PropertyFlags::INDEX_HASH)
    }

    /// Returns true if values must be unique.
    #[must_use]
    pub fn is_unique(&self) -> bool {
        self.flags.contains(PropertyFlags::UNIQUE)
    }

    /// Returns true if integers compare as unsigned.
    #[must_use]
    pub fn is_unsigned(&self) -> bool {
        self.flags.contains(PropertyFlags::UNSIGNED)
    }

    /// Returns true if this is the ID property.
    #[must_use]
    pub fn is_id(&self) -> bool {
        self.flags.contains(PropertyFlags::ID)
    }
}

/// Declaration of one entity type.
#[derive(Debug, Clone, PartialEq)]
pub struct EntitySchema {
    /// Stable type ID.
    pub id: EntityTypeId,
    /// Type name.
    pub name: String,
    properties: Vec<PropertySchema>,
    id_property: PropertyId,
}

impl EntitySchema {
    /// All properties ordered by ID.
    #[must_use]
    pub fn properties(&self) -> &[PropertySchema] {
        &self.properties
    }

    /// Looks up a property by ID.
    #[must_use]
    pub fn property(&self, id: PropertyId) -> Option<&PropertySchema> {
        self.properties
            .binary_search_by_key(&id, |p| p.id)
            .ok()
            .map(|idx| &self.properties[idx])
    }

    /// Looks up a property by name.
    #[must_use]
    pub fn property_by_name(&self, name: &str) -> Option<&PropertySchema> {
        self.properties.iter().find(|p| p.name == name)
    }

    /// Looks up a property, failing with a schema error if it is unknown.
    pub fn require_property(&self, id: PropertyId) -> CoreResult<&PropertySchema> {
        self.property(id).ok_or_else(|| {
            CoreError::schema(format!("entity {} has no property {id}", self.name))
        })
    }

    /// ID of the object ID property.
    #[must_use]
    pub fn id_property(&self) -> PropertyId {
        self.id_property
    }

    /// Properties with a secondary index.
    pub fn indexed_properties(&self) -> impl Iterator<Item = &PropertySchema> {
        self.properties.iter().filter(|p| p.is_indexed())
    }
}

/// Declaration of a standalone to-many relation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationSchema {
    /// Stable relation ID.
    pub id: RelationId,
    /// Relation name.
    pub name: String,
    /// Owning entity type.
    pub source: EntityTypeId,
    /// Target entity type.
    pub target: EntityTypeId,
}

/// A validated entity model.
#[derive(Debug, Clone, Default)]
pub struct Model {
    entities: BTreeMap<EntityTypeId, Arc<EntitySchema>>,
    relations: BTreeMap<RelationId, RelationSchema>,
}

impl Model {
    /// Starts building a model.
    #[must_use]
    pub fn builder() -> ModelBuilder {
        ModelBuilder::new()
    }

    /// Looks up an entity type.
    pub fn entity(&self, id: EntityTypeId) -> CoreResult<&Arc<EntitySchema>> {
        self.entities
            .get(&id)
            .ok_or_else(|| CoreError::schema(format!("unknown entity type {id}")))
    }

    /// All entity types ordered by ID.
    pub fn entities(&self) -> impl Iterator<Item = &Arc<EntitySchema>> {
        self.entities.values()
    }

    /// Looks up a relation.
    pub fn relation(&self, id: RelationId) -> CoreResult<&RelationSchema> {
        self.relations
            .get(&id)
            .ok_or_else(|| CoreError::schema(format!("unknown relation {id}")))
    }

    /// All relations ordered by ID.
    pub fn relations(&self) -> impl Iterator<Item = &RelationSchema> {
        self.relations.values()
    }

    /// Relations touching the given entity type as source or target.
    pub fn relations_involving(&self, ty: EntityTypeId) -> impl Iterator<Item = &RelationSchema> {
        self.relations
            .values()
            .filter(move |r| r.source == ty || r.target == ty)
    }
}

/// Builder for one entity type.
#[derive(Debug, Clone)]
pub struct EntityBuilder {
    id: EntityTypeId,
    name: String,
    properties: Vec<PropertySchema>,
}

impl EntityBuilder {
    /// Starts an entity type declaration.
    #[must_use]
    pub fn new(id: u32, name: impl Into<String>) -> Self {
        Self {
            id: EntityTypeId::new(id),
            name: name.into(),
            properties: Vec::new(),
        }
    }

    /// Declares the object ID property.
    #[must_use]
    pub fn id_property(self, id: u16, name: impl Into<String>) -> Self {
        self.push(id, name, PropertyType::Long, PropertyFlags::ID, None)
    }

    /// Declares a plain property.
    #[must_use]
    pub fn property(self, id: u16, name: impl Into<String>, ty: PropertyType) -> Self {
        self.push(id, name, ty, PropertyFlags::NONE, None)
    }

    /// Declares a property with flags.
    #[must_use]
    pub fn property_with_flags(
        self,
        id: u16,
        name: impl Into<String>,
        ty: PropertyType,
        flags: PropertyFlags,
    ) -> Self {
        self.push(id, name, ty, flags, None)
    }

    /// Declares a to-one relation property pointing at `target`.
    #[must_use]
    pub fn to_one(self, id: u16, name: impl Into<String>, target: u32) -> Self {
        self.push(
            id,
            name,
            PropertyType::Relation,
            PropertyFlags::INDEXED,
            Some(EntityTypeId::new(target)),
        )
    }

    fn push(
        mut self,
        id: u16,
        name: impl Into<String>,
        ty: PropertyType,
        flags: PropertyFlags,
        target: Option<EntityTypeId>,
    ) -> Self {
        self.properties.push(PropertySchema {
            id: PropertyId::new(id),
            name: name.into(),
            ty,
            flags,
            target,
        });
        self
    }

    fn build(mut self) -> CoreResult<EntitySchema> {
        let err = |msg: String| CoreError::schema(format!("entity {}: {msg}", self.name));
        if self.id.as_u32() == 0 || self.id.as_u32() & 0x8000_0000 != 0 {
            return Err(err(format!("invalid type id {}", self.id.as_u32())));
        }
        self.properties.sort_by_key(|p| p.id);

        let mut names = HashSet::new();
        let mut id_property = None;
        for (idx, prop) in self.properties.iter().enumerate() {
            if prop.id.as_u16() == 0 {
                return Err(err(format!("property {} has id 0", prop.name)));
            }
            if idx > 0 && self.properties[idx - 1].id == prop.id {
                return Err(err(format!("duplicate property id {}", prop.id)));
            }
            if !names.insert(prop.name.as_str()) {
                return Err(err(format!("duplicate property name {}", prop.name)));
            }
            if prop.is_id() {
                if id_property.is_some() {
                    return Err(err("more than one id property".into()));
                }
                if prop.ty != PropertyType::Long {
                    return Err(err(format!("id property {} must be long", prop.name)));
                }
                id_property = Some(prop.id);
            }
            if prop.is_indexed() && prop.ty.is_float() {
                return Err(err(format!(
                    "floating point property {} cannot be indexed",
                    prop.name
                )));
            }
            if (prop.ty == PropertyType::Relation) != prop.target.is_some() {
                return Err(err(format!(
                    "property {} must declare a relation target",
                    prop.name
                )));
            }
        }

        let id_property = id_property.ok_or_else(|| err("missing id property".into()))?;
        Ok(EntitySchema {
            id: self.id,
            name: self.name,
            properties: self.properties,
            id_property,
        })
    }
}

/// Builder for a [`Model`].
#[derive(Debug, Clone, Default)]
pub struct ModelBuilder {
    entities: Vec<EntityBuilder>,
    relations: Vec<RelationSchema>,
}

impl ModelBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an entity type.
    #[must_use]
    pub fn entity(mut self, entity: EntityBuilder) -> Self {
        self.entities.push(entity);
        self
    }

    /// Adds a standalone to-many relation from `source` to `target`.
    #[must_use]
    pub fn relation(mut self, id: u32, name: impl Into<String>, source: u32, target: u32) -> Self {
        self.relations.push(RelationSchema {
            id: RelationId::new(id),
            name: name.into(),
            source: EntityTypeId::new(source),
            target: EntityTypeId::new(target),
        });
        self
    }

    /// Validates the declarations and produces the model.
    pub fn build(self) -> CoreResult<Model> {
        let mut model = Model::default();
        let mut names = HashSet::new();
        for entity in self.entities {
            let schema = entity.build()?;
            if !names.insert(schema.name.clone()) {
                return Err(CoreError::schema(format!(
                    "duplicate entity name {}",
                    schema.name
                )));
            }
            if model.entities.contains_key(&schema.id) {
                return Err(CoreError::schema(format!(
                    "duplicate entity type id {}",
                    schema.id
                )));
            }
            model.entities.insert(schema.id, Arc::new(schema));
        }

        for schema in model.entities.values() {
            for prop in schema.properties() {
                if let Some(target) = prop.target {
                    if !model.entities.contains_key(&target) {
                        return Err(CoreError::schema(format!(
                            "{}.{} targets unknown entity type {target}",
                            schema.name, prop.name
                        )));
                    }
                }
            }
        }

        for relation in self.relations {
            if relation.id.as_u32() == 0 || relation.id.as_u32() & 0x8000_0000 != 0 {
                return Err(CoreError::schema(format!(
                    "relation {} has invalid id",
                    relation.name
                )));
            }
            for end in [relation.source, relation.target] {
                if !model.entities.contains_key(&end) {
                    return Err(CoreError::schema(format!(
                        "relation {} references unknown entity type {end}",
                        relation.name
                    )));
                }
            }
            if model.relations.contains_key(&relation.id) {
                return Err(CoreError::schema(format!(
                    "duplicate relation id {}",
                    relation.id
                )));
            }
            model.relations.insert(relation.id, relation);
        }

        Ok(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn note_model() -> ModelBuilder {
        ModelBuilder::new()
            .entity(
                EntityBuilder::new(1, "Note")
                    .id_property(1, "id")
                    .property_with_flags(2, "title", PropertyType::String, PropertyFlags::INDEXED)
                    .property(3, "score", PropertyType::Double)
                    .to_one(4, "author", 2),
            )
            .entity(
                EntityBuilder::new(2, "Author")
                    .id_property(1, "id")
                    .property_with_flags(2, "email", PropertyType::String, PropertyFlags::UNIQUE),
            )
            .relation(1, "tags", 1, 2)
    }

    #[test]
    fn builds_valid_model() {
        let model = note_model().build().unwrap();
        let note = model.entity(EntityTypeId::new(1)).unwrap();
        assert_eq!(note.id_property(), PropertyId::new(1));
        assert_eq!(note.property_by_name("score").unwrap().id, PropertyId::new(3));
        let indexed: Vec<_> = note.indexed_properties().map(|p| p.name.as_str()).collect();
        assert_eq!(indexed, vec!["title", "author"]);
        assert_eq!(model.relations_involving(EntityTypeId::new(2)).count(), 1);
    }

    #[test]
    fn rejects_missing_id_property() {
        let err = ModelBuilder::new()
            .entity(EntityBuilder::new(1, "Bare").property(2, "x", PropertyType::Int))
            .build()
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Schema);
    }

    #[test]
    fn rejects_duplicate_property_ids() {
        let err = ModelBuilder::new()
            .entity(
                EntityBuilder::new(1, "Dup")
                    .id_property(1, "id")
                    .property(2, "a", PropertyType::Int)
                    .property(2, "b", PropertyType::Int),
            )
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("duplicate property id"));
    }

    #[test]
    fn rejects_unknown_relation_target() {
        let err = ModelBuilder::new()
            .entity(EntityBuilder::new(1, "A").id_property(1, "id").to_one(2, "b", 9))
            .build()
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Schema);

        let err = ModelBuilder::new()
            .entity(EntityBuilder::new(1, "A").id_property(1, "id"))
            .relation(1, "r", 1, 5)
            .build()
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Schema);
    }

    #[test]
    fn rejects_indexed_floats() {
        let err = ModelBuilder::new()
            .entity(
                EntityBuilder::new(1, "F")
                    .id_property(1, "id")
                    .property_with_flags(2, "v", PropertyType::Double, PropertyFlags::INDEXED),
            )
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("cannot be indexed"));
    }

    #[test]
    fn flags_combine() {
        let flags = PropertyFlags::UNIQUE | PropertyFlags::INDEX_HASH;
        assert!(flags.contains(PropertyFlags::UNIQUE));
        assert!(!flags.contains(PropertyFlags::ID));
        assert_eq!(PropertyFlags::from_bits(flags.bits()), flags);
    }
}
