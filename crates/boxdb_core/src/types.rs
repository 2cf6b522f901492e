//! Core type definitions for boxdb.

use std::fmt;

/// Identifier of a stored object.
///
/// IDs are assigned per entity type, start at 1 and increase monotonically.
/// The value 0 marks an object that has not been persisted yet.
pub type ObjectId = u64;

/// Identifier of an entity type within a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntityTypeId(pub u32);

impl EntityTypeId {
    /// Creates a new entity type ID.
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for EntityTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "type:{}", self.0)
    }
}

/// Identifier of a property within an entity type. Valid IDs start at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PropertyId(pub u16);

impl PropertyId {
    /// Creates a new property ID.
    #[must_use]
    pub const fn new(id: u16) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self.0
    }
}

impl fmt::Display for PropertyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "prop:{}", self.0)
    }
}

/// Identifier of a standalone to-many relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RelationId(pub u32);

impl RelationId {
    /// Creates a new relation ID.
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for RelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rel:{}", self.0)
    }
}

/// Physical table key: either the objects of one entity type or the link
/// rows of one to-many relation.
///
/// Relation tables set the high bit so both kinds share one key space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TableId(u32);

impl TableId {
    const RELATION_BIT: u32 = 0x8000_0000;

    /// Table holding the objects of an entity type.
    #[must_use]
    pub const fn entity(id: EntityTypeId) -> Self {
        Self(id.0 & !Self::RELATION_BIT)
    }

    /// Table holding the link rows of a to-many relation.
    #[must_use]
    pub const fn relation(id: RelationId) -> Self {
        Self(id.0 | Self::RELATION_BIT)
    }

    /// Rebuilds a table ID from its on-disk form.
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the on-disk form.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns true for relation tables.
    #[must_use]
    pub const fn is_relation(self) -> bool {
        self.0 & Self::RELATION_BIT != 0
    }

    /// Returns the entity type if this is an entity table.
    #[must_use]
    pub const fn entity_type(self) -> Option<EntityTypeId> {
        if self.is_relation() {
            None
        } else {
            Some(EntityTypeId(self.0))
        }
    }

    /// Returns the relation if this is a relation table.
    #[must_use]
    pub const fn relation_id(self) -> Option<RelationId> {
        if self.is_relation() {
            Some(RelationId(self.0 & !Self::RELATION_BIT))
        } else {
            None
        }
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.entity_type(), self.relation_id()) {
            (Some(ty), _) => write!(f, "{ty}"),
            (_, Some(rel)) => write!(f, "{rel}"),
            _ => write!(f, "table:{}", self.0),
        }
    }
}

/// Unique identifier for a transaction.
///
/// Transaction IDs are monotonically increasing and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransactionId(pub u64);

impl TransactionId {
    /// Creates a new transaction ID.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn:{}", self.0)
    }
}

/// Sequence number for ordering commits.
///
/// Every committed write transaction gets the next sequence number. Read
/// snapshots are expressed as the sequence they observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SequenceNumber(pub u64);

impl SequenceNumber {
    /// Creates a new sequence number.
    #[must_use]
    pub const fn new(seq: u64) -> Self {
        Self(seq)
    }

    /// Returns the raw sequence value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the next sequence number.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "seq:{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transaction_id_ordering() {
        let t1 = TransactionId::new(1);
        let t2 = TransactionId::new(2);
        assert!(t1 < t2);
    }

    #[test]
    fn sequence_number_next() {
        let s1 = SequenceNumber::new(5);
        let s2 = s1.next();
        assert_eq!(s2.as_u64(), 6);
    }

    #[test]
    fn table_ids_keep_kinds_apart() {
        let entity = TableId::entity(EntityTypeId::new(7));
        let relation = TableId::relation(RelationId::new(7));
        assert_ne!(entity, relation);
        assert!(!entity.is_relation());
        assert!(relation.is_relation());
        assert_eq!(entity.entity_type(), Some(EntityTypeId::new(7)));
        assert_eq!(relation.relation_id(), Some(RelationId::new(7)));
        assert_eq!(TableId::from_raw(relation.as_u32()), relation);
    }

    #[test]
    fn display_forms() {
        assert_eq!(format!("{}", EntityTypeId::new(3)), "type:3");
        assert_eq!(format!("{}", TableId::relation(RelationId::new(2))), "rel:2");
        assert_eq!(format!("{}", PropertyId::new(4)), "prop:4");
    }
}
