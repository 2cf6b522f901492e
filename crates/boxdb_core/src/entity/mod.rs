//! Entity-level building blocks shared by boxes and queries.

mod relation;

pub use relation::{RelationHandle, RelationWriter, ToMany, ToOne};

pub(crate) use relation::{add_links, all_links, detach, relation_schema, remove_links, sources, targets};

/// How `put` treats an existing or missing object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PutMode {
    /// Insert new objects and replace existing ones.
    #[default]
    Put,
    /// Only insert; an existing ID fails with `UniqueViolation`.
    Insert,
    /// Only replace; a missing ID fails with `NotFound`.
    Update,
}
