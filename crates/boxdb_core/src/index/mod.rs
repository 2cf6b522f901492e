//! Secondary indexes.
//!
//! Indexes are internal access paths. They are declared through property
//! flags in the model, maintained by the commit path, and rebuilt from the
//! segment file on open. Queries pick them up automatically.
//!
//! - [`HashIndex`]: equality only, for `INDEX_HASH` properties
//! - [`BTreeIndex`]: ordered, for `INDEXED`/`UNIQUE` properties and
//!   to-one relations

mod btree;
mod engine;
mod hash;
mod traits;

pub use btree::BTreeIndex;
pub use engine::{IndexChange, IndexEngine, IndexHits};
pub use hash::HashIndex;
pub use traits::{Index, IndexKey, IndexSpec, IndexValue};
