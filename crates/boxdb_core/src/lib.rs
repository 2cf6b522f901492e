//! # boxdb core
//!
//! An embedded, transactional object store.
//!
//! Objects are typed records grouped into entity types. Each type is
//! accessed through a box ([`EntityBox`]) obtained from an open [`Store`];
//! the mapping between a Rust struct and its stored record is an
//! [`EntityCodec`] implementation, usually generated.
//!
//! This crate provides:
//! - A write-ahead log and a versioned segment store (MVCC snapshots)
//! - Serialized write transactions and concurrent read transactions
//! - Boxes with put/get/remove, to-one and to-many relations
//! - A query engine with rebindable parameters, links and aggregates
//! - Secondary indexes, unique constraints and ID sequences
//! - Observers and a change feed fed after every commit
//!
//! ```ignore
//! let store = Store::open(model, "data/notes", Config::default())?;
//! let notes = store.entity_box::<Note>()?;
//! let id = notes.put(&mut Note::new("hello"))?;
//! let found = notes.query().filter(Note::TITLE.eq("hello")).build()?.find()?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod change_feed;
mod collection;
mod config;
mod dir;
mod entity;
mod error;
mod index;
mod manifest;
mod observer;
mod query;
mod schema;
mod segment;
mod store;
mod transaction;
mod types;
mod wal;

#[cfg(test)]
pub(crate) mod fixtures;

pub use change_feed::{ChangeSet, ChangeType, ObjectChange};
pub use collection::{AsyncBox, EntityBox, EntityCodec, BINDING_VERSION};
pub use config::{Config, StoreLocation};
pub use entity::{PutMode, RelationHandle, RelationWriter, ToMany, ToOne};
pub use error::{CoreError, CoreResult, ErrorKind};
pub use observer::{
    Dispatcher, ImmediateDispatcher, Job, Observer, ObserverFlags, SerialDispatcher,
};
pub use query::{
    Condition, OrderFlags, ParameterKey, Property, PropertyQuery, PropertyValue, Query,
    QueryBuilder, ToOneProperty,
};
pub use schema::{
    EntityBuilder, EntitySchema, Model, ModelBuilder, PropertyFlags, PropertySchema,
    RelationSchema,
};
pub use store::Store;
pub use transaction::{RecoveryReport, Transaction, TransactionKind, TransactionState, TxGuard};
pub use types::{EntityTypeId, ObjectId, PropertyId, RelationId, SequenceNumber, TransactionId};

pub use boxdb_codec::{PropertyType, RecordBuilder, RecordReader, Value};
