//! # boxdb testkit
//!
//! Test utilities for boxdb.
//!
//! This crate provides:
//! - Sample entity bindings (`Note`, `Author`, `Tag`) and their model
//! - Temporary store helpers for in-memory and on-disk stores
//! - Property-based test generators using proptest
//! - A harness that mirrors writes and checks the store against them
//! - Crash images for recovery tests
//!
//! ## Usage
//!
//! ```rust,ignore
//! use boxdb_testkit::prelude::*;
//!
//! #[test]
//! fn test_with_store() {
//!     with_temp_store(|store| {
//!         let notes = store.entity_box::<Note>().unwrap();
//!         notes.put(&mut Note::new("hello")).unwrap();
//!     });
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod crash;
pub mod fixtures;
pub mod generators;
pub mod harness;

#[cfg(test)]
mod properties;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::crash::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::harness::*;
}

pub use fixtures::*;
pub use generators::*;
pub use harness::*;
