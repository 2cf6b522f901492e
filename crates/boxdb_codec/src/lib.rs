//! # boxdb codec
//!
//! The flat, offset-addressed record format used for every stored object.
//!
//! A record starts with a slot table holding one offset per property id,
//! even for absent properties. Fixed-width scalars live inline at their
//! offset; strings and byte vectors are written to a side buffer first and
//! referenced by offset. See [`RecordBuilder`] for the layout and the
//! two-phase build protocol, and [`RecordReader`] for the lenient read
//! rules.
//!
//! ```rust
//! use boxdb_codec::{PropertyType, RecordBuilder, RecordReader, Value};
//!
//! let bytes = RecordBuilder::from_values(&[
//!     (1, PropertyType::Long, Value::Int(1)),
//!     (2, PropertyType::String, Value::Text("a".into())),
//! ])
//! .unwrap();
//! let reader = RecordReader::new(&bytes);
//! assert_eq!(reader.read_value(2, PropertyType::String), Value::Text("a".into()));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod builder;
mod error;
mod property;
mod reader;
mod value;

pub use builder::{DataOffset, RecordBuilder, FORMAT_VERSION};
pub use error::{CodecError, CodecResult};
pub use property::PropertyType;
pub use reader::RecordReader;
pub use value::Value;
