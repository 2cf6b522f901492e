//! Error types for the codec crate.

use thiserror::Error;

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors raised while building a record.
///
/// Reading never fails: malformed input reads as absent data.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// A variable-length value was prepared after the slot table was started.
    #[error("cannot prepare variable-length data after collecting slots")]
    TableInProgress,

    /// Property id 0 is reserved.
    #[error("property id 0 is not a valid slot")]
    InvalidSlot,

    /// A value does not fit the 32-bit offsets of the record format.
    #[error("record too large: {len} bytes")]
    RecordTooLarge {
        /// The offending length in bytes.
        len: usize,
    },

    /// A dynamic value did not match the declared property type.
    #[error("value of kind {actual} cannot be stored as {expected}")]
    TypeMismatch {
        /// The property type the slot declares.
        expected: &'static str,
        /// The kind of value that was supplied.
        actual: &'static str,
    },
}
