//! Error types for boxdb core.

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Fieldless classification of [`CoreError`], useful for matching without
/// destructuring variant fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Requested object or row does not exist.
    NotFound,
    /// A unique index would contain a duplicate.
    UniqueViolation,
    /// Some other data constraint failed.
    ConstraintViolated,
    /// A write was requested inside a read transaction.
    CannotWriteWhileReading,
    /// Operation not valid in the current state.
    IllegalState,
    /// Invalid argument supplied by the caller.
    IllegalArgument,
    /// Store size limit reached.
    DbFull,
    /// Too many concurrent readers.
    MaxReadersExceeded,
    /// Writer slot not acquired in time.
    WriterBusy,
    /// Store hit a fatal error and must be closed.
    StoreMustShutdown,
    /// Store files are corrupt.
    FileCorrupt,
    /// Data pages failed their integrity check.
    FilePagesCorrupt,
    /// Unique result requested but several found.
    NonUniqueResult,
    /// Property used with an incompatible type.
    PropertyTypeMismatch,
    /// Schema definition is invalid or incompatible.
    Schema,
    /// Relation points at an object without an ID.
    CannotRelateToUnsavedEntities,
    /// No open store to attach to.
    CannotAttachToStore,
    /// Store already opened elsewhere.
    StoreLocked,
    /// Arithmetic overflow in an aggregate.
    NumericOverflow,
    /// Anything not otherwise classified.
    Unexpected,
}

/// Errors that can occur in boxdb core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] boxdb_storage::StorageError),

    /// Record codec error.
    #[error("codec error: {0}")]
    Codec(#[from] boxdb_codec::CodecError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Object not found.
    #[error("not found: {message}")]
    NotFound {
        /// What was looked up.
        message: String,
    },

    /// Unique index violation.
    #[error("unique constraint violated: {entity}.{property} already contains {value}")]
    UniqueViolation {
        /// Entity type name.
        entity: String,
        /// Property name.
        property: String,
        /// Rendered duplicate value.
        value: String,
    },

    /// Other constraint violation.
    #[error("constraint violated: {message}")]
    ConstraintViolated {
        /// Description of the violation.
        message: String,
    },

    /// Write requested while a read transaction is active on this thread.
    #[error("cannot start a write transaction inside a read transaction")]
    CannotWriteWhileReading,

    /// Operation not permitted in current state.
    #[error("illegal state: {message}")]
    IllegalState {
        /// Description of why the operation is invalid.
        message: String,
    },

    /// Invalid argument.
    #[error("illegal argument: {message}")]
    IllegalArgument {
        /// Description of the argument problem.
        message: String,
    },

    /// Store size limit reached.
    #[error("store full: commit needs {required} bytes, limit is {limit}")]
    DbFull {
        /// Configured limit in bytes.
        limit: u64,
        /// Size the commit would have produced.
        required: u64,
    },

    /// Reader limit reached.
    #[error("maximum of {max} concurrent readers exceeded")]
    MaxReadersExceeded {
        /// Configured maximum.
        max: usize,
    },

    /// Writer slot not acquired within the configured timeout.
    #[error("writer busy: gave up after {waited:?}")]
    WriterBusy {
        /// How long the caller waited.
        waited: Duration,
    },

    /// Fatal engine error; the store must be closed and reopened.
    #[error("store must shut down: {reason}")]
    StoreMustShutdown {
        /// Description of the underlying failure.
        reason: String,
    },

    /// Store files are corrupt (WAL, manifest).
    #[error("file corrupt: {message}")]
    FileCorrupt {
        /// Description of the corruption.
        message: String,
    },

    /// Data pages failed their integrity check.
    #[error("file pages corrupt: {message}")]
    FilePagesCorrupt {
        /// Description of the corruption.
        message: String,
    },

    /// More than one result where exactly one was expected.
    #[error("expected a unique result but found {count}")]
    NonUniqueResult {
        /// Number of results found.
        count: usize,
    },

    /// Property accessed with an incompatible type.
    #[error("property {property} is {actual}, not {expected}")]
    PropertyTypeMismatch {
        /// Property name.
        property: String,
        /// Expected type.
        expected: String,
        /// Declared type.
        actual: String,
    },

    /// Schema problem.
    #[error("schema error: {message}")]
    Schema {
        /// Description of the problem.
        message: String,
    },

    /// Relation targets an unsaved object.
    #[error("cannot relate to unsaved entities: {message}")]
    CannotRelateToUnsavedEntities {
        /// Description of the relation.
        message: String,
    },

    /// No open store at the given location.
    #[error("no open store to attach to at {location}")]
    CannotAttachToStore {
        /// Location that was requested.
        location: String,
    },

    /// Store is already open.
    #[error("store locked: {location} is already open")]
    StoreLocked {
        /// Location that is locked.
        location: String,
    },

    /// Arithmetic overflow.
    #[error("numeric overflow: {message}")]
    NumericOverflow {
        /// Description of the computation.
        message: String,
    },

    /// Unclassified engine error.
    #[error("unexpected error {code}: {message}")]
    Unexpected {
        /// Engine error code.
        code: i32,
        /// Description.
        message: String,
    },
}

impl CoreError {
    /// Creates a not found error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    /// Creates an illegal state error.
    pub fn illegal_state(message: impl Into<String>) -> Self {
        Self::IllegalState {
            message: message.into(),
        }
    }

    /// Creates an illegal argument error.
    pub fn illegal_argument(message: impl Into<String>) -> Self {
        Self::IllegalArgument {
            message: message.into(),
        }
    }

    /// Creates a schema error.
    pub fn schema(message: impl Into<String>) -> Self {
        Self::Schema {
            message: message.into(),
        }
    }

    /// Creates a file corrupt error.
    pub fn file_corrupt(message: impl Into<String>) -> Self {
        Self::FileCorrupt {
            message: message.into(),
        }
    }

    /// Creates a file pages corrupt error.
    pub fn pages_corrupt(message: impl Into<String>) -> Self {
        Self::FilePagesCorrupt {
            message: message.into(),
        }
    }

    /// Creates a store-must-shutdown error.
    pub fn must_shutdown(reason: impl Into<String>) -> Self {
        Self::StoreMustShutdown {
            reason: reason.into(),
        }
    }

    /// Creates a constraint violation error.
    pub fn constraint(message: impl Into<String>) -> Self {
        Self::ConstraintViolated {
            message: message.into(),
        }
    }

    /// Creates an unsaved-relation error.
    pub fn unsaved_relation(message: impl Into<String>) -> Self {
        Self::CannotRelateToUnsavedEntities {
            message: message.into(),
        }
    }

    /// Creates a numeric overflow error.
    pub fn overflow(message: impl Into<String>) -> Self {
        Self::NumericOverflow {
            message: message.into(),
        }
    }

    /// Creates a property type mismatch error.
    pub fn type_mismatch(
        property: impl Into<String>,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        Self::PropertyTypeMismatch {
            property: property.into(),
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Returns the error classification.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::UniqueViolation { .. } => ErrorKind::UniqueViolation,
            Self::ConstraintViolated { .. } => ErrorKind::ConstraintViolated,
            Self::CannotWriteWhileReading => ErrorKind::CannotWriteWhileReading,
            Self::IllegalState { .. } => ErrorKind::IllegalState,
            Self::IllegalArgument { .. } => ErrorKind::IllegalArgument,
            Self::DbFull { .. } => ErrorKind::DbFull,
            Self::MaxReadersExceeded { .. } => ErrorKind::MaxReadersExceeded,
            Self::WriterBusy { .. } => ErrorKind::WriterBusy,
            Self::StoreMustShutdown { .. } => ErrorKind::StoreMustShutdown,
            Self::FileCorrupt { .. } => ErrorKind::FileCorrupt,
            Self::FilePagesCorrupt { .. } => ErrorKind::FilePagesCorrupt,
            Self::NonUniqueResult { .. } => ErrorKind::NonUniqueResult,
            Self::PropertyTypeMismatch { .. } => ErrorKind::PropertyTypeMismatch,
            Self::Schema { .. } => ErrorKind::Schema,
            Self::CannotRelateToUnsavedEntities { .. } => {
                ErrorKind::CannotRelateToUnsavedEntities
            }
            Self::CannotAttachToStore { .. } => ErrorKind::CannotAttachToStore,
            Self::StoreLocked { .. } => ErrorKind::StoreLocked,
            Self::NumericOverflow { .. } => ErrorKind::NumericOverflow,
            Self::Storage(_) | Self::Codec(_) | Self::Io(_) | Self::Unexpected { .. } => {
                ErrorKind::Unexpected
            }
        }
    }

    /// Returns true if the store cannot continue after this error.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::StoreMustShutdown | ErrorKind::FileCorrupt | ErrorKind::FilePagesCorrupt
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_match_variants() {
        assert_eq!(CoreError::not_found("x").kind(), ErrorKind::NotFound);
        assert_eq!(
            CoreError::CannotWriteWhileReading.kind(),
            ErrorKind::CannotWriteWhileReading
        );
        assert_eq!(
            CoreError::from(io::Error::new(io::ErrorKind::Other, "boom")).kind(),
            ErrorKind::Unexpected
        );
    }

    #[test]
    fn fatal_errors() {
        assert!(CoreError::must_shutdown("apply failed").is_fatal());
        assert!(CoreError::pages_corrupt("crc").is_fatal());
        assert!(!CoreError::illegal_argument("bad").is_fatal());
    }

    #[test]
    fn messages_are_readable() {
        let err = CoreError::UniqueViolation {
            entity: "Author".into(),
            property: "email".into(),
            value: "\"a@b\"".into(),
        };
        assert_eq!(
            err.to_string(),
            "unique constraint violated: Author.email already contains \"a@b\""
        );
    }
}
