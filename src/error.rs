//! Error types for the index compactor.

use std::io;

/// The result type used throughout the compactor.
pub type Result<T> = std::result::Result<T, Error>;

/// The error type for compaction operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// The embedded key-value engine reported an error.
    #[error("Storage error: {0}")]
    Storage(#[from] redb::Error),

    /// A requested index set or file was not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// An invalid argument was provided.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The compacted index is in an invalid state (e.g. already closed).
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A tenant-scoped merge discovered data belonging to another tenant.
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Configuration could not be parsed.
    #[error("Config error: {0}")]
    Config(#[from] serde_json::Error),

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Creates a new not found error.
    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    /// Creates a new invalid argument error.
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    /// Creates a new invalid state error.
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Error::InvalidState(msg.into())
    }

    /// Creates a new invariant violation error.
    pub fn invariant_violation(msg: impl Into<String>) -> Self {
        Error::InvariantViolation(msg.into())
    }

    /// Creates a new internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }
}

// redb splits its errors per operation family; fold them all into `Storage`.
macro_rules! impl_from_redb {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for Error {
                fn from(err: $ty) -> Self {
                    Error::Storage(redb::Error::from(err))
                }
            }
        )*
    };
}

impl_from_redb!(
    redb::DatabaseError,
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError,
);
