/*!
 * Error Types
 * Centralized error handling for datastore operations
 */

use std::path::PathBuf;
use thiserror::Error;

/// Common result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Datastore errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("inconsistent datastore at {path}: missing properly-closed marker")]
    Inconsistent { path: PathBuf },

    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("out of memory: requested {requested} bytes, segment size {segment_size} bytes, capacity {capacity} bytes")]
    OutOfMemory {
        requested: usize,
        segment_size: usize,
        capacity: usize,
    },

    #[error("datastore is read-only")]
    ReadOnly,

    #[error("name already in use: {0}")]
    NameInUse(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("user constructor failed at element {index}: {source}")]
    ConstructorFailed {
        index: usize,
        #[source]
        source: Box<StoreError>,
    },

    #[error("corrupted state file: {0}")]
    Corrupted(String),
}

impl StoreError {
    /// Shorthand for an `InvalidArgument` with a formatted message
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        StoreError::InvalidArgument(msg.into())
    }

    /// Shorthand for a `Corrupted` with a formatted message
    pub fn corrupted(msg: impl Into<String>) -> Self {
        StoreError::Corrupted(msg.into())
    }
}
