//! Storage error types

use relay_common::ModelError;
use thiserror::Error;

/// Storage backend error
#[derive(Error, Debug)]
pub enum StoreError {
    /// Driver-level failure
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Backend unreachable or refusing work
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// Stored row could not be decoded
    #[error("corrupt row: {0}")]
    Corrupt(String),

    /// Stored value violates a model invariant
    #[error("invalid stored value: {0}")]
    Model(#[from] ModelError),
}

/// Result type for storage operations
pub type StoreResult<T> = Result<T, StoreError>;
