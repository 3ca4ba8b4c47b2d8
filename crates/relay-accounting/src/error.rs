//! Accounting error types

use relay_store::StoreError;
use std::sync::Arc;
use thiserror::Error;

/// Failure to prepare or write one partition's batch
#[derive(Error, Debug)]
pub enum AccountingError {
    /// Write failed
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Ensure step failed; shared by every caller that joined it
    #[error("partition ensure failed: {0}")]
    Ensure(Arc<StoreError>),
}

impl From<Arc<StoreError>> for AccountingError {
    fn from(err: Arc<StoreError>) -> Self {
        Self::Ensure(err)
    }
}

/// Result type for accounting operations
pub type AccountingResult<T> = Result<T, AccountingError>;
