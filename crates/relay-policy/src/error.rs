//! Policy error types

use relay_store::StoreError;
use thiserror::Error;

/// Decision failure. Everything else degrades to a routable decision.
#[derive(Error, Debug)]
pub enum PolicyError {
    /// The candidate repository could not be queried
    #[error("candidate lookup failed: {0}")]
    Lookup(#[from] StoreError),
}

/// Result type for policy operations
pub type PolicyResult<T> = Result<T, PolicyError>;
