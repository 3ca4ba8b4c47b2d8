//! Error types for model construction and decoding

use thiserror::Error;

/// Model validation / decoding error
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    /// Stored string does not name a known variant
    #[error("unknown {kind} value: {value:?}")]
    UnknownVariant {
        /// Enum being decoded
        kind: &'static str,
        /// Offending value
        value: String,
    },

    /// IP range with `from > to`
    #[error("invalid ip range: from is greater than to")]
    InvalidRange,

    /// CIDR string could not be parsed
    #[error("invalid cidr: {0}")]
    InvalidCidr(String),

    /// Stored IP bytes were not 16 bytes long
    #[error("invalid ip bytes: expected 16, got {0}")]
    InvalidIpBytes(usize),
}

/// Result type for model operations
pub type ModelResult<T> = Result<T, ModelError>;
