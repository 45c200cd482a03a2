//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid chunk hash: {0}")]
    InvalidHash(String),

    #[error("invalid source kind: {0}")]
    InvalidSourceKind(String),

    #[error("invalid reference: {0}")]
    InvalidReference(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
