//! Metadata store error types.

use thiserror::Error;

/// Reference store operation errors.
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid stored value: {0}")]
    Decode(#[from] chunkref_core::Error),

    #[error("operation cancelled")]
    Cancelled,

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("{operation}: gave up after {attempts} conflicting attempts: {source}")]
    RetriesExhausted {
        operation: &'static str,
        attempts: u32,
        #[source]
        source: sqlx::Error,
    },

    #[error("failed to remove content of chunk {chunk}: {source}")]
    Content {
        chunk: String,
        #[source]
        source: crate::repos::BoxError,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl MetadataError {
    /// True for caller-initiated interruption (cancellation or deadline).
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Cancelled | Self::DeadlineExceeded)
    }
}

/// Result type for metadata operations.
pub type MetadataResult<T> = std::result::Result<T, MetadataError>;
