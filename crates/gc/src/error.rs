//! Garbage collection error types.

use chunkref_metadata::MetadataError;
use chunkref_storage::StorageError;
use thiserror::Error;

/// Errors raised by a chunk server while flushing or deleting chunks.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to delete content of chunk {chunk}: {source}")]
    Storage {
        chunk: String,
        #[source]
        source: StorageError,
    },

    #[error("reference store error: {0}")]
    Store(#[from] MetadataError),

    #[error("chunk server unavailable: {0}")]
    Unavailable(String),
}

pub type ServerResult<T> = std::result::Result<T, ServerError>;

/// Client-facing garbage collection errors.
///
/// Transaction conflicts never appear here: they are retried inside the store.
/// Interruptions keep their own variants so callers can tell them apart from
/// faults.
#[derive(Debug, Error)]
pub enum GcError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("operation deadline exceeded")]
    DeadlineExceeded,

    #[error("reference store error: {0}")]
    Store(#[source] MetadataError),

    #[error("chunk server error: {0}")]
    Server(#[source] ServerError),
}

impl From<MetadataError> for GcError {
    fn from(err: MetadataError) -> Self {
        match err {
            MetadataError::Cancelled => GcError::Cancelled,
            MetadataError::DeadlineExceeded => GcError::DeadlineExceeded,
            other => GcError::Store(other),
        }
    }
}

impl From<ServerError> for GcError {
    fn from(err: ServerError) -> Self {
        match err {
            ServerError::Store(MetadataError::Cancelled) => GcError::Cancelled,
            ServerError::Store(MetadataError::DeadlineExceeded) => GcError::DeadlineExceeded,
            other => GcError::Server(other),
        }
    }
}

impl GcError {
    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            GcError::InvalidInput(_) => "invalid_input",
            GcError::Cancelled => "cancelled",
            GcError::DeadlineExceeded => "deadline_exceeded",
            GcError::Store(_) => "store",
            GcError::Server(_) => "server",
        }
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, GcError::Cancelled | GcError::DeadlineExceeded)
    }
}

pub type GcResult<T> = std::result::Result<T, GcError>;
