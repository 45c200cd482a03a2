//! Chunk content storage for chunkref.
//!
//! The garbage collector only ever removes content; writers put it. Backends:
//! local filesystem and process-local memory.

pub mod backends;
pub mod error;
pub mod traits;

pub use backends::{filesystem::FilesystemBackend, memory::MemoryBackend};
pub use error::{StorageError, StorageResult};
pub use traits::ObjectStore;

use chunkref_core::config::StorageConfig;
use std::sync::Arc;

/// Create an object store from configuration.
pub async fn from_config(config: &StorageConfig) -> StorageResult<Arc<dyn ObjectStore>> {
    match config {
        StorageConfig::Filesystem { path } => {
            let backend = FilesystemBackend::new(path).await?;
            Ok(Arc::new(backend))
        }
        StorageConfig::Memory => {
            tracing::warn!("using in-memory chunk storage; content will not persist");
            Ok(Arc::new(MemoryBackend::new()))
        }
    }
}
