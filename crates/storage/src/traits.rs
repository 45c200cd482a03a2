//! Storage trait definitions.

use crate::error::StorageResult;
use async_trait::async_trait;
use bytes::Bytes;

/// Object store abstraction for chunk content.
///
/// Keys are relative, `/`-separated paths such as the fan-out key produced by
/// `ChunkHash::to_object_key`.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Check if an object exists.
    async fn exists(&self, key: &str) -> StorageResult<bool>;

    /// Get an object's content.
    async fn get(&self, key: &str) -> StorageResult<Bytes>;

    /// Put an object atomically, replacing any previous content.
    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()>;

    /// Delete an object. Returns `StorageError::NotFound` if it does not exist.
    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// Get the name of this storage backend, for logs.
    fn backend_name(&self) -> &'static str;

    /// Verify storage backend connectivity.
    async fn health_check(&self) -> StorageResult<()> {
        Ok(())
    }
}
