//! Chunk server: the collaborator that physically removes chunks.

use crate::error::{ServerError, ServerResult};
use async_trait::async_trait;
use chunkref_core::ChunkHash;
use chunkref_metadata::{
    BoxError, ContentRemover, MetadataError, MetadataStore, OpContext, metrics,
};
use chunkref_storage::{ObjectStore, StorageError};
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Resolves and performs physical deletion of chunks marked for deletion.
///
/// Both operations are idempotent and accept empty sets.
#[async_trait]
pub trait ChunkServer: Send + Sync {
    /// Resolve any in-flight deletion of `chunks` before returning.
    async fn flush_deletes(&self, ctx: &OpContext, chunks: &[ChunkHash]) -> ServerResult<()>;

    /// Physically remove the content and rows of `chunks`.
    async fn delete_chunks(&self, ctx: &OpContext, chunks: &[ChunkHash]) -> ServerResult<()>;
}

/// [`ChunkServer`] over a reference store and an object store.
///
/// Deletions of the same chunk are serialized by an in-process lock so a
/// flush waits for a delete already in progress. Whether a chunk may go is
/// decided by the store's purge transaction, which also holds the row while
/// the content is removed, so servers in other processes cannot race it.
/// Chunks released by a purged chunk's `chunk` references are deleted in the
/// same call.
pub struct StorageServer {
    metadata: Arc<dyn MetadataStore>,
    storage: Arc<dyn ObjectStore>,
    locks: DashMap<ChunkHash, Arc<Mutex<()>>>,
}

impl StorageServer {
    pub fn new(metadata: Arc<dyn MetadataStore>, storage: Arc<dyn ObjectStore>) -> Self {
        Self {
            metadata,
            storage,
            locks: DashMap::new(),
        }
    }

    fn lock_for(&self, chunk: &ChunkHash) -> Arc<Mutex<()>> {
        self.locks.entry(chunk.clone()).or_default().clone()
    }

    fn release_lock(&self, chunk: &ChunkHash) {
        self.locks
            .remove_if(chunk, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Remove one chunk if it is still marked. Returns chunks newly marked by
    /// the cascade.
    async fn remove_chunk(
        &self,
        ctx: &OpContext,
        chunk: &ChunkHash,
    ) -> ServerResult<Vec<ChunkHash>> {
        let lock = self.lock_for(chunk);
        let result = async {
            let _guard = ctx.run(lock.lock()).await?;
            self.remove_locked(ctx, chunk).await
        }
        .await;
        drop(lock);
        self.release_lock(chunk);
        result
    }

    async fn remove_locked(
        &self,
        ctx: &OpContext,
        chunk: &ChunkHash,
    ) -> ServerResult<Vec<ChunkHash>> {
        let content = ObjectContent(self.storage.as_ref());
        match self.metadata.purge_chunk(ctx, chunk, &content).await {
            Ok(Some(cascaded)) => {
                metrics::CHUNKS_DELETED.inc();
                tracing::debug!(
                    chunk = %chunk,
                    cascaded = cascaded.len(),
                    "deleted chunk content and metadata"
                );
                Ok(cascaded)
            }
            Ok(None) => {
                // Already removed, never marked, or referenced again.
                tracing::trace!(chunk = %chunk, "chunk not deletable, skipping");
                Ok(Vec::new())
            }
            Err(MetadataError::Content { chunk, source }) => {
                tracing::warn!(chunk = %chunk, error = %source, "failed to delete chunk content");
                match source.downcast::<StorageError>() {
                    Ok(source) => Err(ServerError::Storage {
                        chunk,
                        source: *source,
                    }),
                    Err(other) => Err(ServerError::Unavailable(other.to_string())),
                }
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Remove every chunk in the worklist, then whatever the removals cascade to.
    async fn drain(
        &self,
        ctx: &OpContext,
        chunks: &[ChunkHash],
        operation: &'static str,
    ) -> ServerResult<()> {
        let mut worklist: Vec<ChunkHash> = chunks
            .iter()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if worklist.is_empty() {
            return Ok(());
        }

        let requested = worklist.len();
        let mut processed = 0usize;
        while let Some(chunk) = worklist.pop() {
            let cascaded = self.remove_chunk(ctx, &chunk).await?;
            processed += 1;
            worklist.extend(cascaded);
        }

        tracing::info!(
            operation,
            requested,
            processed,
            backend = self.storage.backend_name(),
            "chunk deletions resolved"
        );
        Ok(())
    }
}

/// Object store content of a chunk, removed from inside the purge transaction.
struct ObjectContent<'a>(&'a dyn ObjectStore);

#[async_trait]
impl ContentRemover for ObjectContent<'_> {
    async fn remove_content(&self, chunk: &ChunkHash) -> Result<(), BoxError> {
        let key = chunk.to_object_key();
        match self.0.delete(&key).await {
            Ok(()) => Ok(()),
            Err(StorageError::NotFound(_)) => {
                tracing::debug!(chunk = %chunk, key = %key, "chunk content already missing");
                Ok(())
            }
            Err(err) => Err(Box::new(err)),
        }
    }
}

#[async_trait]
impl ChunkServer for StorageServer {
    async fn flush_deletes(&self, ctx: &OpContext, chunks: &[ChunkHash]) -> ServerResult<()> {
        self.drain(ctx, chunks, "flush_deletes").await
    }

    async fn delete_chunks(&self, ctx: &OpContext, chunks: &[ChunkHash]) -> ServerResult<()> {
        self.drain(ctx, chunks, "delete_chunks").await
    }
}
