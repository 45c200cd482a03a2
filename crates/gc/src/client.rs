//! Garbage collection client: the two atomic protocol operations.

use crate::error::{GcError, GcResult};
use crate::server::ChunkServer;
use async_trait::async_trait;
use chunkref_core::{ChunkHash, Reference, ReferenceUpdate};
use chunkref_metadata::{MetadataStore, OpContext, metrics};
use std::future::Future;
use std::sync::Arc;
use tracing::instrument;

/// Reference-counting GC operations.
///
/// Each call runs one serializable transaction (retried invisibly on
/// conflict) and then hands its result to the chunk server before returning.
#[async_trait]
pub trait GcClient: Send + Sync {
    /// Reserve `chunks` for `job`. Chunks found mid-deletion get no reference
    /// and are flushed before the call returns.
    async fn reserve_chunks(
        &self,
        ctx: &OpContext,
        job: &str,
        chunks: &[ChunkHash],
    ) -> GcResult<()>;

    /// Add `add`, then remove `remove` and every reference held by
    /// `release_job`. Chunks left without references are deleted before the
    /// call returns.
    async fn update_references(
        &self,
        ctx: &OpContext,
        add: &[Reference],
        remove: &[Reference],
        release_job: Option<&str>,
    ) -> GcResult<()>;
}

/// [`GcClient`] backed by a reference store and a chunk server.
#[derive(Clone)]
pub struct StoreClient {
    store: Arc<dyn MetadataStore>,
    server: Arc<dyn ChunkServer>,
}

async fn observe<T>(
    operation: &'static str,
    fut: impl Future<Output = GcResult<T>>,
) -> GcResult<T> {
    let timer = metrics::OPERATION_DURATION
        .with_label_values(&[operation])
        .start_timer();
    let result = fut.await;
    timer.observe_duration();
    if let Err(err) = &result {
        metrics::OPERATION_ERRORS
            .with_label_values(&[operation, err.kind()])
            .inc();
        if err.is_interrupted() {
            tracing::debug!(operation, error = %err, "operation interrupted");
        } else {
            tracing::warn!(operation, error = %err, "operation failed");
        }
    }
    result
}

fn check_job(job: &str) -> GcResult<()> {
    if job.is_empty() {
        return Err(GcError::InvalidInput("job id must not be empty".to_string()));
    }
    Ok(())
}

impl StoreClient {
    pub fn new(store: Arc<dyn MetadataStore>, server: Arc<dyn ChunkServer>) -> Self {
        metrics::register_metrics();
        Self { store, server }
    }

    pub fn store(&self) -> &Arc<dyn MetadataStore> {
        &self.store
    }

    /// Apply a reference update and delete the chunks it marked.
    ///
    /// Returns the newly marked chunks. If the server fails, the marks are
    /// already committed; [`StoreClient::recover_pending_deletes`] redrives them.
    #[instrument(
        skip(self, ctx, update),
        fields(
            add = update.add.len(),
            remove = update.remove.len(),
            release_job = update.release_job.as_deref().unwrap_or("")
        )
    )]
    pub async fn apply(
        &self,
        ctx: &OpContext,
        update: &ReferenceUpdate,
    ) -> GcResult<Vec<ChunkHash>> {
        observe("update_references", async {
            if let Some(job) = &update.release_job {
                check_job(job)?;
            }
            let marked = self.store.update_references(ctx, update).await?;
            metrics::CHUNKS_MARKED.inc_by(marked.len() as u64);
            if !marked.is_empty() {
                tracing::debug!(marked = marked.len(), "chunks marked for deletion");
                self.server.delete_chunks(ctx, &marked).await?;
            }
            Ok(marked)
        })
        .await
    }

    /// Hand up to `limit` chunks left marked (after a server fault or crash)
    /// back to the server. Returns how many were handed over.
    #[instrument(skip(self, ctx))]
    pub async fn recover_pending_deletes(&self, ctx: &OpContext, limit: u32) -> GcResult<usize> {
        observe("recover_pending_deletes", async {
            let rows = self.store.deleting_chunks(limit).await?;
            let pending = rows
                .iter()
                .map(|row| row.hash())
                .collect::<Result<Vec<_>, _>>()?;
            if !pending.is_empty() {
                tracing::info!(pending = pending.len(), "redriving pending chunk deletions");
                self.server.delete_chunks(ctx, &pending).await?;
            }
            Ok(pending.len())
        })
        .await
    }
}

#[async_trait]
impl GcClient for StoreClient {
    #[instrument(skip(self, ctx, chunks), fields(chunks = chunks.len()))]
    async fn reserve_chunks(
        &self,
        ctx: &OpContext,
        job: &str,
        chunks: &[ChunkHash],
    ) -> GcResult<()> {
        observe("reserve_chunks", async {
            check_job(job)?;
            if chunks.is_empty() {
                return Ok(());
            }
            let flush = self.store.reserve_chunks(ctx, job, chunks).await?;
            metrics::RESERVATIONS.inc();
            if !flush.is_empty() {
                metrics::CHUNKS_FLUSHED.inc_by(flush.len() as u64);
                tracing::debug!(flush = flush.len(), "reserved chunks pending deletion, flushing");
                self.server.flush_deletes(ctx, &flush).await?;
            }
            Ok(())
        })
        .await
    }

    async fn update_references(
        &self,
        ctx: &OpContext,
        add: &[Reference],
        remove: &[Reference],
        release_job: Option<&str>,
    ) -> GcResult<()> {
        let update = ReferenceUpdate {
            add: add.to_vec(),
            remove: remove.to_vec(),
            release_job: release_job.map(str::to_string),
        };
        self.apply(ctx, &update).await.map(|_| ())
    }
}
