//! Reference repository: the reservation and reference-update protocols.

use crate::context::OpContext;
use crate::error::{MetadataError, MetadataResult};
use crate::models::ChunkRow;
use async_trait::async_trait;
use chunkref_core::{ChunkHash, Reference, ReferenceUpdate, SourceKind};
use std::collections::BTreeSet;

/// Boxed error returned by a [`ContentRemover`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Removes a chunk's stored content on behalf of [`RefRepo::purge_chunk`].
///
/// Content that is already gone must count as removed.
#[async_trait]
pub trait ContentRemover: Send + Sync {
    async fn remove_content(&self, chunk: &ChunkHash) -> Result<(), BoxError>;
}

/// Repository for chunk reference operations.
///
/// The mutating operations each run as exactly one serializable
/// transaction, restarted transparently on conflict.
#[async_trait]
pub trait RefRepo: Send + Sync {
    /// Reserve `chunks` for `job`.
    ///
    /// Creates missing chunk rows and adds a `job` reference to every chunk not
    /// marked for deletion. Returns the chunks that are marked, which received
    /// no reference and must be flushed before they can be used.
    async fn reserve_chunks(
        &self,
        ctx: &OpContext,
        job: &str,
        chunks: &[ChunkHash],
    ) -> MetadataResult<Vec<ChunkHash>>;

    /// Apply a reference update.
    ///
    /// Adds first, then removes the listed references and every reference of
    /// the released job (except references being added by this update), then
    /// marks each touched chunk with no remaining reference. Returns the
    /// chunks newly marked for deletion.
    async fn update_references(
        &self,
        ctx: &OpContext,
        update: &ReferenceUpdate,
    ) -> MetadataResult<Vec<ChunkHash>>;

    /// Physically remove one chunk that is marked and unreferenced.
    ///
    /// In one serializable transaction: delete the row if it is still marked
    /// and no reference names it, remove its content through `content` while
    /// the deletion is uncommitted, release the chunk's outgoing `chunk`
    /// references and mark children left without references. Concurrent
    /// purges and reservations of the same chunk wait for the commit.
    ///
    /// Returns `None` when the chunk was skipped (missing, unmarked or
    /// referenced), otherwise the newly marked children. A content failure
    /// rolls the transaction back and leaves the chunk marked.
    async fn purge_chunk(
        &self,
        ctx: &OpContext,
        chunk: &ChunkHash,
        content: &dyn ContentRemover,
    ) -> MetadataResult<Option<Vec<ChunkHash>>>;

    /// Get a chunk record.
    async fn get_chunk(&self, chunk: &ChunkHash) -> MetadataResult<Option<ChunkRow>>;

    /// Get every reference naming `chunk`.
    async fn refs_for_chunk(&self, chunk: &ChunkHash) -> MetadataResult<Vec<Reference>>;

    /// Get every reference held by a source.
    async fn refs_for_source(
        &self,
        kind: SourceKind,
        source: &str,
    ) -> MetadataResult<Vec<Reference>>;

    /// Get chunks marked for deletion but not yet removed, oldest mark first.
    async fn deleting_chunks(&self, limit: u32) -> MetadataResult<Vec<ChunkRow>>;
}

/// Sorted, de-duplicated hash strings for binding.
pub(crate) fn distinct_hashes(chunks: &[ChunkHash]) -> Vec<String> {
    chunks
        .iter()
        .map(|c| c.as_str())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .map(str::to_string)
        .collect()
}

/// Column-wise view of a reference set, for array binding.
#[derive(Debug, Default)]
pub(crate) struct RefColumns {
    pub kinds: Vec<String>,
    pub sources: Vec<String>,
    pub chunks: Vec<String>,
}

impl RefColumns {
    pub fn new(refs: &[Reference]) -> Self {
        let mut columns = Self::default();
        for reference in refs.iter().collect::<BTreeSet<_>>() {
            columns.kinds.push(reference.kind.as_str().to_string());
            columns.sources.push(reference.source.clone());
            columns.chunks.push(reference.chunk.as_str().to_string());
        }
        columns
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    /// JSON array of `[kind, source, chunk]` triples.
    pub fn to_json(&self) -> String {
        let rows: Vec<[&str; 3]> = self
            .kinds
            .iter()
            .zip(&self.sources)
            .zip(&self.chunks)
            .map(|((kind, source), chunk)| [kind.as_str(), source.as_str(), chunk.as_str()])
            .collect();
        serde_json::Value::from(
            rows.into_iter()
                .map(|row| serde_json::Value::from(row.to_vec()))
                .collect::<Vec<_>>(),
        )
        .to_string()
    }
}

/// JSON array of hash strings.
pub(crate) fn hashes_json(hashes: &[String]) -> String {
    serde_json::Value::from(hashes.to_vec()).to_string()
}

/// Map the raw outcome of a purge transaction.
pub(crate) fn finish_purge(
    chunk: &ChunkHash,
    outcome: Result<Option<Vec<String>>, BoxError>,
) -> MetadataResult<Option<Vec<ChunkHash>>> {
    match outcome {
        Ok(Some(marked)) => Ok(Some(parse_hashes(marked)?)),
        Ok(None) => Ok(None),
        Err(source) => Err(MetadataError::Content {
            chunk: chunk.to_string(),
            source,
        }),
    }
}

/// Parse and de-duplicate hash strings returned by the store.
pub(crate) fn parse_hashes(raw: Vec<String>) -> MetadataResult<Vec<ChunkHash>> {
    raw.into_iter()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .map(|hash| Ok(ChunkHash::new(hash)?))
        .collect()
}
