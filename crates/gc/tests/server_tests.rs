//! Storage-backed chunk server tests.

mod common;

use async_trait::async_trait;
use bytes::Bytes;
use chunkref_core::{ChunkHash, Reference, ReferenceUpdate};
use chunkref_gc::{ChunkServer, GcClient, OpContext, ServerError, StorageServer, StoreClient};
use chunkref_metadata::{MetadataStore, SqliteStore};
use chunkref_storage::{
    FilesystemBackend, MemoryBackend, ObjectStore, StorageError, StorageResult,
};
use common::{RecordingServer, hash, hashes};
use std::sync::Arc;
use tempfile::TempDir;

/// Object store whose deletes always fail.
struct ReadOnlyStore(MemoryBackend);

#[async_trait]
impl ObjectStore for ReadOnlyStore {
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        self.0.exists(key).await
    }

    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        self.0.get(key).await
    }

    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        self.0.put(key, data).await
    }

    async fn delete(&self, _key: &str) -> StorageResult<()> {
        Err(StorageError::Io(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "read-only volume",
        )))
    }

    fn backend_name(&self) -> &'static str {
        "read-only"
    }
}

struct Harness {
    client: StoreClient,
    metadata: Arc<dyn MetadataStore>,
    storage: Arc<dyn ObjectStore>,
    server: Arc<StorageServer>,
    recorder: Arc<RecordingServer>,
    _dir: TempDir,
}

impl Harness {
    async fn new(storage: Arc<dyn ObjectStore>, dir: TempDir) -> Self {
        let metadata: Arc<dyn MetadataStore> = Arc::new(
            SqliteStore::new(dir.path().join("refs.db"), 5000)
                .await
                .unwrap(),
        );
        let server = Arc::new(StorageServer::new(metadata.clone(), storage.clone()));
        let recorder = RecordingServer::wrapping(server.clone());
        let client = StoreClient::new(metadata.clone(), recorder.clone());
        Self {
            client,
            metadata,
            storage,
            server,
            recorder,
            _dir: dir,
        }
    }

    async fn memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()), tempfile::tempdir().unwrap()).await
    }

    async fn filesystem() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let storage = FilesystemBackend::new(dir.path().join("chunks")).await.unwrap();
        Self::new(Arc::new(storage), dir).await
    }

    /// Write content for `data` and return its hash.
    async fn write_chunk(&self, data: &'static [u8]) -> ChunkHash {
        let chunk = ChunkHash::compute(data);
        self.storage
            .put(&chunk.to_object_key(), Bytes::from_static(data))
            .await
            .unwrap();
        chunk
    }

    async fn has_content(&self, chunk: &ChunkHash) -> bool {
        self.storage.exists(&chunk.to_object_key()).await.unwrap()
    }

    async fn has_row(&self, chunk: &ChunkHash) -> bool {
        self.metadata.get_chunk(chunk).await.unwrap().is_some()
    }
}

#[tokio::test]
async fn test_release_removes_content_and_rows() {
    for harness in [Harness::memory().await, Harness::filesystem().await] {
        let ctx = OpContext::new();
        let a = harness.write_chunk(b"alpha").await;
        let b = harness.write_chunk(b"beta").await;

        harness
            .client
            .reserve_chunks(&ctx, "upload-1", &[a.clone(), b.clone()])
            .await
            .unwrap();
        harness
            .client
            .update_references(&ctx, &[Reference::semantic("v1", b.clone())], &[], Some("upload-1"))
            .await
            .unwrap();

        assert!(!harness.has_content(&a).await);
        assert!(!harness.has_row(&a).await);
        assert!(harness.has_content(&b).await);
        assert!(harness.has_row(&b).await);
        assert_eq!(
            harness.metadata.refs_for_chunk(&b).await.unwrap(),
            vec![Reference::semantic("v1", b.clone())]
        );
    }
}

#[tokio::test]
async fn test_missing_content_counts_as_deleted() {
    let harness = Harness::memory().await;
    let ctx = OpContext::new();
    let ghost = hash("never-written");

    harness
        .client
        .reserve_chunks(&ctx, "j", std::slice::from_ref(&ghost))
        .await
        .unwrap();
    harness
        .client
        .update_references(&ctx, &[], &[], Some("j"))
        .await
        .unwrap();

    assert!(!harness.has_row(&ghost).await);
}

#[tokio::test]
async fn test_purge_cascades_through_chunk_references() {
    let harness = Harness::memory().await;
    let ctx = OpContext::new();
    let parent = harness.write_chunk(b"index").await;
    let leaf = harness.write_chunk(b"leaf").await;
    let shared = harness.write_chunk(b"shared").await;
    let grandchild = harness.write_chunk(b"grandchild").await;

    harness
        .client
        .reserve_chunks(
            &ctx,
            "build",
            &[parent.clone(), leaf.clone(), shared.clone(), grandchild.clone()],
        )
        .await
        .unwrap();
    harness
        .client
        .update_references(
            &ctx,
            &[
                Reference::chunk(&parent, leaf.clone()),
                Reference::chunk(&parent, shared.clone()),
                Reference::chunk(&leaf, grandchild.clone()),
                Reference::semantic("pinned", shared.clone()),
            ],
            &[],
            Some("build"),
        )
        .await
        .unwrap();

    // Only the parent lost its last reference; the rest went with it.
    assert_eq!(harness.recorder.deletes(), vec![vec![parent.clone()]]);
    for gone in [&parent, &leaf, &grandchild] {
        assert!(!harness.has_content(gone).await);
        assert!(!harness.has_row(gone).await);
    }
    assert!(harness.has_content(&shared).await);
    assert_eq!(
        harness.metadata.refs_for_chunk(&shared).await.unwrap(),
        vec![Reference::semantic("pinned", shared.clone())]
    );
}

#[tokio::test]
async fn test_flush_after_delete_is_idempotent() {
    let harness = Harness::memory().await;
    let ctx = OpContext::new();
    let chunk = harness.write_chunk(b"once").await;

    harness
        .client
        .reserve_chunks(&ctx, "j", std::slice::from_ref(&chunk))
        .await
        .unwrap();
    harness
        .client
        .update_references(&ctx, &[], &[], Some("j"))
        .await
        .unwrap();

    harness
        .server
        .flush_deletes(&ctx, std::slice::from_ref(&chunk))
        .await
        .unwrap();
    harness
        .server
        .delete_chunks(&ctx, &[chunk.clone(), chunk.clone()])
        .await
        .unwrap();
    assert!(!harness.has_row(&chunk).await);
}

#[tokio::test]
async fn test_unmarked_chunks_are_left_alone() {
    let harness = Harness::memory().await;
    let ctx = OpContext::new();
    let live = harness.write_chunk(b"live").await;

    harness
        .client
        .reserve_chunks(&ctx, "j", std::slice::from_ref(&live))
        .await
        .unwrap();
    harness
        .server
        .delete_chunks(&ctx, std::slice::from_ref(&live))
        .await
        .unwrap();
    harness.server.flush_deletes(&ctx, &[]).await.unwrap();

    assert!(harness.has_content(&live).await);
    assert!(harness.has_row(&live).await);
    assert_eq!(harness.metadata.refs_for_chunk(&live).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_reserve_of_pending_chunk_resolves_deletion_first() {
    let harness = Harness::memory().await;
    let ctx = OpContext::new();
    let chunk = harness.write_chunk(b"recycled").await;

    harness
        .client
        .reserve_chunks(&ctx, "old", std::slice::from_ref(&chunk))
        .await
        .unwrap();

    // Mark without deleting, as if the deleting process had crashed.
    harness
        .metadata
        .update_references(&ctx, &ReferenceUpdate::new().release_job("old"))
        .await
        .unwrap();
    assert!(harness.has_content(&chunk).await);

    harness
        .client
        .reserve_chunks(&ctx, "new", std::slice::from_ref(&chunk))
        .await
        .unwrap();

    assert_eq!(harness.recorder.flushes(), vec![vec![chunk.clone()]]);
    assert!(!harness.has_content(&chunk).await);
    assert!(!harness.has_row(&chunk).await);

    // The writer re-uploads and reserves again, now successfully.
    harness.write_chunk(b"recycled").await;
    harness
        .client
        .reserve_chunks(&ctx, "new", std::slice::from_ref(&chunk))
        .await
        .unwrap();
    assert_eq!(
        harness.metadata.refs_for_chunk(&chunk).await.unwrap(),
        vec![Reference::job("new", chunk.clone())]
    );
}

#[tokio::test]
async fn test_recover_redrives_crashed_deletes() {
    let harness = Harness::filesystem().await;
    let ctx = OpContext::new();
    let chunks = hashes(&["aaaa01", "bbbb02"]);
    for chunk in &chunks {
        harness
            .storage
            .put(&chunk.to_object_key(), Bytes::from_static(b"x"))
            .await
            .unwrap();
    }

    harness
        .client
        .reserve_chunks(&ctx, "j", &chunks)
        .await
        .unwrap();
    harness
        .metadata
        .update_references(&ctx, &ReferenceUpdate::new().release_job("j"))
        .await
        .unwrap();

    let redriven = harness.client.recover_pending_deletes(&ctx, 10).await.unwrap();

    assert_eq!(redriven, 2);
    for chunk in &chunks {
        assert!(!harness.has_content(chunk).await);
        assert!(!harness.has_row(chunk).await);
    }
    assert_eq!(harness.client.recover_pending_deletes(&ctx, 10).await.unwrap(), 0);
}

#[tokio::test]
async fn test_cancelled_delete_leaves_chunk_marked() {
    let harness = Harness::memory().await;
    let ctx = OpContext::new();
    let chunk = harness.write_chunk(b"pending").await;

    harness
        .client
        .reserve_chunks(&ctx, "j", std::slice::from_ref(&chunk))
        .await
        .unwrap();
    harness
        .metadata
        .update_references(&ctx, &ReferenceUpdate::new().release_job("j"))
        .await
        .unwrap();

    let cancelled = OpContext::new();
    cancelled.cancel();
    assert!(
        harness
            .server
            .delete_chunks(&cancelled, std::slice::from_ref(&chunk))
            .await
            .is_err()
    );
    assert!(harness.has_content(&chunk).await);
    assert!(
        harness
            .metadata
            .get_chunk(&chunk)
            .await
            .unwrap()
            .is_some_and(|row| row.is_deleting())
    );
}

#[tokio::test]
async fn test_short_and_fanned_out_hashes_coexist_on_filesystem() {
    let harness = Harness::filesystem().await;
    let ctx = OpContext::new();
    let chunks = hashes(&["ab", "abcd1234"]);
    for chunk in &chunks {
        harness
            .storage
            .put(&chunk.to_object_key(), Bytes::from_static(b"x"))
            .await
            .unwrap();
    }

    harness
        .client
        .reserve_chunks(&ctx, "j", &chunks)
        .await
        .unwrap();
    let deleted = harness
        .client
        .apply(&ctx, &ReferenceUpdate::new().release_job("j"))
        .await
        .unwrap();

    assert_eq!(deleted, chunks);
    for chunk in &chunks {
        assert!(!harness.has_content(chunk).await);
        assert!(!harness.has_row(chunk).await);
    }
}

#[tokio::test]
async fn test_servers_sharing_a_store_delete_each_chunk_once() {
    let harness = Harness::memory().await;
    let ctx = OpContext::new();
    let chunks = hashes(&["c1", "c2", "c3", "c4"]);
    for chunk in &chunks {
        harness
            .storage
            .put(&chunk.to_object_key(), Bytes::from_static(b"x"))
            .await
            .unwrap();
    }
    harness
        .client
        .reserve_chunks(&ctx, "j", &chunks)
        .await
        .unwrap();
    harness
        .metadata
        .update_references(&ctx, &ReferenceUpdate::new().release_job("j"))
        .await
        .unwrap();

    // A second server, as another process would run it, over the same stores.
    let other = Arc::new(StorageServer::new(
        harness.metadata.clone(),
        harness.storage.clone(),
    ));
    let servers: [Arc<StorageServer>; 2] = [harness.server.clone(), other];
    let tasks = servers.into_iter().map(|server| {
        let chunks = chunks.clone();
        tokio::spawn(async move { server.delete_chunks(&OpContext::new(), &chunks).await })
    });
    for result in futures::future::join_all(tasks).await {
        result.unwrap().unwrap();
    }

    for chunk in &chunks {
        assert!(!harness.has_content(chunk).await);
        assert!(!harness.has_row(chunk).await);
    }
}

#[tokio::test]
async fn test_storage_failure_keeps_chunk_marked() {
    let harness = Harness::new(
        Arc::new(ReadOnlyStore(MemoryBackend::new())),
        tempfile::tempdir().unwrap(),
    )
    .await;
    let ctx = OpContext::new();
    let parent = harness.write_chunk(b"stuck").await;
    let child = harness.write_chunk(b"child").await;

    harness
        .client
        .reserve_chunks(&ctx, "j", &[parent.clone(), child.clone()])
        .await
        .unwrap();
    harness
        .client
        .update_references(
            &ctx,
            &[Reference::chunk(&parent, child.clone())],
            &[],
            None,
        )
        .await
        .unwrap();
    harness
        .metadata
        .update_references(
            &ctx,
            &ReferenceUpdate::new().remove(Reference::job("j", parent.clone())),
        )
        .await
        .unwrap();

    let err = harness
        .server
        .delete_chunks(&ctx, std::slice::from_ref(&parent))
        .await
        .unwrap_err();

    assert!(
        matches!(&err, ServerError::Storage { chunk, source } if chunk == parent.as_str() && !source.is_not_found())
    );
    assert!(harness.has_content(&parent).await);
    assert!(
        harness
            .metadata
            .get_chunk(&parent)
            .await
            .unwrap()
            .is_some_and(|row| row.is_deleting())
    );
    // The purge rolled back, so the child is still held by its parent.
    assert_eq!(
        harness.metadata.refs_for_chunk(&child).await.unwrap(),
        vec![
            Reference::chunk(&parent, child.clone()),
            Reference::job("j", child.clone()),
        ]
    );
}
