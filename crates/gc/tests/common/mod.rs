//! GC client test utilities.

#![allow(dead_code)]

use async_trait::async_trait;
use chunkref_core::ChunkHash;
use chunkref_gc::{
    ChunkServer, OpContext, ServerError, ServerResult, StorageServer, StoreClient,
};
use chunkref_metadata::{MetadataError, MetadataResult, MetadataStore, PostgresStore, SqliteStore};
use chunkref_storage::{MemoryBackend, ObjectStore};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use testcontainers::{ContainerAsync, ImageExt, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;

/// Stable prefix for Docker/container startup failures in Postgres test setup.
pub const POSTGRES_CONTAINER_START_ERR_PREFIX: &str = "postgres-container-start:";

/// Chunk server that records every call and can be told to fail.
///
/// With an inner server, calls are forwarded after being recorded.
#[derive(Default)]
pub struct RecordingServer {
    flushes: Mutex<Vec<Vec<ChunkHash>>>,
    deletes: Mutex<Vec<Vec<ChunkHash>>>,
    fail: AtomicBool,
    inner: Option<Arc<dyn ChunkServer>>,
}

impl RecordingServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn wrapping(inner: Arc<dyn ChunkServer>) -> Arc<Self> {
        Arc::new(Self {
            inner: Some(inner),
            ..Self::default()
        })
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn flushes(&self) -> Vec<Vec<ChunkHash>> {
        self.flushes.lock().unwrap().clone()
    }

    pub fn deletes(&self) -> Vec<Vec<ChunkHash>> {
        self.deletes.lock().unwrap().clone()
    }

    fn check(&self) -> ServerResult<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(ServerError::Unavailable("injected failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ChunkServer for RecordingServer {
    async fn flush_deletes(&self, ctx: &OpContext, chunks: &[ChunkHash]) -> ServerResult<()> {
        self.flushes.lock().unwrap().push(chunks.to_vec());
        self.check()?;
        match &self.inner {
            Some(inner) => inner.flush_deletes(ctx, chunks).await,
            None => Ok(()),
        }
    }

    async fn delete_chunks(&self, ctx: &OpContext, chunks: &[ChunkHash]) -> ServerResult<()> {
        self.deletes.lock().unwrap().push(chunks.to_vec());
        self.check()?;
        match &self.inner {
            Some(inner) => inner.delete_chunks(ctx, chunks).await,
            None => Ok(()),
        }
    }
}

/// What keeps a test database alive.
enum Backing {
    Sqlite(TempDir),
    Postgres(ContainerAsync<Postgres>),
}

/// A client wired to a fresh store and a recording server.
///
/// A served environment forwards the recorded calls to a [`StorageServer`]
/// over `storage`; otherwise nothing is ever physically deleted.
pub struct TestEnv {
    pub client: StoreClient,
    pub store: Arc<dyn MetadataStore>,
    pub storage: Arc<dyn ObjectStore>,
    pub server: Arc<RecordingServer>,
    _backing: Backing,
}

impl TestEnv {
    pub async fn sqlite() -> MetadataResult<Self> {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
        let store: Arc<dyn MetadataStore> =
            Arc::new(SqliteStore::new(temp_dir.path().join("refs.db"), 5000).await?);
        Ok(Self::wire(store, Backing::Sqlite(temp_dir), false))
    }

    pub async fn postgres() -> MetadataResult<Self> {
        let container = Postgres::default()
            .with_tag("15-alpine")
            .start()
            .await
            .map_err(|e| {
                MetadataError::Internal(format!(
                    "{} Failed to start PostgreSQL container: {e}",
                    POSTGRES_CONTAINER_START_ERR_PREFIX
                ))
            })?;

        let host = container.get_host().await.expect("Failed to get host");
        let port = container
            .get_host_port_ipv4(5432)
            .await
            .expect("Failed to get port");
        let url = format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

        let store: Arc<dyn MetadataStore> = Arc::new(PostgresStore::from_url(&url, 8, None).await?);
        Ok(Self::wire(store, Backing::Postgres(container), false))
    }

    fn wire(store: Arc<dyn MetadataStore>, backing: Backing, served: bool) -> Self {
        let storage: Arc<dyn ObjectStore> = Arc::new(MemoryBackend::new());
        let server = if served {
            RecordingServer::wrapping(Arc::new(StorageServer::new(store.clone(), storage.clone())))
        } else {
            RecordingServer::new()
        };
        let client = StoreClient::new(store.clone(), server.clone());
        Self {
            client,
            store,
            storage,
            server,
            _backing: backing,
        }
    }

    /// The same store, with calls forwarded to a real [`StorageServer`].
    pub fn served(self) -> Self {
        Self::wire(self.store, self._backing, true)
    }
}

/// PostgreSQL environment, or `None` when Docker is unavailable or
/// SKIP_POSTGRES_TESTS is set.
pub async fn postgres_or_skip() -> Option<TestEnv> {
    if std::env::var("SKIP_POSTGRES_TESTS").is_ok() {
        return None;
    }
    match TestEnv::postgres().await {
        Ok(env) => Some(env),
        Err(err) => {
            let msg = err.to_string();
            if msg.contains(POSTGRES_CONTAINER_START_ERR_PREFIX) {
                eprintln!("Skipping PostgreSQL test (Docker unavailable): {msg}");
                None
            } else {
                panic!("PostgreSQL test setup failed: {msg}");
            }
        }
    }
}

/// Run a test against both SQLite and PostgreSQL backends.
pub async fn run_client_test_both<F, Fut>(test_fn: F)
where
    F: Fn(TestEnv) -> Fut + Clone,
    Fut: std::future::Future<Output = ()>,
{
    let sqlite = TestEnv::sqlite()
        .await
        .expect("Failed to create SQLite test environment");
    test_fn.clone()(sqlite).await;

    if let Some(postgres) = postgres_or_skip().await {
        test_fn(postgres).await;
    }
}

/// Like [`run_client_test_both`], with deletions carried out by a
/// [`StorageServer`] over in-memory content.
pub async fn run_served_test_both<F, Fut>(test_fn: F)
where
    F: Fn(TestEnv) -> Fut + Clone,
    Fut: std::future::Future<Output = ()>,
{
    run_client_test_both(move |env| test_fn.clone()(env.served())).await;
}

pub fn hash(seed: &str) -> ChunkHash {
    ChunkHash::new(seed).expect("valid test hash")
}

pub fn hashes(seeds: &[&str]) -> Vec<ChunkHash> {
    seeds.iter().map(|s| hash(s)).collect()
}
