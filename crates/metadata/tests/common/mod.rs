//! Reference store test utilities.

#![allow(dead_code)]

use async_trait::async_trait;
use chunkref_core::ChunkHash;
use chunkref_metadata::{
    BoxError, ContentRemover, MetadataError, MetadataResult, MetadataStore, PostgresStore,
    SqliteStore,
};
use sqlx::{Pool, Postgres as SqlxPostgres, Sqlite};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use testcontainers::{ContainerAsync, ImageExt, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;

/// Stable prefix for Docker/container startup failures in Postgres test setup.
/// Tests use this marker to decide whether to skip due to unavailable Docker.
pub const POSTGRES_CONTAINER_START_ERR_PREFIX: &str = "postgres-container-start:";

/// A SQLite-backed test store that removes its database on drop.
pub struct TestMetadata {
    pub store: Arc<dyn MetadataStore>,
    sqlite_store: Arc<SqliteStore>,
    _temp_dir: TempDir,
}

impl TestMetadata {
    pub async fn new() -> MetadataResult<Self> {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
        let db_path = temp_dir.path().join("refs.db");
        let store = Arc::new(SqliteStore::new(&db_path, 5000).await?);

        Ok(Self {
            store: store.clone(),
            sqlite_store: store,
            _temp_dir: temp_dir,
        })
    }

    pub fn store(&self) -> Arc<dyn MetadataStore> {
        self.store.clone()
    }

    /// SQLite connection pool for raw queries.
    pub fn pool(&self) -> &Pool<Sqlite> {
        self.sqlite_store.pool()
    }
}

/// PostgreSQL test store backed by a testcontainer.
pub struct PostgresTestMetadata {
    pub store: Arc<dyn MetadataStore>,
    postgres_store: Arc<PostgresStore>,
    _container: ContainerAsync<Postgres>,
}

impl PostgresTestMetadata {
    pub async fn new() -> MetadataResult<Self> {
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

        // Default credentials from testcontainers-modules postgres
        let url = format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

        let store = Arc::new(PostgresStore::from_url(&url, 8, None).await?);

        Ok(Self {
            store: store.clone(),
            postgres_store: store,
            _container: container,
        })
    }

    pub fn store(&self) -> Arc<dyn MetadataStore> {
        self.store.clone()
    }

    /// PostgreSQL connection pool for raw queries.
    pub fn pool(&self) -> &Pool<SqlxPostgres> {
        self.postgres_store.pool()
    }
}

/// Try to create a PostgreSQL test store, skipping if Docker is unavailable
/// or SKIP_POSTGRES_TESTS is set.
///
/// Only container-start failures cause a skip. Schema or connection errors
/// still panic.
pub async fn postgres_or_skip() -> Option<PostgresTestMetadata> {
    if std::env::var("SKIP_POSTGRES_TESTS").is_ok() {
        return None;
    }
    match PostgresTestMetadata::new().await {
        Ok(metadata) => Some(metadata),
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
pub async fn run_metadata_test_both<F, Fut>(test_fn: F)
where
    F: Fn(Arc<dyn MetadataStore>) -> Fut + Clone,
    Fut: std::future::Future<Output = ()>,
{
    let sqlite = TestMetadata::new()
        .await
        .expect("Failed to create SQLite test metadata");
    test_fn.clone()(sqlite.store()).await;

    if let Some(postgres) = postgres_or_skip().await {
        test_fn(postgres.store()).await;
    }
}

/// Content remover that records what it was asked to remove.
#[derive(Default)]
pub struct RecordingContent {
    removed: Mutex<Vec<ChunkHash>>,
    fail: bool,
}

impl RecordingContent {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn removed(&self) -> Vec<ChunkHash> {
        self.removed.lock().unwrap().clone()
    }
}

#[async_trait]
impl ContentRemover for RecordingContent {
    async fn remove_content(&self, chunk: &ChunkHash) -> Result<(), BoxError> {
        self.removed.lock().unwrap().push(chunk.clone());
        if self.fail {
            return Err("injected content failure".into());
        }
        Ok(())
    }
}

pub fn hash(seed: &str) -> ChunkHash {
    ChunkHash::new(seed).expect("valid test hash")
}

pub fn hashes(seeds: &[&str]) -> Vec<ChunkHash> {
    seeds.iter().map(|s| hash(s)).collect()
}
