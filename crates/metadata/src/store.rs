//! Metadata store trait and the SQLite implementation.

use crate::context::OpContext;
use crate::error::MetadataResult;
use crate::models::{ChunkRow, RefRow};
use crate::repos::refs::{RefColumns, distinct_hashes, finish_purge, hashes_json, parse_hashes};
use crate::repos::{BoxError, ContentRemover, RefRepo};
use crate::retry::{RetryPolicy, SqliteConflicts};
use async_trait::async_trait;
use chunkref_core::{ChunkHash, Reference, ReferenceUpdate, SourceKind};
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use time::{OffsetDateTime, PrimitiveDateTime};

/// Combined metadata store trait.
#[async_trait]
pub trait MetadataStore: RefRepo + Send + Sync {
    /// Create the schema if it does not exist. Idempotent.
    async fn migrate(&self) -> MetadataResult<()>;

    /// Check database connectivity and health.
    async fn health_check(&self) -> MetadataResult<()>;

    /// Short backend identifier for logs.
    fn backend_name(&self) -> &'static str;
}

/// SQLite-based metadata store.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
    retry: RetryPolicy,
}

impl SqliteStore {
    /// Create a new SQLite store.
    pub async fn new(path: impl AsRef<Path>, busy_timeout_ms: u64) -> MetadataResult<Self> {
        let path = path.as_ref();

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_millis(busy_timeout_ms));

        let pool = SqlitePoolOptions::new()
            // One writer at a time; concurrent callers queue on the pool and
            // each transaction observes the previous one's commit.
            .max_connections(1)
            .connect_with(opts)
            .await?;

        let store = Self {
            pool,
            retry: RetryPolicy::default(),
        };
        store.migrate().await?;

        tracing::debug!(path = %path.display(), "SQLite reference store ready");

        Ok(store)
    }

    /// Replace the conflict-retry policy.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn migrate(&self) -> MetadataResult<()> {
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "sqlite"
    }
}

fn utc_now() -> PrimitiveDateTime {
    let now = OffsetDateTime::now_utc();
    PrimitiveDateTime::new(now.date(), now.time())
}

async fn mark_orphaned(
    conn: &mut SqliteConnection,
    touched: &[String],
) -> Result<Vec<String>, sqlx::Error> {
    if touched.is_empty() {
        return Ok(Vec::new());
    }
    sqlx::query_scalar(
        r#"
        UPDATE chunks
        SET deleting = ?
        WHERE chunk IN (SELECT value FROM json_each(?))
            AND deleting IS NULL
            AND NOT EXISTS (SELECT 1 FROM refs WHERE refs.chunk = chunks.chunk)
        RETURNING chunk
        "#,
    )
    .bind(utc_now())
    .bind(hashes_json(touched))
    .fetch_all(conn)
    .await
}

#[async_trait]
impl RefRepo for SqliteStore {
    async fn reserve_chunks(
        &self,
        ctx: &OpContext,
        job: &str,
        chunks: &[ChunkHash],
    ) -> MetadataResult<Vec<ChunkHash>> {
        let hashes = distinct_hashes(chunks);
        if hashes.is_empty() {
            return Ok(Vec::new());
        }
        let hashes = hashes_json(&hashes);

        let pool = &self.pool;
        let hashes = hashes.as_str();
        let flush = self
            .retry
            .run(ctx, &SqliteConflicts, "reserve_chunks", move || async move {
                let mut tx = pool.begin().await?;

                sqlx::query(
                    r#"
                    INSERT INTO chunks (chunk)
                    SELECT value FROM json_each(?) WHERE true
                    ON CONFLICT (chunk) DO NOTHING
                    "#,
                )
                .bind(hashes)
                .execute(&mut *tx)
                .await?;

                let flush: Vec<String> = sqlx::query_scalar(
                    r#"
                    SELECT chunk FROM chunks
                    WHERE chunk IN (SELECT value FROM json_each(?))
                        AND deleting IS NOT NULL
                    "#,
                )
                .bind(hashes)
                .fetch_all(&mut *tx)
                .await?;

                sqlx::query(
                    r#"
                    INSERT INTO refs (sourcetype, source, chunk)
                    SELECT 'job', ?, chunk FROM chunks
                    WHERE chunk IN (SELECT value FROM json_each(?))
                        AND deleting IS NULL
                    ON CONFLICT DO NOTHING
                    "#,
                )
                .bind(job)
                .bind(hashes)
                .execute(&mut *tx)
                .await?;

                tx.commit().await?;
                Ok(flush)
            })
            .await?;

        parse_hashes(flush)
    }

    async fn update_references(
        &self,
        ctx: &OpContext,
        update: &ReferenceUpdate,
    ) -> MetadataResult<Vec<ChunkHash>> {
        let adds = RefColumns::new(&update.add);
        let has_removals = update.has_removals();
        if adds.is_empty() && !has_removals {
            return Ok(Vec::new());
        }
        let adds_json = adds.to_json();
        let removes_json = RefColumns::new(&update.remove).to_json();

        let pool = &self.pool;
        let release_job = update.release_job.as_deref();
        let has_adds = !adds.is_empty();
        let (adds_json, removes_json) = (adds_json.as_str(), removes_json.as_str());
        let marked = self
            .retry
            .run(ctx, &SqliteConflicts, "update_references", move || async move {
                let mut tx = pool.begin().await?;

                if has_adds {
                    sqlx::query(
                        r#"
                        INSERT INTO refs (sourcetype, source, chunk)
                        SELECT json_extract(value, '$[0]'),
                               json_extract(value, '$[1]'),
                               json_extract(value, '$[2]')
                        FROM json_each(?) WHERE true
                        ON CONFLICT DO NOTHING
                        "#,
                    )
                    .bind(adds_json)
                    .execute(&mut *tx)
                    .await?;
                }

                let mut marked = Vec::new();
                if has_removals {
                    let mut touched: Vec<String> = sqlx::query_scalar(
                        r#"
                        DELETE FROM refs
                        WHERE (
                                (sourcetype, source, chunk) IN (
                                    SELECT json_extract(value, '$[0]'),
                                           json_extract(value, '$[1]'),
                                           json_extract(value, '$[2]')
                                    FROM json_each(?)
                                )
                                OR (sourcetype = 'job' AND source = ?)
                            )
                            AND (sourcetype, source, chunk) NOT IN (
                                SELECT json_extract(value, '$[0]'),
                                       json_extract(value, '$[1]'),
                                       json_extract(value, '$[2]')
                                FROM json_each(?)
                            )
                        RETURNING chunk
                        "#,
                    )
                    .bind(removes_json)
                    .bind(release_job)
                    .bind(adds_json)
                    .fetch_all(&mut *tx)
                    .await?;
                    touched.sort_unstable();
                    touched.dedup();
                    marked = mark_orphaned(&mut tx, &touched).await?;
                }

                tx.commit().await?;
                Ok(marked)
            })
            .await?;

        parse_hashes(marked)
    }

    async fn purge_chunk(
        &self,
        ctx: &OpContext,
        chunk: &ChunkHash,
        content: &dyn ContentRemover,
    ) -> MetadataResult<Option<Vec<ChunkHash>>> {
        let pool = &self.pool;
        let hash = chunk.as_str();
        let outcome: Result<Option<Vec<String>>, BoxError> = self
            .retry
            .run(ctx, &SqliteConflicts, "purge_chunk", move || async move {
                let mut tx = pool.begin().await?;

                let purged: Option<String> = sqlx::query_scalar(
                    r#"
                    DELETE FROM chunks
                    WHERE chunk = ?
                        AND deleting IS NOT NULL
                        AND NOT EXISTS (SELECT 1 FROM refs WHERE refs.chunk = chunks.chunk)
                    RETURNING chunk
                    "#,
                )
                .bind(hash)
                .fetch_optional(&mut *tx)
                .await?;
                if purged.is_none() {
                    return Ok(Ok(None));
                }

                // The row stays locked until the content is gone.
                if let Err(err) = content.remove_content(chunk).await {
                    return Ok(Err(err));
                }

                let mut children: Vec<String> = sqlx::query_scalar(
                    r#"
                    DELETE FROM refs
                    WHERE sourcetype = 'chunk' AND source = ?
                    RETURNING chunk
                    "#,
                )
                .bind(hash)
                .fetch_all(&mut *tx)
                .await?;
                children.sort_unstable();
                children.dedup();
                let marked = mark_orphaned(&mut tx, &children).await?;

                tx.commit().await?;
                Ok(Ok(Some(marked)))
            })
            .await?;

        finish_purge(chunk, outcome)
    }

    async fn get_chunk(&self, chunk: &ChunkHash) -> MetadataResult<Option<ChunkRow>> {
        let row = sqlx::query_as::<_, ChunkRow>("SELECT chunk, deleting FROM chunks WHERE chunk = ?")
            .bind(chunk.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn refs_for_chunk(&self, chunk: &ChunkHash) -> MetadataResult<Vec<Reference>> {
        let rows = sqlx::query_as::<_, RefRow>(
            "SELECT sourcetype, source, chunk FROM refs WHERE chunk = ? ORDER BY sourcetype, source",
        )
        .bind(chunk.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Reference::try_from).collect()
    }

    async fn refs_for_source(
        &self,
        kind: SourceKind,
        source: &str,
    ) -> MetadataResult<Vec<Reference>> {
        let rows = sqlx::query_as::<_, RefRow>(
            "SELECT sourcetype, source, chunk FROM refs WHERE sourcetype = ? AND source = ? ORDER BY chunk",
        )
        .bind(kind.as_str())
        .bind(source)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Reference::try_from).collect()
    }

    async fn deleting_chunks(&self, limit: u32) -> MetadataResult<Vec<ChunkRow>> {
        let rows = sqlx::query_as::<_, ChunkRow>(
            r#"
            SELECT chunk, deleting
            FROM chunks
            WHERE deleting IS NOT NULL
            ORDER BY deleting, chunk
            LIMIT ?
            "#,
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

const SCHEMA_SQL: &str = r#"
-- Keep-alive edges from a source to a chunk
CREATE TABLE IF NOT EXISTS refs (
    sourcetype TEXT NOT NULL CHECK (sourcetype IN ('chunk', 'job', 'semantic')),
    source TEXT NOT NULL,
    chunk TEXT NOT NULL,
    PRIMARY KEY (sourcetype, source, chunk)
);

-- Known chunks. deleting is set (UTC) once the last reference is gone
CREATE TABLE IF NOT EXISTS chunks (
    chunk TEXT PRIMARY KEY,
    deleting TIMESTAMP
);

CREATE INDEX IF NOT EXISTS idx_chunk ON refs (chunk);
CREATE INDEX IF NOT EXISTS idx_sourcetype_source ON refs (sourcetype, source);
CREATE INDEX IF NOT EXISTS idx_chunks_deleting ON chunks (deleting) WHERE deleting IS NOT NULL;
"#;
