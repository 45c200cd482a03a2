//! PostgreSQL-based reference store implementation.
//!
//! Every mutating operation is one `SERIALIZABLE` transaction run through the
//! store's [`RetryPolicy`]; batch inputs are bound as `TEXT[]` and expanded
//! with `UNNEST`.

use crate::context::OpContext;
use crate::error::MetadataResult;
use crate::models::{ChunkRow, RefRow};
use crate::repos::refs::{RefColumns, distinct_hashes, finish_purge, parse_hashes};
use crate::repos::{BoxError, ContentRemover, RefRepo};
use crate::retry::{PostgresConflicts, RetryPolicy};
use crate::store::MetadataStore;
use async_trait::async_trait;
use chunkref_core::config::PgSslMode;
use chunkref_core::{ChunkHash, Reference, ReferenceUpdate, SourceKind};
use sqlx::postgres::{PgConnectOptions, PgConnection, PgPoolOptions, PgSslMode as SqlxPgSslMode};
use sqlx::{Pool, Postgres, Transaction};
use std::str::FromStr;

/// PostgreSQL schema (embedded).
const POSTGRES_SCHEMA: &str = include_str!("postgres_schema.sql");

/// Split the schema into statements on `;`, ignoring separators inside
/// `$$`-quoted bodies. Comment-only fragments are dropped.
fn postgres_schema_statements(schema: &str) -> Vec<&str> {
    let mut fragments = Vec::new();
    let bytes = schema.as_bytes();
    let mut in_dollar_quote = false;
    let mut start = 0;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'$' if bytes.get(i + 1) == Some(&b'$') => {
                in_dollar_quote = !in_dollar_quote;
                i += 2;
                continue;
            }
            b';' if !in_dollar_quote => {
                fragments.push(&schema[start..i]);
                start = i + 1;
            }
            _ => {}
        }
        i += 1;
    }
    fragments.push(&schema[start..]);

    fragments
        .into_iter()
        .filter_map(|statement| {
            let trimmed = statement.trim();
            let has_sql = trimmed.lines().any(|line| {
                let line = line.trim();
                !line.is_empty() && !line.starts_with("--")
            });
            has_sql.then_some(trimmed)
        })
        .collect()
}

const RESERVE_SQL: &str = r#"
    WITH requested AS (
        SELECT DISTINCT chunk FROM UNNEST($2::text[]) AS requested(chunk)
    ),
    upserted AS (
        INSERT INTO chunks (chunk)
        SELECT chunk FROM requested
        ON CONFLICT (chunk) DO UPDATE SET chunk = EXCLUDED.chunk
        RETURNING chunk, deleting
    ),
    referenced AS (
        INSERT INTO refs (sourcetype, source, chunk)
        SELECT 'job'::reftype, $1, chunk FROM upserted WHERE deleting IS NULL
        ON CONFLICT DO NOTHING
    )
    SELECT chunk FROM upserted WHERE deleting IS NOT NULL
"#;

const ADD_REFS_SQL: &str = r#"
    INSERT INTO refs (sourcetype, source, chunk)
    SELECT kind::reftype, source, chunk
    FROM UNNEST($1::text[], $2::text[], $3::text[]) AS adds(kind, source, chunk)
    ON CONFLICT DO NOTHING
"#;

const REMOVE_REFS_SQL: &str = r#"
    DELETE FROM refs
    WHERE (
            (sourcetype::text, source, chunk) IN (
                SELECT kind, source, chunk
                FROM UNNEST($1::text[], $2::text[], $3::text[]) AS removes(kind, source, chunk)
            )
            OR (sourcetype = 'job' AND source = $4::text)
        )
        AND (sourcetype::text, source, chunk) NOT IN (
            SELECT kind, source, chunk
            FROM UNNEST($5::text[], $6::text[], $7::text[]) AS adds(kind, source, chunk)
        )
    RETURNING chunk
"#;

const MARK_ORPHANED_SQL: &str = r#"
    UPDATE chunks
    SET deleting = (now() AT TIME ZONE 'UTC')
    WHERE chunk = ANY($1::text[])
        AND deleting IS NULL
        AND NOT EXISTS (SELECT 1 FROM refs WHERE refs.chunk = chunks.chunk)
    RETURNING chunk
"#;

const PURGE_CHUNK_SQL: &str = r#"
    DELETE FROM chunks
    WHERE chunk = $1
        AND deleting IS NOT NULL
        AND NOT EXISTS (SELECT 1 FROM refs WHERE refs.chunk = chunks.chunk)
    RETURNING chunk
"#;

const RELEASE_CHUNK_SOURCES_SQL: &str = r#"
    DELETE FROM refs
    WHERE sourcetype = 'chunk' AND source = $1
    RETURNING chunk
"#;

async fn begin_serializable(
    pool: &Pool<Postgres>,
) -> Result<Transaction<'static, Postgres>, sqlx::Error> {
    let mut tx = pool.begin().await?;
    sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
        .execute(&mut *tx)
        .await?;
    Ok(tx)
}

/// Mark each touched chunk that has no remaining reference and is not already
/// marked. Runs after the deletions of the same transaction.
async fn mark_orphaned(
    conn: &mut PgConnection,
    touched: &[String],
) -> Result<Vec<String>, sqlx::Error> {
    if touched.is_empty() {
        return Ok(Vec::new());
    }
    sqlx::query_scalar(MARK_ORPHANED_SQL)
        .bind(touched)
        .fetch_all(conn)
        .await
}

/// PostgreSQL-based reference store.
pub struct PostgresStore {
    pool: Pool<Postgres>,
    retry: RetryPolicy,
}

impl PostgresStore {
    /// Create a new PostgreSQL store from a connection URL.
    pub async fn from_url(
        url: &str,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        let opts = PgConnectOptions::from_str(url)?;
        Self::connect(opts, max_connections, statement_timeout_ms).await
    }

    /// Create a new PostgreSQL store from individual connection parameters.
    ///
    /// Lets the password arrive separately from the rest of the target, e.g.
    /// through an environment variable.
    #[allow(clippy::too_many_arguments)]
    pub async fn from_params(
        host: &str,
        port: u16,
        username: Option<&str>,
        password: Option<&str>,
        database: &str,
        ssl_mode: Option<PgSslMode>,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        let mut opts = PgConnectOptions::new()
            .host(host)
            .port(port)
            .database(database);

        if let Some(user) = username {
            opts = opts.username(user);
        }

        if let Some(pass) = password {
            opts = opts.password(pass);
        }

        if let Some(mode) = ssl_mode {
            let sqlx_mode = match mode {
                PgSslMode::Disable => SqlxPgSslMode::Disable,
                PgSslMode::Prefer => SqlxPgSslMode::Prefer,
                PgSslMode::Require => SqlxPgSslMode::Require,
            };
            opts = opts.ssl_mode(sqlx_mode);
        }

        // Log connection info without password
        tracing::info!(
            host = host,
            port = port,
            database = database,
            username = username.unwrap_or("<none>"),
            ssl_mode = ?ssl_mode,
            "Connecting to PostgreSQL with individual parameters"
        );

        Self::connect(opts, max_connections, statement_timeout_ms).await
    }

    /// Shorthand for [`PostgresStore::from_url`] with default pool settings.
    pub async fn new(url: &str) -> MetadataResult<Self> {
        Self::from_url(url, 10, None).await
    }

    async fn connect(
        mut opts: PgConnectOptions,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        if let Some(timeout_ms) = statement_timeout_ms {
            opts = opts.options([("statement_timeout", format!("{}ms", timeout_ms))]);
            tracing::info!("PostgreSQL statement_timeout set to {}ms", timeout_ms);
        }

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_with(opts)
            .await?;

        let store = Self {
            pool,
            retry: RetryPolicy::default(),
        };
        store.migrate().await?;

        Ok(store)
    }

    /// Replace the conflict-retry policy.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }
}

#[async_trait]
impl MetadataStore for PostgresStore {
    async fn migrate(&self) -> MetadataResult<()> {
        // PostgreSQL doesn't allow multiple statements in a single prepared statement,
        // so we split the schema and execute each statement separately.
        for statement in postgres_schema_statements(POSTGRES_SCHEMA) {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "postgres"
    }
}

#[async_trait]
impl RefRepo for PostgresStore {
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

        let pool = &self.pool;
        let hashes = &hashes;
        let flush = self
            .retry
            .run(ctx, &PostgresConflicts, "reserve_chunks", move || async move {
                let mut tx = begin_serializable(pool).await?;
                let flush: Vec<String> = sqlx::query_scalar(RESERVE_SQL)
                    .bind(job)
                    .bind(hashes)
                    .fetch_all(&mut *tx)
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
        let removes = RefColumns::new(&update.remove);
        let release_job = update.release_job.as_deref();
        let has_removals = update.has_removals();
        if adds.is_empty() && !has_removals {
            return Ok(Vec::new());
        }

        let pool = &self.pool;
        let (adds, removes) = (&adds, &removes);
        let marked = self
            .retry
            .run(ctx, &PostgresConflicts, "update_references", move || async move {
                let mut tx = begin_serializable(pool).await?;

                if !adds.is_empty() {
                    sqlx::query(ADD_REFS_SQL)
                        .bind(&adds.kinds)
                        .bind(&adds.sources)
                        .bind(&adds.chunks)
                        .execute(&mut *tx)
                        .await?;
                }

                let mut marked = Vec::new();
                if has_removals {
                    let mut touched: Vec<String> = sqlx::query_scalar(REMOVE_REFS_SQL)
                        .bind(&removes.kinds)
                        .bind(&removes.sources)
                        .bind(&removes.chunks)
                        .bind(release_job)
                        .bind(&adds.kinds)
                        .bind(&adds.sources)
                        .bind(&adds.chunks)
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
            .run(ctx, &PostgresConflicts, "purge_chunk", move || async move {
                let mut tx = begin_serializable(pool).await?;

                let purged: Option<String> = sqlx::query_scalar(PURGE_CHUNK_SQL)
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

                let mut children: Vec<String> = sqlx::query_scalar(RELEASE_CHUNK_SOURCES_SQL)
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
        let row = sqlx::query_as::<_, ChunkRow>("SELECT chunk, deleting FROM chunks WHERE chunk = $1")
            .bind(chunk.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn refs_for_chunk(&self, chunk: &ChunkHash) -> MetadataResult<Vec<Reference>> {
        let rows = sqlx::query_as::<_, RefRow>(
            r#"
            SELECT sourcetype::text AS sourcetype, source, chunk
            FROM refs
            WHERE chunk = $1
            ORDER BY sourcetype, source
            "#,
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
            r#"
            SELECT sourcetype::text AS sourcetype, source, chunk
            FROM refs
            WHERE sourcetype = $1::reftype AND source = $2
            ORDER BY chunk
            "#,
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
            LIMIT $1
            "#,
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}
