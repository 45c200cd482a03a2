//! Transactional reference store for chunkref.
//!
//! This crate owns the persisted reference graph:
//! - The `chunks` and `refs` relations and their bootstrap
//! - The reservation, reference-update and purge transactions
//! - The conflict-retry coordinator that makes serialization failures invisible
//! - Cancellation contexts and protocol metrics

pub mod context;
pub mod error;
pub mod metrics;
pub mod models;
pub mod postgres;
pub mod repos;
pub mod retry;
pub mod store;

pub use context::OpContext;
pub use error::{MetadataError, MetadataResult};
pub use postgres::PostgresStore;
pub use repos::{BoxError, ContentRemover, RefRepo};
pub use retry::{ConflictClassifier, PostgresConflicts, RetryPolicy, SqliteConflicts};
pub use store::{MetadataStore, SqliteStore};

use chunkref_core::config::{MetadataConfig, RetryConfig};
use std::sync::Arc;

/// Create a metadata store from configuration.
pub async fn from_config(
    config: &MetadataConfig,
    retry: &RetryConfig,
) -> MetadataResult<Arc<dyn MetadataStore>> {
    let policy = RetryPolicy::from_config(retry);
    match config {
        MetadataConfig::Sqlite {
            path,
            busy_timeout_ms,
        } => {
            let store = SqliteStore::new(path, *busy_timeout_ms)
                .await?
                .with_retry_policy(policy);
            Ok(Arc::new(store) as Arc<dyn MetadataStore>)
        }
        MetadataConfig::Postgres {
            url,
            host,
            port,
            username,
            password,
            database,
            ssl_mode,
            max_connections,
            statement_timeout_ms,
        } => {
            let store = if let Some(url) = url {
                // URL takes precedence over individual fields
                tracing::info!("Connecting to PostgreSQL using connection URL");
                PostgresStore::from_url(url, *max_connections, *statement_timeout_ms).await?
            } else if let (Some(host), Some(database)) = (host.as_ref(), database.as_ref()) {
                PostgresStore::from_params(
                    host,
                    port.unwrap_or(5432),
                    username.as_deref(),
                    password.as_deref(),
                    database,
                    *ssl_mode,
                    *max_connections,
                    *statement_timeout_ms,
                )
                .await?
            } else {
                return Err(MetadataError::Config(
                    "postgres config requires either 'url' or 'host' + 'database'".to_string(),
                ));
            };
            Ok(Arc::new(store.with_retry_policy(policy)) as Arc<dyn MetadataStore>)
        }
    }
}
