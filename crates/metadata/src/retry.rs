//! Conflict-retry coordinator for serializable transactions.
//!
//! A unit of work is a closure that begins a transaction, runs its statements
//! and commits. When any stage fails because a concurrent serializable
//! transaction won (a conflict), the whole unit is run again from a fresh
//! transaction. Every other failure is returned unchanged.

use crate::context::OpContext;
use crate::error::{MetadataError, MetadataResult};
use crate::metrics;
use chunkref_core::config::RetryConfig;
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Decides whether a database error is a transient conflict.
///
/// The signal is store-specific, so each backend supplies its own classifier.
/// Closures `Fn(&sqlx::Error) -> bool` implement this trait.
pub trait ConflictClassifier: Send + Sync {
    fn is_conflict(&self, err: &sqlx::Error) -> bool;
}

impl<F> ConflictClassifier for F
where
    F: Fn(&sqlx::Error) -> bool + Send + Sync,
{
    fn is_conflict(&self, err: &sqlx::Error) -> bool {
        self(err)
    }
}

fn database_code(err: &sqlx::Error) -> Option<String> {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().map(|code| code.into_owned()),
        _ => None,
    }
}

/// PostgreSQL conflicts: SQLSTATE class 40 (`transaction_rollback`), which
/// covers `serialization_failure` (40001) and `deadlock_detected` (40P01).
#[derive(Clone, Copy, Debug, Default)]
pub struct PostgresConflicts;

impl PostgresConflicts {
    pub fn is_conflict_code(code: &str) -> bool {
        code.len() == 5 && code.starts_with("40")
    }
}

impl ConflictClassifier for PostgresConflicts {
    fn is_conflict(&self, err: &sqlx::Error) -> bool {
        database_code(err).is_some_and(|code| Self::is_conflict_code(&code))
    }
}

/// SQLite conflicts: the `SQLITE_BUSY` (5) and `SQLITE_LOCKED` (6) primary
/// codes and their extended variants such as `SQLITE_BUSY_SNAPSHOT` (517).
#[derive(Clone, Copy, Debug, Default)]
pub struct SqliteConflicts;

impl SqliteConflicts {
    pub fn is_conflict_code(code: &str) -> bool {
        code.parse::<i32>()
            .map(|code| matches!(code & 0xff, 5 | 6))
            .unwrap_or(false)
    }
}

impl ConflictClassifier for SqliteConflicts {
    fn is_conflict(&self, err: &sqlx::Error) -> bool {
        database_code(err).is_some_and(|code| Self::is_conflict_code(&code))
    }
}

/// Retry policy: optional attempt cap plus jittered exponential backoff.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    max_attempts: Option<u32>,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    /// Retry forever, immediately.
    pub fn unbounded() -> Self {
        Self {
            max_attempts: None,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            initial_backoff: config.initial_backoff(),
            max_backoff: config.max_backoff().max(config.initial_backoff()),
        }
    }

    /// Cap the number of attempts (values below 1 are treated as 1).
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts.max(1));
        self
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max.max(initial);
        self
    }

    pub fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }

    /// Delay before attempt `attempt + 1`, given `attempt` failed attempts.
    fn backoff(&self, attempt: u32) -> Duration {
        if self.initial_backoff.is_zero() {
            return Duration::ZERO;
        }
        let shift = attempt.saturating_sub(1).min(16);
        let ceiling = self
            .initial_backoff
            .saturating_mul(1u32 << shift)
            .min(self.max_backoff);
        let ceiling_nanos = u64::try_from(ceiling.as_nanos()).unwrap_or(u64::MAX);
        let jittered = rand::rng().random_range(ceiling_nanos / 2..=ceiling_nanos);
        Duration::from_nanos(jittered)
    }

    /// Run `unit` until it succeeds, fails with a non-conflict error, the
    /// context is interrupted, or the attempt cap is reached.
    ///
    /// `unit` must perform the whole transaction including the commit, so a
    /// conflict raised at any stage restarts it from scratch.
    pub async fn run<T, F, Fut>(
        &self,
        ctx: &OpContext,
        classifier: &dyn ConflictClassifier,
        operation: &'static str,
        mut unit: F,
    ) -> MetadataResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, sqlx::Error>>,
    {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match ctx.run(unit()).await? {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::debug!(
                            operation,
                            attempts = attempt,
                            "transaction committed after conflict retries"
                        );
                    }
                    return Ok(value);
                }
                Err(err) if classifier.is_conflict(&err) => {
                    metrics::TXN_CONFLICTS.with_label_values(&[operation]).inc();

                    if let Some(max_attempts) = self.max_attempts
                        && attempt >= max_attempts
                    {
                        metrics::TXN_RETRIES_EXHAUSTED
                            .with_label_values(&[operation])
                            .inc();
                        tracing::warn!(
                            operation,
                            attempts = attempt,
                            error = %err,
                            "transaction retries exhausted"
                        );
                        return Err(MetadataError::RetriesExhausted {
                            operation,
                            attempts: attempt,
                            source: err,
                        });
                    }

                    let delay = self.backoff(attempt);
                    tracing::debug!(
                        operation,
                        attempt,
                        delay_us = delay.as_micros() as u64,
                        error = %err,
                        "serialization conflict, restarting transaction"
                    );
                    if !delay.is_zero() {
                        ctx.run(tokio::time::sleep(delay)).await?;
                    }
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}
