//! Operation context carrying cancellation and deadlines.

use crate::error::{MetadataError, MetadataResult};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Per-call context.
///
/// Work run through [`OpContext::run`] is dropped as soon as the token is
/// cancelled or the deadline passes. Dropping an uncommitted sqlx transaction
/// rolls it back, so an interrupted protocol call never leaves partial state.
#[derive(Clone, Debug, Default)]
pub struct OpContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl OpContext {
    /// A context that is never cancelled and has no deadline.
    pub fn new() -> Self {
        Self::default()
    }

    /// A context cancelled together with `token`.
    pub fn with_cancellation(token: CancellationToken) -> Self {
        Self {
            cancel: token,
            deadline: None,
        }
    }

    /// Add a timeout relative to now. An earlier existing deadline wins.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Add an absolute deadline. An earlier existing deadline wins.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        self
    }

    /// A child context: cancelled with this one, cancellable on its own.
    pub fn child(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            deadline: self.deadline,
        }
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Fail fast if the context is already interrupted.
    pub fn check(&self) -> MetadataResult<()> {
        if self.cancel.is_cancelled() {
            return Err(MetadataError::Cancelled);
        }
        if let Some(deadline) = self.deadline
            && Instant::now() >= deadline
        {
            return Err(MetadataError::DeadlineExceeded);
        }
        Ok(())
    }

    /// Drive `fut` to completion unless the context is interrupted first.
    pub async fn run<F: Future>(&self, fut: F) -> MetadataResult<F::Output> {
        self.check()?;

        let deadline = self.deadline;
        let expired = async move {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(MetadataError::Cancelled),
            _ = expired => Err(MetadataError::DeadlineExceeded),
            output = fut => Ok(output),
        }
    }
}
