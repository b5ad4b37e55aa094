//! Retry orchestration for transient failures
//!
//! One executor drives every policy: run the operation, ask the policy what
//! to do with the error, wait, run again. The policy sees the mutable state
//! the operation runs on (the request, for Gone retries) so it can ask for an
//! address refresh on the next attempt.
//!
//! During a long backoff the executor can race an alternate operation (an
//! eventual read in another region) against the timer and return the
//! alternate's result when it succeeds first and the policy accepts it.

mod gone_only;
mod session_mismatch;

pub use gone_only::GoneOnlyRequestRetryPolicy;
pub use session_mismatch::SessionTokenMismatchRetryPolicy;

use crate::error::{Error, Result};
use futures::future::BoxFuture;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// What to do after a failed attempt
#[derive(Debug)]
pub enum RetryDecision {
    /// Give up with the error, or with a replacement error
    NoRetry(Option<Error>),
    /// Run again after the delay; zero means immediately
    RetryAfter(Duration),
}

/// Decides whether a failed attempt is retried
pub trait RetryPolicy<S: ?Sized>: Send {
    /// Inspect `error`; `state` is what the next attempt will run on
    fn should_retry(&mut self, error: &Error, state: &mut S) -> RetryDecision;

    /// Whether a successful in-backoff alternate may end the run
    ///
    /// A rejected alternate is discarded and the backoff runs to completion.
    fn accepts_alternate(&mut self, _state: &mut S) -> bool {
        true
    }
}

/// Operation raced against a backoff
pub type AlternateOperation<'a, T> = Box<dyn FnMut() -> BoxFuture<'a, Result<T>> + Send + 'a>;

/// Retry statistics
#[derive(Debug, Clone, Default)]
pub struct RetryStats {
    /// Attempts made, the first one included
    pub total_attempts: u32,
    /// Time spent waiting between attempts
    pub total_backoff: Duration,
    /// Alternate operations started
    pub alternate_attempts: u32,
}

/// Runs an operation until it succeeds or its policy gives up
pub struct RetryExecutor<'a, T> {
    alternate: Option<(AlternateOperation<'a, T>, Duration)>,
    cancel: CancellationToken,
    stats: RetryStats,
}

impl<'a, T> RetryExecutor<'a, T> {
    /// Executor stopping when `cancel` fires
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            alternate: None,
            cancel,
            stats: RetryStats::default(),
        }
    }

    /// Race `alternate` against every backoff of at least `min_backoff`
    pub fn with_in_backoff_alternate(
        mut self,
        alternate: AlternateOperation<'a, T>,
        min_backoff: Duration,
    ) -> Self {
        self.alternate = Some((alternate, min_backoff));
        self
    }

    /// Statistics of the runs so far
    pub fn stats(&self) -> &RetryStats {
        &self.stats
    }

    /// Run `operation` on `state` under `policy`
    pub async fn execute<S, P>(
        &mut self,
        state: &mut S,
        policy: &mut P,
        mut operation: impl AsyncFnMut(&mut S) -> Result<T>,
    ) -> Result<T>
    where
        S: ?Sized,
        P: RetryPolicy<S> + ?Sized,
    {
        loop {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            self.stats.total_attempts += 1;

            let error = match operation(&mut *state).await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            let backoff = match policy.should_retry(&error, state) {
                RetryDecision::NoRetry(replacement) => {
                    let error = replacement.unwrap_or(error);
                    tracing::debug!(
                        "Giving up after {} attempts: {}",
                        self.stats.total_attempts,
                        error
                    );
                    return Err(error);
                }
                RetryDecision::RetryAfter(backoff) => backoff,
            };
            tracing::debug!(
                "Attempt {} failed with {}/{}, retrying in {:?}",
                self.stats.total_attempts,
                error.status_code(),
                error.sub_status(),
                backoff
            );

            let started = Instant::now();
            let sleep = tokio::time::sleep(backoff);
            tokio::pin!(sleep);

            if let Some((alternate, min_backoff)) = self.alternate.as_mut() {
                if backoff >= *min_backoff {
                    self.stats.alternate_attempts += 1;
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                        outcome = alternate() => match outcome {
                            Ok(value) if policy.accepts_alternate(state) => {
                                tracing::debug!("In-backoff alternate completed first");
                                self.stats.total_backoff += started.elapsed();
                                return Ok(value);
                            }
                            Ok(_) => tracing::debug!("In-backoff alternate rejected by policy"),
                            Err(e) => tracing::debug!("In-backoff alternate failed: {}", e),
                        },
                        _ = &mut sleep => {}
                    }
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                _ = &mut sleep => {}
            }
            self.stats.total_backoff += started.elapsed();
        }
    }
}
