//! Retries of reads whose replicas have not caught up with the session

use super::{RetryDecision, RetryPolicy};
use crate::config::SessionRetryOptions;
use crate::error::Error;
use std::time::Duration;
use tokio::time::Instant;

/// Retries 404/ReadSessionNotAvailable within a wall-clock budget
///
/// The first retry is immediate; later ones back off exponentially from
/// `initial_backoff` up to `max_backoff`, never past the end of the budget.
/// The budget starts when the policy is created.
#[derive(Debug)]
pub struct SessionTokenMismatchRetryPolicy {
    options: SessionRetryOptions,
    started: Instant,
    retry_count: u32,
    current_backoff: Duration,
}

impl SessionTokenMismatchRetryPolicy {
    /// Create a policy whose budget starts now
    pub fn new(options: SessionRetryOptions) -> Self {
        Self {
            current_backoff: options.initial_backoff,
            options,
            started: Instant::now(),
            retry_count: 0,
        }
    }

    /// Retries granted so far
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }
}

impl<S: ?Sized> RetryPolicy<S> for SessionTokenMismatchRetryPolicy {
    fn should_retry(&mut self, error: &Error, _state: &mut S) -> RetryDecision {
        if !error.is_read_session_not_available() {
            return RetryDecision::NoRetry(None);
        }

        let elapsed = self.started.elapsed();
        if elapsed >= self.options.budget {
            tracing::debug!(
                "Session token mismatch budget of {:?} spent after {} retries",
                self.options.budget,
                self.retry_count
            );
            return RetryDecision::NoRetry(None);
        }

        let backoff = if self.retry_count == 0 {
            Duration::ZERO
        } else {
            let remaining = self.options.budget - elapsed;
            let backoff = self.current_backoff.min(remaining);
            self.current_backoff = (self.current_backoff * 2).min(self.options.max_backoff);
            backoff
        };
        self.retry_count += 1;
        RetryDecision::RetryAfter(backoff)
    }
}
