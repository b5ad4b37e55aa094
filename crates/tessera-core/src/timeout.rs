//! Per-request wall-clock budget

use crate::error::{Error, Result};
use std::time::Duration;
use tessera_protocol::SubStatusCode;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Deadline computed once per logical request
///
/// Clones share the deadline and the cancellation token, so no amount of
/// internal retrying extends the budget.
#[derive(Debug, Clone)]
pub struct TimeoutHelper {
    timeout: Duration,
    deadline: Instant,
    cancel: CancellationToken,
}

impl TimeoutHelper {
    /// Start a budget of `timeout` from now
    pub fn new(timeout: Duration, cancel: CancellationToken) -> Self {
        Self {
            timeout,
            deadline: Instant::now() + timeout,
            cancel,
        }
    }

    /// Total budget
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Time left before the deadline
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// True once the deadline passed
    pub fn is_elapsed(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Cancellation token threaded through the request
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Fail with Cancelled or a timeout-generated Gone once the request can
    /// no longer make progress
    pub fn throw_gone_if_elapsed(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if self.is_elapsed() {
            return Err(Error::gone(
                SubStatusCode::TIMEOUT_GENERATED_410,
                format!("Request timeout of {:?} elapsed", self.timeout),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_budget_elapses() {
        let helper = TimeoutHelper::new(Duration::from_secs(2), CancellationToken::new());
        assert!(helper.throw_gone_if_elapsed().is_ok());

        tokio::time::advance(Duration::from_millis(1500)).await;
        assert_eq!(helper.remaining(), Duration::from_millis(500));

        tokio::time::advance(Duration::from_millis(600)).await;
        let err = helper.throw_gone_if_elapsed().unwrap_err();
        assert_eq!(err.sub_status(), SubStatusCode::TIMEOUT_GENERATED_410);
        assert_eq!(helper.remaining(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_cancellation_wins() {
        let cancel = CancellationToken::new();
        let helper = TimeoutHelper::new(Duration::from_secs(60), cancel.clone());
        cancel.cancel();
        assert!(matches!(helper.throw_gone_if_elapsed(), Err(Error::Cancelled)));
    }
}
