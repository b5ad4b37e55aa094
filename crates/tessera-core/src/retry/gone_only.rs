//! Retries of requests whose replicas moved

use super::{RetryDecision, RetryPolicy};
use crate::config::GoneRetryOptions;
use crate::error::Error;
use crate::request::ServiceRequest;
use std::time::Duration;
use tessera_protocol::SubStatusCode;
use tokio::time::Instant;

/// Retries Gone failures with exponential backoff
///
/// Every retry forces the next attempt to refresh its addresses; split and
/// migration sub-statuses also force a partition key range refresh. A Gone
/// raised because the request budget ran out is not retried. Whatever ends
/// the retries surfaces as ServiceUnavailable with the original sub-status.
#[derive(Debug)]
pub struct GoneOnlyRequestRetryPolicy {
    options: GoneRetryOptions,
    started: Instant,
    retry_count: u32,
    current_backoff: Duration,
}

impl GoneOnlyRequestRetryPolicy {
    /// Create a policy whose retry timeout starts now
    pub fn new(options: GoneRetryOptions) -> Self {
        Self {
            current_backoff: options.initial_backoff,
            options,
            started: Instant::now(),
            retry_count: 0,
        }
    }
}

impl RetryPolicy<ServiceRequest> for GoneOnlyRequestRetryPolicy {
    fn should_retry(&mut self, error: &Error, request: &mut ServiceRequest) -> RetryDecision {
        if !error.is_gone() {
            return RetryDecision::NoRetry(None);
        }

        let sub_status = error.sub_status();
        if sub_status == SubStatusCode::TIMEOUT_GENERATED_410 {
            return RetryDecision::NoRetry(Some(error.clone().into_service_unavailable()));
        }

        let remaining = self
            .options
            .retry_timeout
            .saturating_sub(self.started.elapsed());
        if remaining.is_zero() {
            tracing::warn!(
                "Gone retries for {} exhausted after {} attempts ({})",
                request.resource_address,
                self.retry_count,
                sub_status
            );
            return RetryDecision::NoRetry(Some(error.clone().into_service_unavailable()));
        }

        let backoff = if self.retry_count == 0 {
            Duration::ZERO
        } else {
            let backoff = self.current_backoff.min(remaining);
            self.current_backoff = (self.current_backoff * 2).min(self.options.max_backoff);
            backoff
        };
        self.retry_count += 1;

        request.context.force_refresh_address_cache = true;
        if matches!(
            sub_status,
            SubStatusCode::PARTITION_KEY_RANGE_GONE
                | SubStatusCode::COMPLETING_SPLIT
                | SubStatusCode::COMPLETING_PARTITION_MIGRATION
        ) {
            request.context.force_partition_key_range_refresh = true;
        }

        tracing::debug!(
            "Gone {} on {}, retry {} in {:?}",
            sub_status,
            request.resource_address,
            self.retry_count,
            backoff
        );
        RetryDecision::RetryAfter(backoff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{OperationType, ResourceType};
    use tessera_protocol::StatusCode;

    fn request() -> ServiceRequest {
        ServiceRequest::new(OperationType::Read, ResourceType::Document, "dbs/d/colls/c/docs/1")
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_and_refresh_flags() {
        let mut policy = GoneOnlyRequestRetryPolicy::new(GoneRetryOptions::default());
        let mut request = request();

        let mut delays = Vec::new();
        for _ in 0..6 {
            match policy.should_retry(
                &Error::gone(SubStatusCode::UNKNOWN, "moved"),
                &mut request,
            ) {
                RetryDecision::RetryAfter(backoff) => delays.push(backoff.as_secs()),
                RetryDecision::NoRetry(_) => panic!("expected a retry"),
            }
        }
        assert_eq!(delays, vec![0, 1, 2, 4, 8, 15]);
        assert!(request.context.force_refresh_address_cache);
        assert!(!request.context.force_partition_key_range_refresh);

        policy.should_retry(
            &Error::gone(SubStatusCode::COMPLETING_SPLIT, "splitting"),
            &mut request,
        );
        assert!(request.context.force_partition_key_range_refresh);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_keeps_sub_status() {
        let mut policy = GoneOnlyRequestRetryPolicy::new(GoneRetryOptions {
            retry_timeout: Duration::from_secs(2),
            ..Default::default()
        });
        tokio::time::advance(Duration::from_secs(3)).await;

        let decision = policy.should_retry(
            &Error::gone(SubStatusCode::READ_QUORUM_NOT_MET, "no quorum"),
            &mut request(),
        );
        let RetryDecision::NoRetry(Some(error)) = decision else {
            panic!("expected a replacement error");
        };
        assert_eq!(error.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(error.sub_status(), SubStatusCode::READ_QUORUM_NOT_MET);
    }

    #[tokio::test(start_paused = true)]
    async fn test_elapsed_request_budget_is_not_retried() {
        let mut policy = GoneOnlyRequestRetryPolicy::new(GoneRetryOptions::default());
        let decision = policy.should_retry(
            &Error::gone(SubStatusCode::TIMEOUT_GENERATED_410, "budget spent"),
            &mut request(),
        );
        let RetryDecision::NoRetry(Some(error)) = decision else {
            panic!("expected a replacement error");
        };
        assert_eq!(error.status_code(), StatusCode::SERVICE_UNAVAILABLE);

        let decision = policy.should_retry(
            &Error::not_found(SubStatusCode::UNKNOWN, "missing"),
            &mut request(),
        );
        assert!(matches!(decision, RetryDecision::NoRetry(None)));
    }
}
