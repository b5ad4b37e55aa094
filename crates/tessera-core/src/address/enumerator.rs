//! Replica ordering for fan-out
//!
//! Both enumerators spread load across replicas and then apply the same
//! stable ordering on top: replicas that already failed for this request go
//! last, and with health validation enabled healthier replicas go first.

use super::uri::{HealthStatus, TransportAddressUri};
use rand::seq::SliceRandom;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Decides the order replicas are contacted in
pub trait AddressEnumerator: Send + Sync {
    /// Order `replicas` for one fan-out
    fn order(
        &self,
        replicas: &[Arc<TransportAddressUri>],
        failed_endpoints: &HashSet<String>,
        validate_health: bool,
    ) -> Vec<Arc<TransportAddressUri>>;
}

/// Uniformly shuffled order
#[derive(Debug, Default)]
pub struct RandomAddressEnumerator;

impl AddressEnumerator for RandomAddressEnumerator {
    fn order(
        &self,
        replicas: &[Arc<TransportAddressUri>],
        failed_endpoints: &HashSet<String>,
        validate_health: bool,
    ) -> Vec<Arc<TransportAddressUri>> {
        let mut ordered = replicas.to_vec();
        ordered.shuffle(&mut rand::thread_rng());
        rank(ordered, failed_endpoints, validate_health)
    }
}

/// Rotating start position, deterministic for tests
#[derive(Debug, Default)]
pub struct RoundRobinAddressEnumerator {
    next: AtomicUsize,
}

impl AddressEnumerator for RoundRobinAddressEnumerator {
    fn order(
        &self,
        replicas: &[Arc<TransportAddressUri>],
        failed_endpoints: &HashSet<String>,
        validate_health: bool,
    ) -> Vec<Arc<TransportAddressUri>> {
        let mut ordered = replicas.to_vec();
        if !ordered.is_empty() {
            let start = self.next.fetch_add(1, Ordering::Relaxed) % ordered.len();
            ordered.rotate_left(start);
        }
        rank(ordered, failed_endpoints, validate_health)
    }
}

fn rank(
    mut ordered: Vec<Arc<TransportAddressUri>>,
    failed_endpoints: &HashSet<String>,
    validate_health: bool,
) -> Vec<Arc<TransportAddressUri>> {
    ordered.sort_by_key(|replica| {
        let failed = failed_endpoints.contains(replica.uri());
        let health = if validate_health {
            match replica.effective_status() {
                HealthStatus::Connected | HealthStatus::Unknown => 0,
                HealthStatus::UnhealthyPending => 1,
                HealthStatus::Unhealthy => 2,
            }
        } else {
            0
        };
        (failed, health)
    });
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;

    fn replicas(n: usize) -> Vec<Arc<TransportAddressUri>> {
        (0..n)
            .map(|i| Arc::new(TransportAddressUri::new(format!("rntbd://r{}/", i))))
            .collect()
    }

    fn uris(ordered: &[Arc<TransportAddressUri>]) -> Vec<&str> {
        ordered.iter().map(|r| r.uri()).collect()
    }

    #[test]
    fn test_round_robin_rotates() {
        let enumerator = RoundRobinAddressEnumerator::default();
        let replicas = replicas(3);
        let none = HashSet::new();
        assert_eq!(
            uris(&enumerator.order(&replicas, &none, false)),
            vec!["rntbd://r0/", "rntbd://r1/", "rntbd://r2/"]
        );
        assert_eq!(
            uris(&enumerator.order(&replicas, &none, false)),
            vec!["rntbd://r1/", "rntbd://r2/", "rntbd://r0/"]
        );
    }

    #[tokio::test]
    async fn test_failed_and_unhealthy_go_last() {
        let enumerator = RoundRobinAddressEnumerator::default();
        let replicas = replicas(4);
        replicas[0].set_unhealthy();
        replicas[1].set_unhealthy();
        replicas[1].set_refreshed_if_unhealthy();
        let failed: HashSet<String> = ["rntbd://r2/".to_string()].into_iter().collect();

        let ordered = enumerator.order(&replicas, &failed, true);
        assert_eq!(
            uris(&ordered),
            vec!["rntbd://r3/", "rntbd://r1/", "rntbd://r0/", "rntbd://r2/"]
        );

        // Without validation only the failed endpoint moves
        let enumerator = RoundRobinAddressEnumerator::default();
        let ordered = enumerator.order(&replicas, &failed, false);
        assert_eq!(
            uris(&ordered),
            vec!["rntbd://r0/", "rntbd://r1/", "rntbd://r3/", "rntbd://r2/"]
        );
    }

    #[test]
    fn test_random_keeps_every_replica() {
        let replicas = replicas(5);
        let failed: HashSet<String> = ["rntbd://r4/".to_string()].into_iter().collect();
        let ordered = RandomAddressEnumerator.order(&replicas, &failed, true);
        assert_eq!(ordered.len(), 5);
        assert_eq!(ordered[4].uri(), "rntbd://r4/");
    }
}
