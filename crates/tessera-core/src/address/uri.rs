//! Replica endpoints and their health
//!
//! Health lives in an [`ArcSwap`] holding an immutable [`HealthSnapshot`].
//! Every transition builds a new snapshot from the one it observed and
//! swaps it in with compare-and-swap, retrying if another task got there
//! first. A transition that is not allowed from the observed state is a
//! no-op, so a stale updater can never overwrite a newer state it did not
//! see.

use arc_swap::ArcSwap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// How long Unknown / UnhealthyPending keep their penalty
const HEALTH_STATUS_STALENESS: Duration = Duration::from_secs(60);

/// Health state of one replica endpoint, ordered from best to worst
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HealthStatus {
    /// Last request succeeded
    Connected,
    /// Never contacted, or the connection state was lost
    Unknown,
    /// Was unhealthy; address resolution has since confirmed the endpoint
    UnhealthyPending,
    /// Last request failed
    Unhealthy,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Immutable health state with transition timestamps
#[derive(Debug, Clone)]
pub struct HealthSnapshot {
    /// Current state
    pub status: HealthStatus,
    /// When `status` was entered
    pub since: Instant,
    /// Last time the endpoint became Unhealthy
    pub last_unhealthy: Option<Instant>,
}

impl HealthSnapshot {
    fn enter(&self, status: HealthStatus) -> Self {
        let now = Instant::now();
        Self {
            status,
            since: now,
            last_unhealthy: if status == HealthStatus::Unhealthy {
                Some(now)
            } else {
                self.last_unhealthy
            },
        }
    }
}

/// Replica endpoint shared by every request routed to it
pub struct TransportAddressUri {
    uri: String,
    health: ArcSwap<HealthSnapshot>,
}

impl TransportAddressUri {
    /// New endpoint in the Unknown state
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            health: ArcSwap::from_pointee(HealthSnapshot {
                status: HealthStatus::Unknown,
                since: Instant::now(),
                last_unhealthy: None,
            }),
        }
    }

    /// Endpoint URI
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Current snapshot
    pub fn health(&self) -> Arc<HealthSnapshot> {
        self.health.load_full()
    }

    /// Current raw status
    pub fn status(&self) -> HealthStatus {
        self.health.load().status
    }

    /// Status used for ordering: Unknown and UnhealthyPending lose their
    /// penalty once they are older than a minute
    pub fn effective_status(&self) -> HealthStatus {
        let snapshot = self.health.load();
        match snapshot.status {
            HealthStatus::Unknown | HealthStatus::UnhealthyPending
                if snapshot.since.elapsed() > HEALTH_STATUS_STALENESS =>
            {
                HealthStatus::Connected
            }
            status => status,
        }
    }

    /// True when the endpoint has been Unhealthy for over a minute and
    /// deserves a fresh address lookup
    pub fn should_refresh_health_status(&self) -> bool {
        let snapshot = self.health.load();
        snapshot.status == HealthStatus::Unhealthy
            && snapshot.since.elapsed() > HEALTH_STATUS_STALENESS
    }

    /// A request succeeded
    pub fn set_connected(&self) -> bool {
        self.transition(|s| {
            (s.status != HealthStatus::Connected).then(|| s.enter(HealthStatus::Connected))
        })
    }

    /// The connection was closed without the replica being at fault
    pub fn set_unknown(&self) -> bool {
        self.transition(|s| {
            (s.status == HealthStatus::Connected).then(|| s.enter(HealthStatus::Unknown))
        })
    }

    /// A request failed
    pub fn set_unhealthy(&self) -> bool {
        let changed = self.transition(|s| {
            (s.status != HealthStatus::Unhealthy).then(|| s.enter(HealthStatus::Unhealthy))
        });
        if changed {
            tracing::debug!("Replica {} marked unhealthy", self.uri);
        }
        changed
    }

    /// Address resolution returned this endpoint again; an Unhealthy
    /// endpoint becomes UnhealthyPending, any other state is kept
    pub fn set_refreshed_if_unhealthy(&self) -> bool {
        self.transition(|s| {
            (s.status == HealthStatus::Unhealthy).then(|| s.enter(HealthStatus::UnhealthyPending))
        })
    }

    fn transition(&self, next: impl Fn(&HealthSnapshot) -> Option<HealthSnapshot>) -> bool {
        let mut current = self.health.load_full();
        loop {
            let Some(candidate) = next(&current) else {
                return false;
            };
            let previous = self.health.compare_and_swap(&current, Arc::new(candidate));
            if Arc::ptr_eq(&previous, &current) {
                return true;
            }
            current = arc_swap::Guard::into_inner(previous);
        }
    }
}

impl fmt::Debug for TransportAddressUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportAddressUri")
            .field("uri", &self.uri)
            .field("status", &self.status())
            .finish()
    }
}

impl fmt::Display for TransportAddressUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.uri, self.status())
    }
}
