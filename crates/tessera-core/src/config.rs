//! Direct-mode configuration

use crate::request::Protocol;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tessera_protocol::ConsistencyLevel;

/// Backoff for the session-mismatch retry policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionRetryOptions {
    /// First non-immediate backoff
    #[serde(with = "serde_millis")]
    pub initial_backoff: Duration,
    /// Backoff cap
    #[serde(with = "serde_millis")]
    pub max_backoff: Duration,
    /// Wall-clock budget for all retries of one request
    #[serde(with = "serde_millis")]
    pub budget: Duration,
}

impl Default for SessionRetryOptions {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(500),
            budget: Duration::from_millis(5000),
        }
    }
}

/// Backoff for the Gone retry policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GoneRetryOptions {
    /// First backoff
    #[serde(with = "serde_millis")]
    pub initial_backoff: Duration,
    /// Backoff cap
    #[serde(with = "serde_millis")]
    pub max_backoff: Duration,
    /// Wall-clock budget for all retries of one request
    #[serde(with = "serde_millis")]
    pub retry_timeout: Duration,
}

impl Default for GoneRetryOptions {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(15),
            retry_timeout: Duration::from_secs(30),
        }
    }
}

/// Direct-mode configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectConfig {
    /// Wire protocol replicas are reached with
    pub protocol: Protocol,

    /// Default consistency of the account
    pub account_consistency: ConsistencyLevel,

    /// Account accepts writes in more than one region
    pub use_multiple_write_locations: bool,

    /// Strong consistency spans regions (global-strong barriers)
    pub global_strong_enabled: bool,

    /// Replicas per partition
    pub max_replica_set_size: usize,

    /// Budget of one logical request including retries
    #[serde(with = "serde_millis")]
    pub request_timeout: Duration,

    /// Budget of one replica call
    #[serde(with = "serde_millis")]
    pub replica_request_timeout: Duration,

    /// Quorum read attempts per request
    pub max_read_quorum_retries: u32,

    /// Read barrier polls
    pub max_read_barrier_retries: u32,

    /// Delay between read barrier polls
    #[serde(with = "serde_millis")]
    pub read_barrier_delay: Duration,

    /// Primary barrier polls when the primary lags its quorum
    pub max_primary_read_retries: u32,

    /// Global-strong barrier polls (reads and writes)
    pub max_global_strong_barrier_retries: u32,

    /// Delay between global-strong barrier polls
    #[serde(with = "serde_millis")]
    pub global_strong_barrier_delay: Duration,

    /// Delay used for the last polls of a global-strong barrier
    #[serde(with = "serde_millis")]
    pub global_strong_short_barrier_delay: Duration,

    /// Number of final polls using the short delay
    pub global_strong_short_barrier_retries: u32,

    /// Route Strong and BoundedStaleness reads through the quorum reader.
    /// When off, every read that is not pinned to a replica reads one replica.
    pub quorum_reads_enabled: bool,

    /// Order replicas by health before fan-out
    pub replica_address_validation: bool,

    /// Prefer region-local LSN headers when a replica returns them
    pub use_local_lsn_headers: bool,

    /// Session-mismatch retry policy
    pub session_retry: SessionRetryOptions,

    /// Gone retry policy
    pub gone_retry: GoneRetryOptions,

    /// Race an eventual read in another region during long Gone backoffs
    pub enable_read_request_fallback: bool,

    /// Minimum backoff that triggers the alternate read
    #[serde(with = "serde_millis")]
    pub in_backoff_fallback_threshold: Duration,
}

impl Default for DirectConfig {
    fn default() -> Self {
        Self {
            protocol: Protocol::Rntbd,
            account_consistency: ConsistencyLevel::Session,
            use_multiple_write_locations: false,
            global_strong_enabled: false,
            max_replica_set_size: 4,
            request_timeout: Duration::from_secs(30),
            replica_request_timeout: Duration::from_secs(10),
            max_read_quorum_retries: 6,
            max_read_barrier_retries: 6,
            read_barrier_delay: Duration::from_millis(5),
            max_primary_read_retries: 6,
            max_global_strong_barrier_retries: 30,
            global_strong_barrier_delay: Duration::from_millis(30),
            global_strong_short_barrier_delay: Duration::from_millis(10),
            global_strong_short_barrier_retries: 4,
            quorum_reads_enabled: true,
            replica_address_validation: true,
            use_local_lsn_headers: true,
            session_retry: SessionRetryOptions::default(),
            gone_retry: GoneRetryOptions::default(),
            enable_read_request_fallback: false,
            in_backoff_fallback_threshold: Duration::from_secs(1),
        }
    }
}

impl DirectConfig {
    /// Configuration of a single-region Strong account
    pub fn strong() -> Self {
        Self {
            account_consistency: ConsistencyLevel::Strong,
            ..Default::default()
        }
    }

    /// Configuration of a multi-region Strong account
    pub fn global_strong() -> Self {
        Self {
            account_consistency: ConsistencyLevel::Strong,
            global_strong_enabled: true,
            ..Default::default()
        }
    }

    /// Set the account consistency
    pub fn with_account_consistency(mut self, level: ConsistencyLevel) -> Self {
        self.account_consistency = level;
        self
    }

    /// Set the wire protocol
    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    /// Enable/disable multi-region writes
    pub fn with_multiple_write_locations(mut self, enabled: bool) -> Self {
        self.use_multiple_write_locations = enabled;
        self
    }

    /// Set the replica set size
    pub fn with_max_replica_set_size(mut self, size: usize) -> Self {
        self.max_replica_set_size = size;
        self
    }

    /// Set the request budget
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the per-replica budget
    pub fn with_replica_request_timeout(mut self, timeout: Duration) -> Self {
        self.replica_request_timeout = timeout;
        self
    }

    /// Enable/disable quorum reads
    pub fn with_quorum_reads(mut self, enabled: bool) -> Self {
        self.quorum_reads_enabled = enabled;
        self
    }

    /// Set the session-mismatch retry options
    pub fn with_session_retry(mut self, options: SessionRetryOptions) -> Self {
        self.session_retry = options;
        self
    }

    /// Set the Gone retry options
    pub fn with_gone_retry(mut self, options: GoneRetryOptions) -> Self {
        self.gone_retry = options;
        self
    }

    /// Enable/disable the alternate read during Gone backoffs
    pub fn with_read_request_fallback(mut self, enabled: bool) -> Self {
        self.enable_read_request_fallback = enabled;
        self
    }

    /// Read quorum of a full replica set
    pub fn read_quorum(&self) -> usize {
        self.max_replica_set_size - self.max_replica_set_size / 2
    }

    /// Delay after global-strong barrier poll `attempt` (zero based)
    pub fn global_strong_barrier_delay_for(&self, attempt: u32) -> Duration {
        let fast_polls = self
            .max_global_strong_barrier_retries
            .saturating_sub(self.global_strong_short_barrier_retries);
        if attempt < fast_polls {
            self.global_strong_barrier_delay
        } else {
            self.global_strong_short_barrier_delay
        }
    }

    /// Parse a JSON document; absent fields keep their defaults
    pub fn from_json_str(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    /// Defaults overlaid with `TESSERA_*` environment variables
    pub fn from_env() -> Self {
        Self::default().overlay_env(|key| std::env::var(key).ok())
    }

    /// Overlay values looked up by environment variable name
    pub fn overlay_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let flag = |key: &str, current: bool| {
            lookup(key)
                .and_then(|v| v.trim().parse::<bool>().ok())
                .unwrap_or(current)
        };
        let millis = |key: &str, current: Duration| {
            lookup(key)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_millis)
                .unwrap_or(current)
        };

        if let Some(protocol) = lookup("TESSERA_PROTOCOL") {
            match protocol.trim().to_ascii_lowercase().as_str() {
                "rntbd" => self.protocol = Protocol::Rntbd,
                "https" => self.protocol = Protocol::Https,
                other => tracing::warn!("Ignoring unknown TESSERA_PROTOCOL {}", other),
            }
        }
        if let Some(level) = lookup("TESSERA_ACCOUNT_CONSISTENCY") {
            match level.parse::<ConsistencyLevel>() {
                Ok(level) => self.account_consistency = level,
                Err(e) => tracing::warn!("Ignoring TESSERA_ACCOUNT_CONSISTENCY: {}", e),
            }
        }
        if let Some(size) = lookup("TESSERA_MAX_REPLICA_SET_SIZE").and_then(|v| v.trim().parse().ok()) {
            self.max_replica_set_size = size;
        }

        self.use_multiple_write_locations = flag(
            "TESSERA_USE_MULTIPLE_WRITE_LOCATIONS",
            self.use_multiple_write_locations,
        );
        self.global_strong_enabled = flag("TESSERA_GLOBAL_STRONG_ENABLED", self.global_strong_enabled);
        self.quorum_reads_enabled = flag("TESSERA_QUORUM_READS_ENABLED", self.quorum_reads_enabled);
        self.enable_read_request_fallback = flag(
            "TESSERA_ENABLE_READ_REQUEST_FALLBACK",
            self.enable_read_request_fallback,
        );
        self.request_timeout = millis("TESSERA_REQUEST_TIMEOUT_MS", self.request_timeout);
        self.replica_request_timeout = millis(
            "TESSERA_REPLICA_REQUEST_TIMEOUT_MS",
            self.replica_request_timeout,
        );
        self.session_retry.budget = millis(
            "TESSERA_SESSION_TOKEN_MISMATCH_RETRY_WAIT_MS",
            self.session_retry.budget,
        );
        self.session_retry.initial_backoff = millis(
            "TESSERA_SESSION_TOKEN_MISMATCH_INITIAL_BACKOFF_MS",
            self.session_retry.initial_backoff,
        );
        self.session_retry.max_backoff = millis(
            "TESSERA_SESSION_TOKEN_MISMATCH_MAX_BACKOFF_MS",
            self.session_retry.max_backoff,
        );

        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.max_replica_set_size == 0 {
            return Err("max_replica_set_size must be at least 1".into());
        }

        if self.request_timeout.is_zero() {
            return Err("request_timeout must be positive".into());
        }

        if self.replica_request_timeout.is_zero() {
            return Err("replica_request_timeout must be positive".into());
        }

        if self.max_read_quorum_retries == 0 {
            return Err("max_read_quorum_retries must be at least 1".into());
        }

        if self.global_strong_short_barrier_retries > self.max_global_strong_barrier_retries {
            return Err(
                "global_strong_short_barrier_retries cannot exceed max_global_strong_barrier_retries"
                    .into(),
            );
        }

        if self.session_retry.initial_backoff > self.session_retry.max_backoff {
            return Err("session_retry.initial_backoff cannot exceed max_backoff".into());
        }

        if self.gone_retry.initial_backoff > self.gone_retry.max_backoff {
            return Err("gone_retry.initial_backoff cannot exceed max_backoff".into());
        }

        if self.global_strong_enabled && self.account_consistency != ConsistencyLevel::Strong {
            tracing::debug!(
                "global_strong_enabled has no effect on a {} account",
                self.account_consistency
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = DirectConfig::default();
        assert_eq!(config.account_consistency, ConsistencyLevel::Session);
        assert_eq!(config.read_quorum(), 2);
        assert_eq!(config.session_retry.budget, Duration::from_millis(5000));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_read_quorum_rounds_up() {
        assert_eq!(DirectConfig::default().with_max_replica_set_size(3).read_quorum(), 2);
        assert_eq!(DirectConfig::default().with_max_replica_set_size(5).read_quorum(), 3);
        assert_eq!(DirectConfig::default().with_max_replica_set_size(1).read_quorum(), 1);
    }

    #[test]
    fn test_two_speed_barrier_schedule() {
        let config = DirectConfig::global_strong();
        let slow = (0..30)
            .filter(|a| config.global_strong_barrier_delay_for(*a) == Duration::from_millis(30))
            .count();
        assert_eq!(slow, 26);
        assert_eq!(
            config.global_strong_barrier_delay_for(29),
            Duration::from_millis(10)
        );
    }

    #[test]
    fn test_json_uses_milliseconds_and_defaults() {
        let config = DirectConfig::from_json_str(
            r#"{"account_consistency":"Strong","request_timeout":2500,"session_retry":{"budget":200}}"#,
        )
        .unwrap();
        assert_eq!(config.account_consistency, ConsistencyLevel::Strong);
        assert_eq!(config.request_timeout, Duration::from_millis(2500));
        assert_eq!(config.session_retry.budget, Duration::from_millis(200));
        assert_eq!(config.session_retry.max_backoff, Duration::from_millis(500));
        assert_eq!(config.max_replica_set_size, 4);
    }

    #[test]
    fn test_env_overlay() {
        let vars: HashMap<&str, &str> = [
            ("TESSERA_SESSION_TOKEN_MISMATCH_RETRY_WAIT_MS", "750"),
            ("TESSERA_PROTOCOL", "HTTPS"),
            ("TESSERA_QUORUM_READS_ENABLED", "false"),
            ("TESSERA_ACCOUNT_CONSISTENCY", "nonsense"),
        ]
        .into_iter()
        .collect();
        let config =
            DirectConfig::default().overlay_env(|key| vars.get(key).map(|v| v.to_string()));
        assert_eq!(config.session_retry.budget, Duration::from_millis(750));
        assert_eq!(config.protocol, Protocol::Https);
        assert!(!config.quorum_reads_enabled);
        assert_eq!(config.account_consistency, ConsistencyLevel::Session);
    }

    #[test]
    fn test_validation() {
        let config = DirectConfig::default().with_max_replica_set_size(0);
        assert!(config.validate().is_err());

        let config = DirectConfig::default().with_session_retry(SessionRetryOptions {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_millis(10),
            budget: Duration::from_secs(5),
        });
        assert!(config.validate().is_err());
    }
}
