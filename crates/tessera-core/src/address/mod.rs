//! Replica addressing
//!
//! The resolver that maps a request to a partition's replicas is external
//! ([`AddressResolver`]). This module consumes its answer: it filters the
//! replica list down to one wire protocol, splits primary from secondaries
//! ([`AddressSelector`]) and decides the order replicas are tried in
//! ([`enumerator`]).

pub mod enumerator;
pub mod selector;
pub mod uri;

pub use enumerator::{AddressEnumerator, RandomAddressEnumerator, RoundRobinAddressEnumerator};
pub use selector::AddressSelector;
pub use uri::{HealthSnapshot, HealthStatus, TransportAddressUri};

use crate::context::PartitionKeyRange;
use crate::error::Result;
use crate::request::{Protocol, ServiceRequest};
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// One replica as returned by address resolution
#[derive(Debug, Clone)]
pub struct AddressInformation {
    /// Endpoint, shared across resolutions so health survives refreshes
    pub uri: Arc<TransportAddressUri>,
    /// Replica is the partition's primary
    pub is_primary: bool,
    /// Endpoint is reachable from outside the service network
    pub is_public: bool,
    /// Wire protocol served at the endpoint
    pub protocol: Protocol,
}

impl AddressInformation {
    /// Internal secondary replica
    pub fn secondary(uri: Arc<TransportAddressUri>, protocol: Protocol) -> Self {
        Self {
            uri,
            is_primary: false,
            is_public: false,
            protocol,
        }
    }

    /// Internal primary replica
    pub fn primary(uri: Arc<TransportAddressUri>, protocol: Protocol) -> Self {
        Self {
            is_primary: true,
            ..Self::secondary(uri, protocol)
        }
    }
}

/// Resolution result for one partition
#[derive(Debug, Clone, Default)]
pub struct PartitionAddressInformation {
    /// Every replica, every protocol
    pub addresses: Vec<AddressInformation>,
    /// Range the request resolved to
    pub partition_key_range: Option<PartitionKeyRange>,
    /// Collection the request resolved to
    pub collection_rid: Option<String>,
}

impl PartitionAddressInformation {
    /// Replicas reachable over `protocol`; internal endpoints are preferred
    /// and public ones are used only when no internal endpoint exists
    pub fn for_protocol(&self, protocol: Protocol) -> PerProtocolAddressInformation {
        let usable = |public: bool| -> Vec<&AddressInformation> {
            self.addresses
                .iter()
                .filter(|a| a.protocol == protocol && a.is_public == public)
                .filter(|a| !a.uri.uri().is_empty())
                .collect()
        };

        let mut selected = usable(false);
        if selected.is_empty() {
            selected = usable(true);
        }

        PerProtocolAddressInformation {
            protocol,
            replicas: selected.iter().map(|a| a.uri.clone()).collect(),
            primary: selected
                .iter()
                .find(|a| a.is_primary)
                .map(|a| a.uri.clone()),
        }
    }
}

/// Replicas of one partition for one wire protocol
#[derive(Debug, Clone)]
pub struct PerProtocolAddressInformation {
    /// Protocol
    pub protocol: Protocol,
    /// All replicas in resolver order, primary included
    pub replicas: Vec<Arc<TransportAddressUri>>,
    /// Primary replica, if the resolver flagged one
    pub primary: Option<Arc<TransportAddressUri>>,
}

impl PerProtocolAddressInformation {
    /// Replicas other than the primary
    pub fn non_primary(&self) -> Vec<Arc<TransportAddressUri>> {
        self.replicas
            .iter()
            .filter(|r| {
                self.primary
                    .as_ref()
                    .is_none_or(|p| !Arc::ptr_eq(p, r) && p.uri() != r.uri())
            })
            .cloned()
            .collect()
    }
}

/// Maps a request to the replicas of its partition
#[async_trait]
pub trait AddressResolver: Send + Sync {
    /// Resolve the replicas serving `request`; `force_refresh` bypasses any
    /// cache
    async fn resolve(
        &self,
        request: &ServiceRequest,
        force_refresh: bool,
        cancel: &CancellationToken,
    ) -> Result<Arc<PartitionAddressInformation>>;

    /// Invalidate cached addresses pointing at one physical server
    async fn update(&self, server_key: &str);
}
