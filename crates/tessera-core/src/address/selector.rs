//! Address selection on top of the external resolver

use super::uri::TransportAddressUri;
use super::{AddressResolver, PerProtocolAddressInformation};
use crate::error::{Error, Result};
use crate::request::{Protocol, ServiceRequest};
use std::sync::Arc;
use tessera_protocol::SubStatusCode;
use tokio_util::sync::CancellationToken;

/// Resolves a request to replica endpoints of one wire protocol
#[derive(Clone)]
pub struct AddressSelector {
    resolver: Arc<dyn AddressResolver>,
    protocol: Protocol,
}

impl AddressSelector {
    /// Create a selector over `resolver`
    pub fn new(resolver: Arc<dyn AddressResolver>, protocol: Protocol) -> Self {
        Self { resolver, protocol }
    }

    /// Wire protocol replicas are filtered to
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Resolve and filter the request's replicas
    ///
    /// Records the resolved partition key range and collection in the request
    /// context. After a forced refresh every returned endpoint that was
    /// Unhealthy moves to UnhealthyPending.
    pub async fn resolve_addresses(
        &self,
        request: &mut ServiceRequest,
        force_refresh: bool,
    ) -> Result<PerProtocolAddressInformation> {
        let cancel = request
            .context
            .timeout
            .as_ref()
            .map(|t| t.cancellation().clone())
            .unwrap_or_default();

        let info = self.resolver.resolve(request, force_refresh, &cancel).await?;

        if let Some(range) = &info.partition_key_range {
            request.context.resolved_partition_key_range = Some(range.clone());
        }
        if let Some(rid) = &info.collection_rid {
            request.context.resolved_collection_rid = Some(rid.clone());
        }

        if force_refresh {
            for address in &info.addresses {
                address.uri.set_refreshed_if_unhealthy();
            }
        }

        Ok(info.for_protocol(self.protocol))
    }

    /// Resolve the replica a write or a primary read goes to
    ///
    /// A non-zero `default_replica_index` within bounds pins the request to
    /// that replica; otherwise the flagged primary is used.
    pub async fn resolve_primary(
        &self,
        request: &mut ServiceRequest,
        force_refresh: bool,
    ) -> Result<Arc<TransportAddressUri>> {
        let addresses = self.resolve_addresses(request, force_refresh).await?;

        if let Some(index) = request.default_replica_index {
            let index = index as usize;
            if index != 0 && index < addresses.replicas.len() {
                return Ok(addresses.replicas[index].clone());
            }
        }

        addresses.primary.ok_or_else(|| {
            Error::gone(
                SubStatusCode::UNKNOWN,
                format!(
                    "No primary replica resolved for {} among {} replicas",
                    request.resource_address,
                    addresses.replicas.len()
                ),
            )
        })
    }

    /// Resolve every replica, optionally without the primary, together with
    /// a printable health snapshot of each
    pub async fn resolve_all(
        &self,
        request: &mut ServiceRequest,
        include_primary: bool,
        force_refresh: bool,
    ) -> Result<(Vec<Arc<TransportAddressUri>>, Vec<String>)> {
        let addresses = self.resolve_addresses(request, force_refresh).await?;
        let replicas = if include_primary {
            addresses.replicas.clone()
        } else {
            addresses.non_primary()
        };
        let health = replicas.iter().map(|r| r.to_string()).collect();
        Ok((replicas, health))
    }

    /// Tell the resolver a physical server misbehaved
    pub async fn invalidate_server(&self, server_key: &str) {
        self.resolver.update(server_key).await;
    }

    /// Fire a forced refresh off the critical path; failures are only logged
    pub fn start_background_refresh(&self, request: &ServiceRequest) {
        let resolver = self.resolver.clone();
        let request = request.clone();
        let resource = request.resource_address.clone();
        tokio::spawn(async move {
            let cancel = CancellationToken::new();
            match resolver.resolve(&request, true, &cancel).await {
                Ok(_) => tracing::debug!("Background address refresh for {} completed", resource),
                Err(e) => tracing::warn!("Background address refresh for {} failed: {}", resource, e),
            }
        });
    }
}
