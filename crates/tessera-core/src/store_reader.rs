//! Replica fan-out for reads
//!
//! Reads are spawned onto the runtime, one task per replica, and collected
//! as they complete. As soon as enough acceptable results are in, the
//! collector returns; tasks still in flight are detached and finish in the
//! background so their connections are drained rather than abandoned. A
//! failing replica never fails the fan-out: its failure becomes a
//! [`StoreResult`] and the next replica in enumeration order is started.

use crate::address::{AddressEnumerator, AddressSelector, TransportAddressUri};
use crate::config::DirectConfig;
use crate::error::{Error, Result};
use crate::request::{ReadMode, ServiceRequest};
use crate::session::{self, SessionContainer};
use crate::store_result::StoreResult;
use crate::transport::{TransportClient, TransportError, TransportErrorCode};
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use std::sync::Arc;
use std::time::Duration;
use tessera_protocol::{SessionToken, StatusCode, headers};

/// Issues reads against one or more replicas of a partition
#[derive(Clone)]
pub struct StoreReader {
    transport: Arc<dyn TransportClient>,
    selector: AddressSelector,
    enumerator: Arc<dyn AddressEnumerator>,
    session_container: Arc<dyn SessionContainer>,
    config: Arc<DirectConfig>,
}

impl StoreReader {
    /// Create a reader
    pub fn new(
        transport: Arc<dyn TransportClient>,
        selector: AddressSelector,
        enumerator: Arc<dyn AddressEnumerator>,
        session_container: Arc<dyn SessionContainer>,
        config: Arc<DirectConfig>,
    ) -> Self {
        Self {
            transport,
            selector,
            enumerator,
            session_container,
            config,
        }
    }

    /// Address selector the reader resolves through
    pub fn selector(&self) -> &AddressSelector {
        &self.selector
    }

    /// Configuration
    pub fn config(&self) -> &DirectConfig {
        &self.config
    }

    /// Partition-local session token the request would carry
    ///
    /// Resolved the same way a session read resolves it, without touching
    /// the request. `None` before the partition key range is resolved.
    pub fn partition_local_session_token(
        &self,
        request: &ServiceRequest,
    ) -> Result<Option<SessionToken>> {
        let mut scoped = request.clone();
        session::set_partition_local_session_token(&mut scoped, self.session_container.as_ref())?;
        Ok(scoped.context.session_token)
    }

    /// Read from up to `replica_count_to_read` replicas concurrently
    ///
    /// A result is kept when it is valid and either the request carries no
    /// session token, the replica's token satisfies it, or (without
    /// `check_min_lsn`) the replica did not answer 404. Returns fewer results
    /// than asked for when the replica set runs out; returns an empty list
    /// when the partition has fewer replicas than requested.
    pub async fn read_multiple_replicas(
        &self,
        request: &mut ServiceRequest,
        include_primary: bool,
        replica_count_to_read: usize,
        requires_valid_lsn: bool,
        use_session_token: bool,
        read_mode: ReadMode,
        check_min_lsn: bool,
    ) -> Result<Vec<Arc<StoreResult>>> {
        if read_mode == ReadMode::Primary {
            let result = self
                .read_primary(request, requires_valid_lsn, use_session_token)
                .await?;
            return Ok(vec![result]);
        }

        let original_token = request.headers.get(headers::SESSION_TOKEN).map(str::to_string);
        let result = self
            .read_multiple_replicas_internal(
                request,
                include_primary,
                replica_count_to_read,
                requires_valid_lsn,
                use_session_token,
                read_mode,
                check_min_lsn,
            )
            .await;
        restore_session_token(request, original_token);
        result
    }

    async fn read_multiple_replicas_internal(
        &self,
        request: &mut ServiceRequest,
        include_primary: bool,
        replica_count_to_read: usize,
        requires_valid_lsn: bool,
        use_session_token: bool,
        read_mode: ReadMode,
        check_min_lsn: bool,
    ) -> Result<Vec<Arc<StoreResult>>> {
        if let Some(timeout) = &request.context.timeout {
            timeout.throw_gone_if_elapsed()?;
        }

        let mut force_refresh = request.context.force_refresh_address_cache;
        let (mut replicas, mut health) = self
            .selector
            .resolve_all(request, include_primary, force_refresh)
            .await?;

        if replicas.len() < replica_count_to_read && !force_refresh {
            tracing::debug!(
                "Only {} of {} replicas resolved for {}, forcing address refresh",
                replicas.len(),
                replica_count_to_read,
                request.resource_address
            );
            force_refresh = true;
            request.context.force_refresh_address_cache = true;
            (replicas, health) = self
                .selector
                .resolve_all(request, include_primary, force_refresh)
                .await?;
        }
        if replicas.len() < replica_count_to_read {
            return Ok(Vec::new());
        }

        if use_session_token {
            session::set_partition_local_session_token(request, self.session_container.as_ref())?;
        } else {
            session::clear_session_token(request);
        }
        let request_token = if use_session_token {
            request.context.session_token.clone()
        } else {
            None
        };

        let failed = request.context.failed_endpoints();
        let mut pending = self
            .enumerator
            .order(&replicas, &failed, self.config.replica_address_validation)
            .into_iter();
        let health = Arc::new(health);

        let mut in_flight = FuturesUnordered::new();
        for replica in pending.by_ref().take(replica_count_to_read) {
            in_flight.push(self.spawn_read(request, replica, requires_valid_lsn, &health));
        }

        let mut accepted: Vec<Arc<StoreResult>> = Vec::with_capacity(replica_count_to_read);
        let mut fatal: Option<Error> = None;
        let mut saw_gone = false;

        while let Some(joined) = in_flight.next().await {
            let result = Arc::new(joined.unwrap_or_else(|e| {
                StoreResult::from_error(
                    Error::internal(format!("Replica read task failed: {}", e)),
                    "",
                    requires_valid_lsn,
                    Vec::new(),
                )
            }));
            request.context.request_charge().add(result.request_charge);
            self.note_failure(request, &result).await;
            saw_gone |= result.is_gone();

            let satisfies_session = match (&request_token, &result.session_token) {
                (None, _) => true,
                (Some(expected), Some(actual)) if expected.is_valid(actual)? => true,
                _ => !check_min_lsn && result.status != StatusCode::NOT_FOUND,
            };

            if result.is_valid && satisfies_session {
                accepted.push(result);
                if accepted.len() >= replica_count_to_read {
                    break;
                }
                continue;
            }

            if let Some(error @ (Error::Internal(_) | Error::Cancelled)) = result.error() {
                fatal = Some(error.clone());
            }
            tracing::debug!(
                "Replica {} not accepted for {:?} read (status {}, lsn {}, valid {})",
                result.endpoint,
                read_mode,
                result.status,
                result.lsn,
                result.is_valid
            );
            if let Some(next) = pending.next() {
                in_flight.push(self.spawn_read(request, next, requires_valid_lsn, &health));
            }
        }
        // Detach whatever is still running
        drop(in_flight);

        if saw_gone && !request.context.performed_background_address_refresh {
            self.selector.start_background_refresh(request);
            request.context.performed_background_address_refresh = true;
        }

        match fatal {
            Some(error) if accepted.is_empty() => Err(error),
            _ => Ok(accepted),
        }
    }

    /// Read from the primary replica
    ///
    /// A Gone from the primary is retried once against freshly resolved
    /// addresses.
    pub async fn read_primary(
        &self,
        request: &mut ServiceRequest,
        requires_valid_lsn: bool,
        use_session_token: bool,
    ) -> Result<Arc<StoreResult>> {
        let original_token = request.headers.get(headers::SESSION_TOKEN).map(str::to_string);
        let result = self
            .read_primary_internal(request, requires_valid_lsn, use_session_token)
            .await;
        restore_session_token(request, original_token);
        result
    }

    async fn read_primary_internal(
        &self,
        request: &mut ServiceRequest,
        requires_valid_lsn: bool,
        use_session_token: bool,
    ) -> Result<Arc<StoreResult>> {
        let mut force_refresh = request.context.force_refresh_address_cache;
        loop {
            if let Some(timeout) = &request.context.timeout {
                timeout.throw_gone_if_elapsed()?;
            }

            let primary = self.selector.resolve_primary(request, force_refresh).await?;
            if use_session_token {
                session::set_partition_local_session_token(
                    request,
                    self.session_container.as_ref(),
                )?;
            } else {
                session::clear_session_token(request);
            }

            let health = Arc::new(vec![primary.to_string()]);
            let result = match self
                .spawn_read(request, primary, requires_valid_lsn, &health)
                .await
            {
                Ok(result) => Arc::new(result),
                Err(e) => return Err(Error::internal(format!("Primary read task failed: {}", e))),
            };
            request.context.request_charge().add(result.request_charge);
            self.note_failure(request, &result).await;

            if result.is_gone() && !force_refresh {
                tracing::debug!(
                    "Primary {} returned Gone for {}, retrying with refreshed addresses",
                    result.endpoint,
                    request.resource_address
                );
                force_refresh = true;
                request.context.force_refresh_address_cache = true;
                continue;
            }
            return Ok(result);
        }
    }

    fn spawn_read(
        &self,
        request: &ServiceRequest,
        replica: Arc<TransportAddressUri>,
        requires_valid_lsn: bool,
        health: &Arc<Vec<String>>,
    ) -> tokio::task::JoinHandle<StoreResult> {
        let budget = request
            .context
            .timeout
            .as_ref()
            .map(|t| t.remaining().min(self.config.replica_request_timeout))
            .unwrap_or(self.config.replica_request_timeout);
        let transport = self.transport.clone();
        let request = request.clone();
        let use_local_lsn_headers = self.config.use_local_lsn_headers;
        let health = health.clone();

        tokio::spawn(async move {
            invoke_replica(
                transport.as_ref(),
                &request,
                &replica,
                budget,
                requires_valid_lsn,
                use_local_lsn_headers,
                health.as_ref().clone(),
            )
            .await
        })
    }

    async fn note_failure(&self, request: &ServiceRequest, result: &StoreResult) {
        if !(result.is_transport_failure() || result.is_gone()) || result.endpoint.is_empty() {
            return;
        }
        request.context.mark_endpoint_failed(&result.endpoint);
        let connection_lost = result
            .error()
            .and_then(Error::transport)
            .is_some_and(|t| {
                matches!(
                    t.code,
                    TransportErrorCode::ConnectFailed | TransportErrorCode::ConnectionBroken
                )
            });
        if connection_lost {
            self.selector.invalidate_server(&result.endpoint).await;
        }
    }
}

/// Invoke `request` at one replica within `budget`, recording the outcome in
/// the replica's health
pub(crate) async fn invoke_replica(
    transport: &dyn TransportClient,
    request: &ServiceRequest,
    replica: &TransportAddressUri,
    budget: Duration,
    requires_valid_lsn: bool,
    use_local_lsn_headers: bool,
    replica_health: Vec<String>,
) -> StoreResult {
    let endpoint = replica.uri().to_string();
    let outcome = tokio::time::timeout(budget, transport.invoke(&endpoint, request)).await;

    let failure = match outcome {
        Ok(Ok(response)) => {
            replica.set_connected();
            return StoreResult::from_response(
                response,
                endpoint,
                requires_valid_lsn,
                use_local_lsn_headers,
                replica_health,
            );
        }
        Ok(Err(error)) => error,
        Err(_) => TransportError::new(
            TransportErrorCode::ReceiveTimeout,
            endpoint.clone(),
            format!("No response within {:?}", budget),
        )
        .with_payload_sent(true),
    };

    if failure.code == TransportErrorCode::ChannelClosed {
        replica.set_unknown();
    } else {
        replica.set_unhealthy();
    }
    tracing::debug!("Replica {} failed: {}", endpoint, failure);

    let error = Error::from_transport(
        failure.with_activity_id(request.activity_id),
        request.is_read_only(),
    );
    StoreResult::from_error(error, endpoint, requires_valid_lsn, replica_health)
}

fn restore_session_token(request: &mut ServiceRequest, original: Option<String>) {
    match original {
        Some(token) => request.headers.set(headers::SESSION_TOKEN, token),
        None => {
            request.headers.remove(headers::SESSION_TOKEN);
        }
    }
}
