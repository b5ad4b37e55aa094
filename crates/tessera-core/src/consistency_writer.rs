//! Writes and the global-strong write barrier
//!
//! Writes go to the primary only. On a multi-region Strong account a write
//! the primary acknowledged may not have reached the other regions yet: the
//! writer then polls replicas with a barrier until one of them reports a
//! global committed LSN at least as high as the write's LSN. Until that
//! happens the write is neither failed nor confirmed, so exhausting the polls
//! is reported as Gone(GlobalStrongWriteBarrierNotMet) and the write response
//! is kept in the request context for the retried attempt.

use crate::address::AddressSelector;
use crate::barrier::create_barrier_request;
use crate::config::DirectConfig;
use crate::consistency_reader::resolve_consistency_level;
use crate::error::{Error, Result};
use crate::request::{OperationType, ReadMode, ServiceRequest};
use crate::session::{self, SessionContainer};
use crate::store_reader::{StoreReader, invoke_replica};
use crate::store_result::StoreResult;
use crate::transport::{StoreResponse, TransportClient};
use std::sync::Arc;
use tessera_protocol::{ConsistencyLevel, StatusCode, SubStatusCode, headers};

/// Sends writes to the primary replica
#[derive(Clone)]
pub struct ConsistencyWriter {
    transport: Arc<dyn TransportClient>,
    selector: AddressSelector,
    store_reader: StoreReader,
    session_container: Arc<dyn SessionContainer>,
    config: Arc<DirectConfig>,
}

impl ConsistencyWriter {
    /// Create a writer
    pub fn new(
        transport: Arc<dyn TransportClient>,
        selector: AddressSelector,
        store_reader: StoreReader,
        session_container: Arc<dyn SessionContainer>,
        config: Arc<DirectConfig>,
    ) -> Self {
        Self {
            transport,
            selector,
            store_reader,
            session_container,
            config,
        }
    }

    /// Write `request` at the primary
    pub async fn write(&self, request: &mut ServiceRequest) -> Result<StoreResponse> {
        if let Some(timeout) = &request.context.timeout {
            timeout.throw_gone_if_elapsed()?;
        }

        let original_token = request.headers.get(headers::SESSION_TOKEN).map(str::to_string);
        let result = self.write_internal(request).await;
        match original_token {
            Some(token) => request.headers.set(headers::SESSION_TOKEN, token),
            None => {
                request.headers.remove(headers::SESSION_TOKEN);
            }
        }
        result
    }

    async fn write_internal(&self, request: &mut ServiceRequest) -> Result<StoreResponse> {
        let result = match request.context.global_strong_write_response.clone() {
            Some(parked) => {
                tracing::debug!(
                    "Resuming global strong write barrier for {} at lsn {}",
                    request.resource_address,
                    parked.lsn
                );
                parked
            }
            None => self.write_to_primary(request).await?,
        };

        if self.needs_global_strong_barrier(&result) {
            if result.lsn == -1 || result.global_committed_lsn == -1 {
                tracing::warn!(
                    "Primary {} returned lsn {} / global committed lsn {} for a global strong write",
                    result.endpoint,
                    result.lsn,
                    result.global_committed_lsn
                );
                return Err(Error::gone(
                    SubStatusCode::NO_VALID_STORE_RESPONSE,
                    format!(
                        "Write to {} returned no usable LSN",
                        request.resource_address
                    ),
                ));
            }

            if result.global_committed_lsn < result.lsn {
                let barrier = create_barrier_request(request, -1, result.lsn)?;
                if !self.wait_for_write_barrier(barrier, result.lsn).await? {
                    tracing::warn!(
                        "Global strong write barrier for {} not met at lsn {}",
                        request.resource_address,
                        result.lsn
                    );
                    request.context.global_strong_write_response = Some(result);
                    return Err(Error::gone(
                        SubStatusCode::GLOBAL_STRONG_WRITE_BARRIER_NOT_MET,
                        format!(
                            "Write to {} is not yet durable in every region",
                            request.resource_address
                        ),
                    ));
                }
            }
        }

        request.context.global_strong_write_response = None;
        result.to_response()
    }

    async fn write_to_primary(&self, request: &mut ServiceRequest) -> Result<Arc<StoreResult>> {
        let primary = self
            .selector
            .resolve_primary(request, request.context.force_refresh_address_cache)
            .await?;

        let level = resolve_consistency_level(self.config.account_consistency, request)?;
        let partition_local = (self.config.use_multiple_write_locations
            || request.operation_type == OperationType::Batch)
            && level == ConsistencyLevel::Session;
        if partition_local {
            session::set_partition_local_session_token(request, self.session_container.as_ref())?;
        } else {
            session::clear_session_token(request);
        }

        let budget = request
            .context
            .timeout
            .as_ref()
            .map(|t| t.remaining().min(self.config.replica_request_timeout))
            .unwrap_or(self.config.replica_request_timeout);
        let result = invoke_replica(
            self.transport.as_ref(),
            request,
            &primary,
            budget,
            false,
            self.config.use_local_lsn_headers,
            vec![primary.to_string()],
        )
        .await;
        request.context.request_charge().add(result.request_charge);

        if result.is_transport_failure() || result.is_gone() {
            request.context.mark_endpoint_failed(&result.endpoint);
            if result.is_gone() {
                self.selector.start_background_refresh(request);
            }
            return Err(result.error().cloned().unwrap_or_else(|| {
                Error::gone(SubStatusCode::UNKNOWN, "Primary write failed")
            }));
        }

        Ok(Arc::new(result))
    }

    fn needs_global_strong_barrier(&self, result: &StoreResult) -> bool {
        let status_may_be_durable = result.status.is_success()
            || result.status == StatusCode::CONFLICT
            || (result.status == StatusCode::NOT_FOUND
                && result.sub_status != SubStatusCode::PARTITION_KEY_RANGE_GONE)
            || result.status == StatusCode::PRECONDITION_FAILED;

        status_may_be_durable
            && self.config.global_strong_enabled
            && self.config.account_consistency == ConsistencyLevel::Strong
            && result.number_of_read_regions > 0
    }

    async fn wait_for_write_barrier(
        &self,
        mut barrier: ServiceRequest,
        selected_global_committed_lsn: i64,
    ) -> Result<bool> {
        let polls = self.config.max_global_strong_barrier_retries;
        let mut max_global_committed_lsn = -1;

        for attempt in 0..polls {
            if let Some(timeout) = &barrier.context.timeout {
                timeout.throw_gone_if_elapsed()?;
            }

            let responses = self
                .store_reader
                .read_multiple_replicas(&mut barrier, true, 1, false, false, ReadMode::Strong, false)
                .await?;
            if responses
                .iter()
                .any(|r| r.global_committed_lsn >= selected_global_committed_lsn)
            {
                tracing::debug!(
                    "Global strong write barrier met after {} polls",
                    attempt + 1
                );
                return Ok(true);
            }

            max_global_committed_lsn = responses
                .iter()
                .map(|r| r.global_committed_lsn)
                .fold(max_global_committed_lsn, i64::max);
            barrier.context.force_refresh_address_cache = false;

            if attempt + 1 < polls {
                tokio::time::sleep(self.config.global_strong_barrier_delay_for(attempt)).await;
            }
        }

        tracing::debug!(
            "Write barrier saw global committed lsn {} waiting for {}",
            max_global_committed_lsn,
            selected_global_committed_lsn
        );
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::RoundRobinAddressEnumerator;
    use crate::context::PartitionKeyRange;
    use crate::request::{Protocol, ResourceType};
    use crate::session::InMemorySessionContainer;
    use crate::testing::{MockReply, ResponseBuilder, ScriptedTransport, StaticAddressResolver};
    use crate::timeout::TimeoutHelper;
    use crate::transport::TransportErrorCode;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    const REPLICAS: [&str; 3] = ["rntbd://p/", "rntbd://s1/", "rntbd://s2/"];

    fn writer(transport: &Arc<ScriptedTransport>, config: DirectConfig) -> ConsistencyWriter {
        let config = Arc::new(config);
        let resolver = Arc::new(
            StaticAddressResolver::with_replicas(&REPLICAS)
                .with_partition_key_range(PartitionKeyRange::new("0")),
        );
        let selector = AddressSelector::new(resolver, Protocol::Rntbd);
        let container: Arc<dyn SessionContainer> = Arc::new(InMemorySessionContainer::new());
        let store_reader = StoreReader::new(
            transport.clone(),
            selector.clone(),
            Arc::new(RoundRobinAddressEnumerator::default()),
            container.clone(),
            config.clone(),
        );
        ConsistencyWriter::new(transport.clone(), selector, store_reader, container, config)
    }

    fn create(operation_type: OperationType) -> ServiceRequest {
        let mut request = ServiceRequest::new(
            operation_type,
            ResourceType::Document,
            "dbs/db/colls/c/docs/1",
        )
        .with_header(headers::SESSION_TOKEN, "0:1#4#1=4");
        request.context.timeout =
            Some(TimeoutHelper::new(Duration::from_secs(30), CancellationToken::new()));
        request
    }

    #[tokio::test]
    async fn test_single_write_region_strips_session_token() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.on("rntbd://p/", |_| ResponseBuilder::created().lsn(5).reply());
        let writer = writer(&transport, DirectConfig::default());

        let mut request = create(OperationType::Create);
        writer.write(&mut request).await.unwrap();
        assert_eq!(transport.calls()[0].session_token, None);
        assert_eq!(request.headers.get(headers::SESSION_TOKEN), Some("0:1#4#1=4"));
    }

    #[tokio::test]
    async fn test_batch_sends_partition_local_token() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.on("rntbd://p/", |_| ResponseBuilder::ok().lsn(5).reply());
        let writer = writer(&transport, DirectConfig::default());

        let mut request = create(OperationType::Batch);
        writer.write(&mut request).await.unwrap();
        assert_eq!(transport.calls()[0].session_token.as_deref(), Some("0:1#4#1=4"));
    }

    #[tokio::test]
    async fn test_multi_write_region_sends_partition_local_token() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.on("rntbd://p/", |_| ResponseBuilder::created().lsn(5).reply());
        let writer = writer(
            &transport,
            DirectConfig::default().with_multiple_write_locations(true),
        );

        writer.write(&mut create(OperationType::Upsert)).await.unwrap();
        assert_eq!(transport.calls()[0].session_token.as_deref(), Some("0:1#4#1=4"));
    }

    #[tokio::test]
    async fn test_single_region_strong_write_needs_no_barrier() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.on("rntbd://p/", |_| {
            ResponseBuilder::created()
                .lsn(100)
                .global_committed_lsn(90)
                .read_regions(0)
                .reply()
        });
        let writer = writer(&transport, DirectConfig::global_strong());

        writer.write(&mut create(OperationType::Create)).await.unwrap();
        assert_eq!(transport.calls_of(OperationType::Head), 0);
    }

    #[tokio::test]
    async fn test_missing_global_committed_lsn_is_gone() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.on("rntbd://p/", |_| ResponseBuilder::created().lsn(100).read_regions(2).reply());
        let writer = writer(&transport, DirectConfig::global_strong());

        let err = writer
            .write(&mut create(OperationType::Create))
            .await
            .unwrap_err();
        assert!(err.is_gone());
        assert_eq!(err.sub_status(), SubStatusCode::NO_VALID_STORE_RESPONSE);
    }

    #[tokio::test]
    async fn test_conflict_still_waits_for_barrier() {
        let transport = Arc::new(ScriptedTransport::new());
        for endpoint in REPLICAS {
            transport.on(endpoint, |request| {
                if request.operation_type == OperationType::Head {
                    ResponseBuilder::ok().global_committed_lsn(60).reply()
                } else {
                    ResponseBuilder::status(409)
                        .lsn(60)
                        .global_committed_lsn(50)
                        .read_regions(1)
                        .reply()
                }
            });
        }
        let writer = writer(&transport, DirectConfig::global_strong());

        let err = writer
            .write(&mut create(OperationType::Create))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
        assert_eq!(transport.calls_of(OperationType::Head), 1);
        let head = transport
            .calls()
            .into_iter()
            .find(|c| c.operation_type == OperationType::Head)
            .unwrap();
        assert_eq!(
            head.headers.get(headers::TARGET_GLOBAL_COMMITTED_LSN),
            Some("60")
        );
        assert!(!head.headers.contains(headers::TARGET_LSN));
    }

    #[tokio::test]
    async fn test_unsent_write_is_gone_and_sent_write_is_unavailable() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.on("rntbd://p/", |_| MockReply::Fail(TransportErrorCode::ConnectFailed, false));
        let writer = writer(&transport, DirectConfig::default());
        let err = writer
            .write(&mut create(OperationType::Create))
            .await
            .unwrap_err();
        assert!(err.is_gone());
        assert_eq!(err.sub_status(), SubStatusCode::TRANSPORT_GENERATED_410);

        transport.on("rntbd://p/", |_| MockReply::Fail(TransportErrorCode::ReceiveTimeout, true));
        let err = writer
            .write(&mut create(OperationType::Create))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(err.sub_status(), SubStatusCode::TRANSPORT_GENERATED_503);
        assert!(err.transport().is_some_and(|t| t.payload_sent));
    }
}
