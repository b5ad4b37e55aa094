//! Top-level entry point of direct mode
//!
//! [`ReplicatedResourceClient::invoke`] owns one logical request end to end:
//! it starts the request budget, resolves the consistency level, sends reads
//! through the [`ConsistencyReader`] and writes through the
//! [`ConsistencyWriter`], retries Gone failures (inner loop) and session
//! mismatches (outer loop), and records the session token of the response.

use crate::address::{
    AddressEnumerator, AddressResolver, AddressSelector, RandomAddressEnumerator,
};
use crate::config::DirectConfig;
use crate::consistency_reader::{
    ConsistencyReader, requested_consistency_level, resolve_consistency_level,
};
use crate::consistency_writer::ConsistencyWriter;
use crate::error::{Error, Result};
use crate::request::{OperationType, ResourceType, ServiceRequest};
use crate::retry::{
    AlternateOperation, GoneOnlyRequestRetryPolicy, RetryExecutor,
    SessionTokenMismatchRetryPolicy,
};
use crate::session::SessionContainer;
use crate::store_reader::StoreReader;
use crate::timeout::TimeoutHelper;
use crate::transport::{StoreResponse, TransportClient};
use std::sync::Arc;
use tessera_protocol::{ConsistencyLevel, Headers, SubStatusCode, headers};
use tokio_util::sync::CancellationToken;

/// Coordinates replicas for every request of one account
#[derive(Clone)]
pub struct ReplicatedResourceClient {
    config: Arc<DirectConfig>,
    transport: Arc<dyn TransportClient>,
    selector: AddressSelector,
    session_container: Arc<dyn SessionContainer>,
    reader: ConsistencyReader,
    writer: ConsistencyWriter,
}

impl ReplicatedResourceClient {
    /// Create a client; replicas are enumerated in random order
    pub fn new(
        config: DirectConfig,
        transport: Arc<dyn TransportClient>,
        resolver: Arc<dyn AddressResolver>,
        session_container: Arc<dyn SessionContainer>,
    ) -> Result<Self> {
        config.validate().map_err(|e| {
            Error::bad_request(
                SubStatusCode::UNKNOWN,
                format!("Invalid direct-mode configuration: {}", e),
            )
        })?;

        let config = Arc::new(config);
        let selector = AddressSelector::new(resolver, config.protocol);
        Ok(Self::assemble(
            config,
            transport,
            selector,
            session_container,
            Arc::new(RandomAddressEnumerator),
        ))
    }

    /// Replace the replica enumeration order
    pub fn with_address_enumerator(self, enumerator: Arc<dyn AddressEnumerator>) -> Self {
        Self::assemble(
            self.config,
            self.transport,
            self.selector,
            self.session_container,
            enumerator,
        )
    }

    fn assemble(
        config: Arc<DirectConfig>,
        transport: Arc<dyn TransportClient>,
        selector: AddressSelector,
        session_container: Arc<dyn SessionContainer>,
        enumerator: Arc<dyn AddressEnumerator>,
    ) -> Self {
        let store_reader = StoreReader::new(
            transport.clone(),
            selector.clone(),
            enumerator,
            session_container.clone(),
            config.clone(),
        );
        let reader = ConsistencyReader::new(store_reader.clone(), config.clone());
        let writer = ConsistencyWriter::new(
            transport.clone(),
            selector.clone(),
            store_reader,
            session_container.clone(),
            config.clone(),
        );
        Self {
            config,
            transport,
            selector,
            session_container,
            reader,
            writer,
        }
    }

    /// Configuration
    pub fn config(&self) -> &DirectConfig {
        &self.config
    }

    /// Session tokens captured from responses
    pub fn session_container(&self) -> &Arc<dyn SessionContainer> {
        &self.session_container
    }

    /// Run `request` against the replicas of its partition
    pub async fn invoke(
        &self,
        mut request: ServiceRequest,
        cancel: CancellationToken,
    ) -> Result<StoreResponse> {
        request.context.timeout = Some(TimeoutHelper::new(
            self.config.request_timeout,
            cancel.clone(),
        ));
        let level = resolve_consistency_level(self.config.account_consistency, &request)?;
        request.context.original_consistency = requested_consistency_level(&request);

        let mut session_policy =
            SessionTokenMismatchRetryPolicy::new(self.config.session_retry.clone());
        let mut session_retries = RetryExecutor::new(cancel.clone());

        let outcome = session_retries
            .execute(
                &mut request,
                &mut session_policy,
                async |request: &mut ServiceRequest| {
                    let mut gone_policy =
                        GoneOnlyRequestRetryPolicy::new(self.config.gone_retry.clone());
                    let mut gone_retries = RetryExecutor::new(cancel.clone());
                    if let Some(alternate) = self.in_backoff_alternate(request, level) {
                        gone_retries = gone_retries.with_in_backoff_alternate(
                            alternate,
                            self.config.in_backoff_fallback_threshold,
                        );
                    }

                    let outcome = gone_retries
                        .execute(request, &mut gone_policy, async |request: &mut ServiceRequest| {
                            self.dispatch(request).await
                        })
                        .await;
                    match &outcome {
                        Ok(response) => self.capture_session_token(request, &response.headers),
                        Err(error) => {
                            // replicas answering 404 or 409 still report their progress
                            if let Some(token) = error.session_token() {
                                let headers = Headers::new().with(headers::SESSION_TOKEN, token);
                                self.record_session_token(request, &headers);
                            }
                        }
                    }
                    outcome
                },
            )
            .await;

        let mut response = outcome?;
        let charge = request.context.total_request_charge();
        if charge > 0.0 {
            response
                .headers
                .set(headers::REQUEST_CHARGE, format!("{}", charge));
        }
        Ok(response)
    }

    async fn dispatch(&self, request: &mut ServiceRequest) -> Result<StoreResponse> {
        if request.is_read_only() {
            self.reader.read(request).await
        } else {
            self.writer.write(request).await
        }
    }

    fn capture_session_token(&self, request: &ServiceRequest, response_headers: &Headers) {
        if request.resource_type == ResourceType::Collection
            && request.operation_type == OperationType::Delete
        {
            let resource_id = request
                .collection_rid()
                .or_else(|| request.collection_path())
                .unwrap_or_else(|| request.resource_address.clone());
            self.session_container.clear_token_by_resource_id(&resource_id);
            return;
        }
        self.record_session_token(request, response_headers);
    }

    fn record_session_token(&self, request: &ServiceRequest, response_headers: &Headers) {
        if let Err(e) = self
            .session_container
            .set_session_token(request, response_headers)
        {
            tracing::warn!(
                "Could not record session token of {}: {}",
                request.resource_address,
                e
            );
        }
    }

    /// Eventual read from the next region, raced against long Gone backoffs
    fn in_backoff_alternate(
        &self,
        request: &ServiceRequest,
        level: ConsistencyLevel,
    ) -> Option<AlternateOperation<'static, StoreResponse>> {
        let weak = matches!(
            level,
            ConsistencyLevel::Eventual | ConsistencyLevel::ConsistentPrefix
        );
        if !self.config.enable_read_request_fallback || !request.is_read_only() || !weak {
            return None;
        }

        let mut template = request.clone();
        template.context.location_index = Some(template.context.location_index.map_or(1, |i| i + 1));
        template.context.force_refresh_address_cache = false;
        template
            .headers
            .set(headers::CONSISTENCY_LEVEL, ConsistencyLevel::Eventual.as_str());
        let reader = self.reader.clone();

        Some(Box::new(move || {
            let reader = reader.clone();
            let mut alternate = template.clone();
            Box::pin(async move {
                tracing::debug!(
                    "Reading {} from region {:?} during backoff",
                    alternate.resource_address,
                    alternate.context.location_index
                );
                reader.read(&mut alternate).await
            })
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::RoundRobinAddressEnumerator;
    use crate::context::PartitionKeyRange;
    use crate::session::InMemorySessionContainer;
    use crate::testing::{ResponseBuilder, ScriptedTransport, StaticAddressResolver};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const REPLICAS: [&str; 4] = ["rntbd://p/", "rntbd://s1/", "rntbd://s2/", "rntbd://s3/"];

    fn client(
        transport: &Arc<ScriptedTransport>,
        resolver: StaticAddressResolver,
        config: DirectConfig,
    ) -> (ReplicatedResourceClient, Arc<InMemorySessionContainer>) {
        let container = Arc::new(InMemorySessionContainer::new());
        let client = ReplicatedResourceClient::new(
            config,
            transport.clone(),
            Arc::new(
                resolver
                    .with_partition_key_range(PartitionKeyRange::new("0"))
                    .with_collection_rid("coll"),
            ),
            container.clone(),
        )
        .unwrap()
        .with_address_enumerator(Arc::new(RoundRobinAddressEnumerator::default()));
        (client, container)
    }

    fn read() -> ServiceRequest {
        ServiceRequest::new(OperationType::Read, ResourceType::Document, "dbs/db/colls/c/docs/1")
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let transport = Arc::new(ScriptedTransport::new());
        let result = ReplicatedResourceClient::new(
            DirectConfig::default().with_max_replica_set_size(0),
            transport,
            Arc::new(StaticAddressResolver::with_replicas(&REPLICAS)),
            Arc::new(InMemorySessionContainer::new()),
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_read_records_session_token_and_charge() {
        let transport = Arc::new(ScriptedTransport::new());
        for endpoint in REPLICAS {
            transport.on(endpoint, |_| {
                ResponseBuilder::ok().lsn(7).session("0:7").charge(2.0).reply()
            });
        }
        let (client, container) =
            client(&transport, StaticAddressResolver::with_replicas(&REPLICAS), DirectConfig::default());

        let response = client.invoke(read(), CancellationToken::new()).await.unwrap();
        assert_eq!(response.request_charge(), 2.0);
        assert_eq!(
            container.resolve_global_session_token(&read()).as_deref(),
            Some("0:7")
        );
    }

    #[tokio::test]
    async fn test_not_found_still_records_session_token() {
        let transport = Arc::new(ScriptedTransport::new());
        for endpoint in REPLICAS {
            transport.on(endpoint, |_| ResponseBuilder::not_found().lsn(9).session("0:9").reply());
        }
        let (client, container) =
            client(&transport, StaticAddressResolver::with_replicas(&REPLICAS), DirectConfig::default());

        let err = client.invoke(read(), CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.status_code(), tessera_protocol::StatusCode::NOT_FOUND);
        assert_eq!(err.session_token(), Some("0:9"));
        assert_eq!(
            container.resolve_global_session_token(&read()).as_deref(),
            Some("0:9")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_gone_is_retried_with_refresh() {
        let transport = Arc::new(ScriptedTransport::new());
        let calls = Arc::new(AtomicUsize::new(0));
        for endpoint in REPLICAS {
            let calls = calls.clone();
            transport.on(endpoint, move |_| {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    ResponseBuilder::gone().reply()
                } else {
                    ResponseBuilder::ok().lsn(3).reply()
                }
            });
        }
        let (client, _) =
            client(&transport, StaticAddressResolver::with_replicas(&REPLICAS), DirectConfig::default());

        let request = read().with_consistency_level(ConsistencyLevel::Eventual);
        client.invoke(request, CancellationToken::new()).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_mismatch_is_retried_until_replica_catches_up() {
        let transport = Arc::new(ScriptedTransport::new());
        let caught_up = Arc::new(AtomicUsize::new(0));
        for endpoint in REPLICAS {
            let caught_up = caught_up.clone();
            transport.on(endpoint, move |_| {
                if caught_up.fetch_add(1, Ordering::SeqCst) < 8 {
                    ResponseBuilder::not_found().lsn(4).session("0:4").reply()
                } else {
                    ResponseBuilder::ok().lsn(9).session("0:9").reply()
                }
            });
        }
        let (client, _) =
            client(&transport, StaticAddressResolver::with_replicas(&REPLICAS), DirectConfig::default());

        let request = read().with_header(headers::SESSION_TOKEN, "0:9");
        let response = client.invoke(request, CancellationToken::new()).await.unwrap();
        assert_eq!(response.session_token(), Some("0:9"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_mismatch_surfaces_after_budget() {
        let transport = Arc::new(ScriptedTransport::new());
        for endpoint in REPLICAS {
            transport.on(endpoint, |_| ResponseBuilder::not_found().lsn(4).session("0:4").reply());
        }
        let config = DirectConfig::default().with_session_retry(crate::config::SessionRetryOptions {
            budget: Duration::from_millis(200),
            ..Default::default()
        });
        let (client, _) = client(&transport, StaticAddressResolver::with_replicas(&REPLICAS), config);

        let request = read().with_header(headers::SESSION_TOKEN, "0:9");
        let err = client.invoke(request, CancellationToken::new()).await.unwrap_err();
        assert!(err.is_read_session_not_available());
    }

    #[tokio::test]
    async fn test_collection_delete_clears_tokens() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.on("rntbd://p/", |_| ResponseBuilder::ok().lsn(3).session("0:3").reply());
        let (client, container) =
            client(&transport, StaticAddressResolver::with_replicas(&REPLICAS), DirectConfig::default());

        let upsert = ServiceRequest::new(OperationType::Upsert, ResourceType::Document, "dbs/db/colls/c/docs/1");
        client.invoke(upsert, CancellationToken::new()).await.unwrap();
        assert!(container.resolve_global_session_token(&read()).is_some());

        let delete = ServiceRequest::new(OperationType::Delete, ResourceType::Collection, "dbs/db/colls/c");
        client.invoke(delete, CancellationToken::new()).await.unwrap();
        assert!(container.resolve_global_session_token(&read()).is_none());
    }

    #[tokio::test]
    async fn test_cancelled_request_stops() {
        let transport = Arc::new(ScriptedTransport::new());
        let (client, _) =
            client(&transport, StaticAddressResolver::with_replicas(&REPLICAS), DirectConfig::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = client.invoke(read(), cancel).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert!(transport.calls().is_empty());
    }
}
