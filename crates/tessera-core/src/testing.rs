//! In-memory collaborators for tests
//!
//! - [`ScriptedTransport`]: per-endpoint handler closures with a call log
//! - [`StaticAddressResolver`]: fixed replica sets with refresh counters
//! - [`ResponseBuilder`]: replica responses with LSN and session headers

use crate::address::{
    AddressInformation, AddressResolver, PartitionAddressInformation, TransportAddressUri,
};
use crate::context::PartitionKeyRange;
use crate::error::{Error, Result};
use crate::request::{OperationType, Protocol, ResourceType, ServiceRequest};
use crate::transport::{StoreResponse, TransportClient, TransportError, TransportErrorCode};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tessera_protocol::{Headers, StatusCode, headers};
use tokio_util::sync::CancellationToken;

/// What a scripted replica does with a request
#[derive(Debug, Clone)]
pub enum MockReply {
    /// Answer with a response
    Respond(StoreResponse),
    /// Fail at the transport level; the flag says whether the payload was sent
    Fail(TransportErrorCode, bool),
    /// Never answer
    Hang,
    /// Wait, then do the inner reply
    Delay(Duration, Box<MockReply>),
}

/// A request as seen by a scripted replica
#[derive(Debug, Clone)]
pub struct RecordedCall {
    /// Replica endpoint
    pub endpoint: String,
    /// Operation
    pub operation_type: OperationType,
    /// Resource kind
    pub resource_type: ResourceType,
    /// Address
    pub resource_address: String,
    /// Session token header as sent
    pub session_token: Option<String>,
    /// All headers as sent
    pub headers: Headers,
}

type Handler = Arc<dyn Fn(&ServiceRequest) -> MockReply + Send + Sync>;

/// Transport whose replicas are closures
#[derive(Default)]
pub struct ScriptedTransport {
    handlers: RwLock<HashMap<String, Handler>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedTransport {
    /// Transport with no scripted endpoint; unscripted endpoints refuse
    /// connections
    pub fn new() -> Self {
        Self::default()
    }

    /// Script `endpoint`, replacing any previous handler
    pub fn on(
        &self,
        endpoint: &str,
        handler: impl Fn(&ServiceRequest) -> MockReply + Send + Sync + 'static,
    ) {
        self.handlers
            .write()
            .insert(endpoint.to_string(), Arc::new(handler));
    }

    /// Every call so far, in arrival order
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    /// Number of calls that reached `endpoint`
    pub fn calls_to(&self, endpoint: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.endpoint == endpoint)
            .count()
    }

    /// Number of calls with the given operation
    pub fn calls_of(&self, operation_type: OperationType) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.operation_type == operation_type)
            .count()
    }

    /// Forget recorded calls
    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }
}

#[async_trait]
impl TransportClient for ScriptedTransport {
    async fn invoke(
        &self,
        endpoint: &str,
        request: &ServiceRequest,
    ) -> std::result::Result<StoreResponse, TransportError> {
        self.calls.lock().push(RecordedCall {
            endpoint: endpoint.to_string(),
            operation_type: request.operation_type,
            resource_type: request.resource_type,
            resource_address: request.resource_address.clone(),
            session_token: request.headers.get(headers::SESSION_TOKEN).map(str::to_string),
            headers: request.headers.clone(),
        });

        let handler = self.handlers.read().get(endpoint).cloned();
        let mut reply = match handler {
            Some(handler) => handler(request),
            None => MockReply::Fail(TransportErrorCode::ConnectFailed, false),
        };

        loop {
            match reply {
                MockReply::Respond(response) => return Ok(response),
                MockReply::Fail(code, payload_sent) => {
                    return Err(TransportError::new(code, endpoint, "scripted failure")
                        .with_payload_sent(payload_sent));
                }
                MockReply::Hang => std::future::pending::<()>().await,
                MockReply::Delay(delay, inner) => {
                    tokio::time::sleep(delay).await;
                    reply = *inner;
                }
            }
        }
    }
}

/// Builds replica responses
#[derive(Debug, Clone)]
pub struct ResponseBuilder {
    response: StoreResponse,
}

impl ResponseBuilder {
    /// Response with `status`
    pub fn status(status: u16) -> Self {
        Self {
            response: StoreResponse::new(StatusCode(status)),
        }
    }

    /// 200
    pub fn ok() -> Self {
        Self::status(200)
    }

    /// 201
    pub fn created() -> Self {
        Self::status(201)
    }

    /// 404
    pub fn not_found() -> Self {
        Self::status(404)
    }

    /// 410
    pub fn gone() -> Self {
        Self::status(410)
    }

    /// Set a header
    pub fn header(mut self, name: &str, value: impl ToString) -> Self {
        self.response.headers.set(name, value.to_string());
        self
    }

    /// Sub-status header
    pub fn sub_status(self, sub_status: u32) -> Self {
        self.header(headers::SUB_STATUS, sub_status)
    }

    /// LSN header
    pub fn lsn(self, lsn: i64) -> Self {
        self.header(headers::LSN, lsn)
    }

    /// Quorum-acked LSN header
    pub fn quorum_acked_lsn(self, lsn: i64) -> Self {
        self.header(headers::QUORUM_ACKED_LSN, lsn)
    }

    /// Global committed LSN header
    pub fn global_committed_lsn(self, lsn: i64) -> Self {
        self.header(headers::GLOBAL_COMMITTED_LSN, lsn)
    }

    /// Number of read regions header
    pub fn read_regions(self, regions: i64) -> Self {
        self.header(headers::NUMBER_OF_READ_REGIONS, regions)
    }

    /// Replica set size header
    pub fn replica_set_size(self, size: i64) -> Self {
        self.header(headers::CURRENT_REPLICA_SET_SIZE, size)
    }

    /// Write quorum header
    pub fn write_quorum(self, quorum: i64) -> Self {
        self.header(headers::CURRENT_WRITE_QUORUM, quorum)
    }

    /// Session token header, partition qualified
    pub fn session(self, token: &str) -> Self {
        self.header(headers::SESSION_TOKEN, token)
    }

    /// Request charge header
    pub fn charge(self, charge: f64) -> Self {
        self.header(headers::REQUEST_CHARGE, charge)
    }

    /// Body
    pub fn body(mut self, body: &'static str) -> Self {
        self.response.body = Some(bytes::Bytes::from_static(body.as_bytes()));
        self
    }

    /// The response
    pub fn build(self) -> StoreResponse {
        self.response
    }

    /// The response as a scripted reply
    pub fn reply(self) -> MockReply {
        MockReply::Respond(self.response)
    }
}

#[derive(Default)]
struct ResolverState {
    addresses: Vec<AddressInformation>,
    regions: HashMap<usize, Vec<AddressInformation>>,
    partition_key_range: Option<PartitionKeyRange>,
    collection_rid: Option<String>,
}

/// Resolver over fixed replica lists
///
/// Endpoint objects are reused across [`set_replicas`](Self::set_replicas)
/// calls so replica health survives a topology change, as it does with a
/// real address cache.
#[derive(Default)]
pub struct StaticAddressResolver {
    state: RwLock<ResolverState>,
    uris: Mutex<HashMap<String, Arc<TransportAddressUri>>>,
    failure: Mutex<Option<Error>>,
    invalidated: Mutex<Vec<String>>,
    resolve_count: AtomicUsize,
    force_refresh_count: AtomicUsize,
}

impl StaticAddressResolver {
    /// Replicas of one partition; the first one is the primary
    pub fn with_replicas(replicas: &[&str]) -> Self {
        let resolver = Self::default();
        resolver.set_replicas(replicas);
        resolver
    }

    /// Replicas of one partition without a primary
    pub fn with_secondaries(replicas: &[&str]) -> Self {
        let resolver = Self::default();
        let addresses = resolver.addresses(replicas, false);
        resolver.state.write().addresses = addresses;
        resolver
    }

    /// Range reported with every resolution
    pub fn with_partition_key_range(self, range: PartitionKeyRange) -> Self {
        self.state.write().partition_key_range = Some(range);
        self
    }

    /// Collection reported with every resolution
    pub fn with_collection_rid(self, rid: impl Into<String>) -> Self {
        self.state.write().collection_rid = Some(rid.into());
        self
    }

    /// Replicas served to requests routed to region `location_index`
    pub fn with_region(self, location_index: usize, replicas: &[&str]) -> Self {
        let addresses = self.addresses(replicas, true);
        self.state.write().regions.insert(location_index, addresses);
        self
    }

    /// Replace the replica set; the first one is the primary
    pub fn set_replicas(&self, replicas: &[&str]) {
        let addresses = self.addresses(replicas, true);
        self.state.write().addresses = addresses;
    }

    /// Endpoint object for `uri`
    pub fn uri(&self, uri: &str) -> Option<Arc<TransportAddressUri>> {
        self.uris.lock().get(uri).cloned()
    }

    /// Make every resolution fail
    pub fn fail_with(&self, error: Error) {
        *self.failure.lock() = Some(error);
    }

    /// Stop failing
    pub fn clear_failure(&self) {
        *self.failure.lock() = None;
    }

    /// Resolutions so far
    pub fn resolve_count(&self) -> usize {
        self.resolve_count.load(Ordering::SeqCst)
    }

    /// Forced resolutions so far
    pub fn force_refresh_count(&self) -> usize {
        self.force_refresh_count.load(Ordering::SeqCst)
    }

    /// Server keys passed to [`AddressResolver::update`]
    pub fn invalidated(&self) -> Vec<String> {
        self.invalidated.lock().clone()
    }

    fn addresses(&self, replicas: &[&str], first_is_primary: bool) -> Vec<AddressInformation> {
        let mut uris = self.uris.lock();
        replicas
            .iter()
            .enumerate()
            .map(|(i, replica)| {
                let uri = uris
                    .entry(replica.to_string())
                    .or_insert_with(|| Arc::new(TransportAddressUri::new(*replica)))
                    .clone();
                let protocol = if replica.starts_with("https://") {
                    Protocol::Https
                } else {
                    Protocol::Rntbd
                };
                AddressInformation {
                    uri,
                    is_primary: first_is_primary && i == 0,
                    is_public: false,
                    protocol,
                }
            })
            .collect()
    }
}

#[async_trait]
impl AddressResolver for StaticAddressResolver {
    async fn resolve(
        &self,
        request: &ServiceRequest,
        force_refresh: bool,
        cancel: &CancellationToken,
    ) -> Result<Arc<PartitionAddressInformation>> {
        self.resolve_count.fetch_add(1, Ordering::SeqCst);
        if force_refresh {
            self.force_refresh_count.fetch_add(1, Ordering::SeqCst);
        }
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if let Some(error) = self.failure.lock().clone() {
            return Err(error);
        }

        let state = self.state.read();
        let addresses = request
            .context
            .location_index
            .and_then(|index| state.regions.get(&index))
            .unwrap_or(&state.addresses)
            .clone();
        Ok(Arc::new(PartitionAddressInformation {
            addresses,
            partition_key_range: state.partition_key_range.clone(),
            collection_rid: state.collection_rid.clone(),
        }))
    }

    async fn update(&self, server_key: &str) {
        self.invalidated.lock().push(server_key.to_string());
    }
}
