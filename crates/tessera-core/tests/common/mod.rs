//! Shared fixtures for integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::Once;
use tessera_core::address::RoundRobinAddressEnumerator;
use tessera_core::context::PartitionKeyRange;
use tessera_core::session::InMemorySessionContainer;
use tessera_core::testing::{ScriptedTransport, StaticAddressResolver};
use tessera_core::{DirectConfig, OperationType, ReplicatedResourceClient, ResourceType, ServiceRequest};

pub const PRIMARY: &str = "rntbd://replica-0:10250/";
pub const REPLICAS: [&str; 4] = [
    "rntbd://replica-0:10250/",
    "rntbd://replica-1:10250/",
    "rntbd://replica-2:10250/",
    "rntbd://replica-3:10250/",
];
pub const DOCUMENT: &str = "dbs/inventory/colls/items/docs/sku-1";

static TRACING: Once = Once::new();

/// Route `tracing` output to the test harness; `RUST_LOG` picks the level
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "tessera_core=debug".into()),
            )
            .with_test_writer()
            .try_init();
    });
}

pub struct Harness {
    pub transport: Arc<ScriptedTransport>,
    pub resolver: Arc<StaticAddressResolver>,
    pub sessions: Arc<InMemorySessionContainer>,
    pub client: ReplicatedResourceClient,
}

/// Client over `replicas` (first is the primary) with scripted replicas
pub fn harness(config: DirectConfig, replicas: &[&str]) -> Harness {
    init_tracing();
    let transport = Arc::new(ScriptedTransport::new());
    let resolver = Arc::new(
        StaticAddressResolver::with_replicas(replicas)
            .with_partition_key_range(PartitionKeyRange::new("0"))
            .with_collection_rid("items-rid"),
    );
    let sessions = Arc::new(InMemorySessionContainer::new());
    let client = ReplicatedResourceClient::new(
        config,
        transport.clone(),
        resolver.clone(),
        sessions.clone(),
    )
    .expect("valid configuration")
    .with_address_enumerator(Arc::new(RoundRobinAddressEnumerator::default()));

    Harness {
        transport,
        resolver,
        sessions,
        client,
    }
}

pub fn read_document() -> ServiceRequest {
    ServiceRequest::new(OperationType::Read, ResourceType::Document, DOCUMENT)
}

pub fn create_document() -> ServiceRequest {
    ServiceRequest::new(OperationType::Create, ResourceType::Document, DOCUMENT)
        .with_body(&b"{\"id\":\"sku-1\"}"[..])
}
