//! Read dispatch by consistency level
//!
//! | Consistency                       | Pinned replica | Read mode        |
//! |-----------------------------------|----------------|------------------|
//! | any                               | yes            | Primary          |
//! | Eventual, ConsistentPrefix        | no             | Any              |
//! | Session                           | no             | Any (session)    |
//! | BoundedStaleness                  | no             | BoundedStaleness |
//! | Strong                            | no             | Strong           |
//!
//! With `quorum_reads_enabled` off, BoundedStaleness and Strong reads that
//! are not pinned fall back to Any.

use crate::config::DirectConfig;
use crate::error::{Error, Result};
use crate::quorum_reader::QuorumReader;
use crate::request::{ReadMode, ServiceRequest};
use crate::store_reader::StoreReader;
use crate::transport::StoreResponse;
use std::sync::Arc;
use tessera_protocol::{ConsistencyLevel, StatusCode, SubStatusCode, headers};

/// Consistency level a request runs at
///
/// A `x-ms-consistency-level` header may only weaken the account level.
pub fn resolve_consistency_level(
    account: ConsistencyLevel,
    request: &ServiceRequest,
) -> Result<ConsistencyLevel> {
    let Some(raw) = request.headers.get(headers::CONSISTENCY_LEVEL) else {
        return Ok(account);
    };
    let requested: ConsistencyLevel = raw.parse()?;
    if requested.is_stronger_than(account) {
        return Err(Error::bad_request(
            SubStatusCode::INVALID_CONSISTENCY_LEVEL,
            format!(
                "Consistency level {} is stronger than the account level {}",
                requested, account
            ),
        ));
    }
    Ok(requested)
}

/// Requested consistency override carried by the request header, if valid
pub fn requested_consistency_level(request: &ServiceRequest) -> Option<ConsistencyLevel> {
    request
        .headers
        .get(headers::CONSISTENCY_LEVEL)
        .and_then(|raw| raw.parse().ok())
}

/// Routes reads to the primary, one replica or a quorum
#[derive(Clone)]
pub struct ConsistencyReader {
    store_reader: StoreReader,
    quorum_reader: QuorumReader,
    config: Arc<DirectConfig>,
}

impl ConsistencyReader {
    /// Create a reader
    pub fn new(store_reader: StoreReader, config: Arc<DirectConfig>) -> Self {
        let quorum_reader = QuorumReader::new(store_reader.clone(), config.clone());
        Self {
            store_reader,
            quorum_reader,
            config,
        }
    }

    /// Read mode and effective consistency of `request`
    pub fn deduce_read_mode(
        &self,
        request: &ServiceRequest,
    ) -> Result<(ReadMode, ConsistencyLevel)> {
        let level = resolve_consistency_level(self.config.account_consistency, request)?;
        if request.default_replica_index.is_some() {
            return Ok((ReadMode::Primary, level));
        }

        let mode = match level {
            ConsistencyLevel::Eventual
            | ConsistencyLevel::ConsistentPrefix
            | ConsistencyLevel::Session => ReadMode::Any,
            _ if !self.config.quorum_reads_enabled => ReadMode::Any,
            ConsistencyLevel::BoundedStaleness => ReadMode::BoundedStaleness,
            ConsistencyLevel::Strong => ReadMode::Strong,
        };
        Ok((mode, level))
    }

    /// Read `request` at its effective consistency
    pub async fn read(&self, request: &mut ServiceRequest) -> Result<StoreResponse> {
        let (mode, level) = self.deduce_read_mode(request)?;
        if request.context.original_consistency.is_none() {
            request.context.original_consistency = requested_consistency_level(request);
        }
        tracing::debug!(
            "Reading {} in {:?} mode at {} consistency",
            request.resource_address,
            mode,
            level
        );

        match mode {
            ReadMode::Primary => self.read_primary(request, level == ConsistencyLevel::Session).await,
            ReadMode::Any if level == ConsistencyLevel::Session => self.read_session(request).await,
            ReadMode::Any => self.read_any(request).await,
            ReadMode::BoundedStaleness | ReadMode::Strong => {
                self.quorum_reader
                    .read_strong(request, self.config.read_quorum(), mode)
                    .await
            }
        }
    }

    async fn read_primary(
        &self,
        request: &mut ServiceRequest,
        use_session_token: bool,
    ) -> Result<StoreResponse> {
        let result = self
            .store_reader
            .read_primary(request, false, use_session_token)
            .await?;
        if !result.is_valid {
            return Err(result.error().cloned().unwrap_or_else(|| {
                Error::gone(SubStatusCode::UNKNOWN, "Invalid primary response")
            }));
        }
        result.to_response()
    }

    async fn read_any(&self, request: &mut ServiceRequest) -> Result<StoreResponse> {
        let responses = self
            .store_reader
            .read_multiple_replicas(request, true, 1, false, false, ReadMode::Any, false)
            .await?;
        match responses.first() {
            Some(result) => result.to_response(),
            None => Err(Error::gone(
                SubStatusCode::UNKNOWN,
                format!("No replica answered for {}", request.resource_address),
            )),
        }
    }

    async fn read_session(&self, request: &mut ServiceRequest) -> Result<StoreResponse> {
        let responses = self
            .store_reader
            .read_multiple_replicas(request, true, 1, true, true, ReadMode::Any, true)
            .await?;

        let Some(result) = responses.first() else {
            return Err(read_session_not_available(request));
        };

        if result.status == StatusCode::NOT_FOUND {
            let caught_up = match (&request.context.session_token, &result.session_token) {
                (None, _) => true,
                (Some(expected), Some(actual)) => expected.is_valid(actual)?,
                (Some(_), None) => false,
            };
            if !caught_up {
                return Err(read_session_not_available(request));
            }
        }
        result.to_response()
    }
}

fn read_session_not_available(request: &ServiceRequest) -> Error {
    Error::not_found(
        SubStatusCode::READ_SESSION_NOT_AVAILABLE,
        format!(
            "No replica has caught up with the session of {}",
            request.resource_address
        ),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{AddressSelector, RoundRobinAddressEnumerator};
    use crate::context::PartitionKeyRange;
    use crate::request::{OperationType, Protocol, ResourceType};
    use crate::session::InMemorySessionContainer;
    use crate::testing::{ResponseBuilder, ScriptedTransport, StaticAddressResolver};
    use crate::timeout::TimeoutHelper;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    const REPLICAS: [&str; 4] = ["rntbd://p/", "rntbd://s1/", "rntbd://s2/", "rntbd://s3/"];

    fn reader(transport: &Arc<ScriptedTransport>, config: DirectConfig) -> ConsistencyReader {
        let config = Arc::new(config);
        let resolver = StaticAddressResolver::with_replicas(&REPLICAS)
            .with_partition_key_range(PartitionKeyRange::new("0"));
        let store_reader = StoreReader::new(
            transport.clone(),
            AddressSelector::new(Arc::new(resolver), Protocol::Rntbd),
            Arc::new(RoundRobinAddressEnumerator::default()),
            Arc::new(InMemorySessionContainer::new()),
            config.clone(),
        );
        ConsistencyReader::new(store_reader, config)
    }

    fn request() -> ServiceRequest {
        let mut request = ServiceRequest::new(
            OperationType::Read,
            ResourceType::Document,
            "dbs/db/colls/c/docs/1",
        );
        request.context.timeout =
            Some(TimeoutHelper::new(Duration::from_secs(30), CancellationToken::new()));
        request
    }

    #[test]
    fn test_read_mode_table() {
        let transport = Arc::new(ScriptedTransport::new());
        let strong = reader(&transport, DirectConfig::strong());

        assert_eq!(strong.deduce_read_mode(&request()).unwrap().0, ReadMode::Strong);
        let bounded = request().with_consistency_level(ConsistencyLevel::BoundedStaleness);
        assert_eq!(strong.deduce_read_mode(&bounded).unwrap().0, ReadMode::BoundedStaleness);
        let eventual = request().with_consistency_level(ConsistencyLevel::Eventual);
        assert_eq!(strong.deduce_read_mode(&eventual).unwrap().0, ReadMode::Any);
        let pinned = request().with_default_replica_index(2);
        assert_eq!(strong.deduce_read_mode(&pinned).unwrap().0, ReadMode::Primary);

        let session = reader(&transport, DirectConfig::default());
        assert_eq!(session.deduce_read_mode(&request()).unwrap(), (ReadMode::Any, ConsistencyLevel::Session));

        let no_quorum = reader(&transport, DirectConfig::strong().with_quorum_reads(false));
        assert_eq!(no_quorum.deduce_read_mode(&request()).unwrap().0, ReadMode::Any);
    }

    #[test]
    fn test_consistency_override_may_only_weaken() {
        let strong_request = request().with_consistency_level(ConsistencyLevel::Strong);
        let err = resolve_consistency_level(ConsistencyLevel::Session, &strong_request).unwrap_err();
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(err.sub_status(), SubStatusCode::INVALID_CONSISTENCY_LEVEL);

        let unknown = request().with_header(headers::CONSISTENCY_LEVEL, "Linearizable");
        assert_eq!(
            resolve_consistency_level(ConsistencyLevel::Strong, &unknown)
                .unwrap_err()
                .status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            resolve_consistency_level(ConsistencyLevel::Strong, &request()).unwrap(),
            ConsistencyLevel::Strong
        );
    }

    #[tokio::test]
    async fn test_stale_not_found_becomes_read_session_not_available() {
        let transport = Arc::new(ScriptedTransport::new());
        for endpoint in REPLICAS {
            transport.on(endpoint, |_| ResponseBuilder::not_found().lsn(5).session("0:5").reply());
        }
        let reader = reader(&transport, DirectConfig::default());

        let mut request = request().with_header(headers::SESSION_TOKEN, "0:9");
        let err = reader.read(&mut request).await.unwrap_err();
        assert!(err.is_read_session_not_available());
    }

    #[tokio::test]
    async fn test_caught_up_not_found_is_plain_not_found() {
        let transport = Arc::new(ScriptedTransport::new());
        for endpoint in REPLICAS {
            transport.on(endpoint, |_| ResponseBuilder::not_found().lsn(9).session("0:9").reply());
        }
        let reader = reader(&transport, DirectConfig::default());

        let mut request = request().with_header(headers::SESSION_TOKEN, "0:9");
        let err = reader.read(&mut request).await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
        assert!(!err.is_read_session_not_available());
    }

    #[tokio::test]
    async fn test_eventual_read_uses_one_replica() {
        let transport = Arc::new(ScriptedTransport::new());
        for endpoint in REPLICAS {
            transport.on(endpoint, |_| ResponseBuilder::ok().lsn(1).reply());
        }
        let reader = reader(&transport, DirectConfig::default());

        let mut request = request().with_consistency_level(ConsistencyLevel::Eventual);
        reader.read(&mut request).await.unwrap();
        assert_eq!(transport.calls().len(), 1);
        assert_eq!(request.context.original_consistency, Some(ConsistencyLevel::Eventual));
    }

    #[tokio::test]
    async fn test_pinned_read_goes_to_that_replica() {
        let transport = Arc::new(ScriptedTransport::new());
        for endpoint in REPLICAS {
            transport.on(endpoint, |_| ResponseBuilder::ok().lsn(1).reply());
        }
        let reader = reader(&transport, DirectConfig::strong());

        let mut request = request().with_default_replica_index(2);
        reader.read(&mut request).await.unwrap();
        assert_eq!(transport.calls_to("rntbd://s2/"), 1);
        assert_eq!(transport.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_strong_read_goes_through_quorum() {
        let transport = Arc::new(ScriptedTransport::new());
        for endpoint in REPLICAS {
            transport.on(endpoint, |_| ResponseBuilder::ok().lsn(4).reply());
        }
        let reader = reader(&transport, DirectConfig::strong());

        reader.read(&mut request()).await.unwrap();
        assert_eq!(transport.calls().len(), 2);
        assert_eq!(transport.calls_to("rntbd://p/"), 0);
    }
}
