//! Outcome of one replica call
//!
//! A [`StoreResult`] is immutable once built and shared as
//! `Arc<StoreResult>`: the quorum-selected slot of a request context and the
//! list of contacted replicas may hold the same result, and it is released
//! when the last of them lets go.

use crate::error::Error;
use crate::transport::StoreResponse;
use tessera_protocol::{SessionToken, StatusCode, SubStatusCode, headers};

/// Replica outcome with the replication metadata quorum math needs
#[derive(Debug)]
pub struct StoreResult {
    response: Option<StoreResponse>,
    error: Option<Error>,
    /// Status returned or synthesized
    pub status: StatusCode,
    /// Sub-status returned or synthesized
    pub sub_status: SubStatusCode,
    /// Replica LSN, -1 when unknown
    pub lsn: i64,
    /// LSN acknowledged by the write quorum, -1 when unknown
    pub quorum_acked_lsn: i64,
    /// Global committed LSN, -1 when unknown
    pub global_committed_lsn: i64,
    /// LSN of the returned item, -1 when unknown
    pub item_lsn: i64,
    /// Read regions of the account, -1 when unknown
    pub number_of_read_regions: i64,
    /// Replica set size reported by the replica, -1 when unknown
    pub current_replica_set_size: i64,
    /// Write quorum reported by the replica, -1 when unknown
    pub current_write_quorum: i64,
    /// Replica's session token without its range prefix
    pub session_token: Option<SessionToken>,
    /// Range the replica belongs to
    pub partition_key_range_id: Option<String>,
    /// Request units charged
    pub request_charge: f64,
    /// Result may take part in quorum and session decisions
    pub is_valid: bool,
    /// Replica that produced the result
    pub endpoint: String,
    /// Health of every candidate replica when the read was issued
    pub replica_health: Vec<String>,
}

impl StoreResult {
    /// Wrap a replica response
    pub fn from_response(
        response: StoreResponse,
        endpoint: impl Into<String>,
        requires_valid_lsn: bool,
        use_local_lsn_headers: bool,
        replica_health: Vec<String>,
    ) -> Self {
        let endpoint = endpoint.into();
        let h = &response.headers;
        let pick = |local: &str, global: &str| -> i64 {
            let local = if use_local_lsn_headers {
                h.get_i64(local)
            } else {
                None
            };
            local.or_else(|| h.get_i64(global)).unwrap_or(-1)
        };

        let status = response.status;
        let sub_status = response.sub_status();
        let lsn = pick(headers::LOCAL_LSN, headers::LSN);
        let quorum_acked_lsn = pick(headers::QUORUM_ACKED_LOCAL_LSN, headers::QUORUM_ACKED_LSN);
        let item_lsn = pick(headers::ITEM_LOCAL_LSN, headers::ITEM_LSN);

        let (range_from_token, session_token) = match response.session_token() {
            Some(raw) => parse_response_token(raw, &endpoint),
            None => (None, None),
        };
        let partition_key_range_id = h
            .get(headers::PARTITION_KEY_RANGE_ID)
            .map(str::to_string)
            .or(range_from_token);

        let error = (!status.is_success()).then(|| {
            Error::from_status(
                status,
                sub_status,
                format!("Replica {} returned {}/{}", endpoint, status, sub_status),
            )
            .with_session_token(response.session_token())
        });

        Self {
            status,
            sub_status,
            lsn,
            quorum_acked_lsn,
            global_committed_lsn: h.get_i64(headers::GLOBAL_COMMITTED_LSN).unwrap_or(-1),
            item_lsn,
            number_of_read_regions: h.get_i64(headers::NUMBER_OF_READ_REGIONS).unwrap_or(-1),
            current_replica_set_size: h.get_i64(headers::CURRENT_REPLICA_SET_SIZE).unwrap_or(-1),
            current_write_quorum: h.get_i64(headers::CURRENT_WRITE_QUORUM).unwrap_or(-1),
            session_token,
            partition_key_range_id,
            request_charge: response.request_charge(),
            is_valid: is_valid(requires_valid_lsn, status, sub_status, lsn),
            endpoint,
            replica_health,
            error,
            response: Some(response),
        }
    }

    /// Wrap a failure that produced no replica response
    pub fn from_error(
        error: Error,
        endpoint: impl Into<String>,
        requires_valid_lsn: bool,
        replica_health: Vec<String>,
    ) -> Self {
        let status = error.status_code();
        let sub_status = error.sub_status();
        Self {
            response: None,
            error: Some(error),
            status,
            sub_status,
            lsn: -1,
            quorum_acked_lsn: -1,
            global_committed_lsn: -1,
            item_lsn: -1,
            number_of_read_regions: -1,
            current_replica_set_size: -1,
            current_write_quorum: -1,
            session_token: None,
            partition_key_range_id: None,
            request_charge: 0.0,
            is_valid: is_valid(requires_valid_lsn, status, sub_status, -1),
            endpoint: endpoint.into(),
            replica_health,
        }
    }

    /// Replica response, absent for transport failures
    pub fn response(&self) -> Option<&StoreResponse> {
        self.response.as_ref()
    }

    /// Error carried by the result
    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    /// True when the result carries no error
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// True for a 410 result
    pub fn is_gone(&self) -> bool {
        self.status == StatusCode::GONE
    }

    /// True when no replica response was received
    pub fn is_transport_failure(&self) -> bool {
        self.response.is_none()
    }

    /// The response, or the error the result carries
    pub fn to_response(&self) -> crate::Result<StoreResponse> {
        match (&self.error, &self.response) {
            (Some(error), _) => Err(error.clone()),
            (None, Some(response)) => Ok(response.clone()),
            (None, None) => Err(Error::internal(format!(
                "Store result from {} has neither response nor error",
                self.endpoint
            ))),
        }
    }
}

fn is_valid(requires_valid_lsn: bool, status: StatusCode, sub: SubStatusCode, lsn: i64) -> bool {
    !requires_valid_lsn
        || ((status != StatusCode::GONE || sub == SubStatusCode::NAME_CACHE_IS_STALE) && lsn >= 0)
}

fn parse_response_token(raw: &str, endpoint: &str) -> (Option<String>, Option<SessionToken>) {
    let range = raw
        .split_once(':')
        .map(|(range, _)| range.trim().to_string())
        .filter(|range| !range.is_empty());
    match SessionToken::parse(raw) {
        Ok(token) => (range, Some(token)),
        Err(e) => {
            tracing::debug!("Ignoring session token from {}: {}", endpoint, e);
            (range, None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{TransportError, TransportErrorCode};

    fn response(status: u16) -> StoreResponse {
        StoreResponse::new(StatusCode(status))
    }

    #[test]
    fn test_headers_are_extracted() {
        let response = response(200)
            .with_header(headers::LSN, "100")
            .with_header(headers::QUORUM_ACKED_LSN, "99")
            .with_header(headers::GLOBAL_COMMITTED_LSN, "90")
            .with_header(headers::NUMBER_OF_READ_REGIONS, "2")
            .with_header(headers::SESSION_TOKEN, "4:1#100#1=40")
            .with_header(headers::REQUEST_CHARGE, "1.5");
        let result = StoreResult::from_response(response, "rntbd://a/", true, true, vec![]);

        assert!(result.is_valid);
        assert!(result.is_success());
        assert_eq!(result.lsn, 100);
        assert_eq!(result.quorum_acked_lsn, 99);
        assert_eq!(result.global_committed_lsn, 90);
        assert_eq!(result.number_of_read_regions, 2);
        assert_eq!(result.partition_key_range_id.as_deref(), Some("4"));
        assert_eq!(result.session_token.as_ref().map(|t| t.lsn()), Some(100));
        assert_eq!(result.request_charge, 1.5);
        assert!(result.to_response().is_ok());
    }

    #[test]
    fn test_local_lsn_headers_take_precedence_when_enabled() {
        let build = || {
            response(200)
                .with_header(headers::LSN, "100")
                .with_header(headers::LOCAL_LSN, "40")
        };
        assert_eq!(
            StoreResult::from_response(build(), "a", true, true, vec![]).lsn,
            40
        );
        assert_eq!(
            StoreResult::from_response(build(), "a", true, false, vec![]).lsn,
            100
        );
    }

    #[test]
    fn test_validity_rules() {
        let missing_lsn = StoreResult::from_response(response(200), "a", true, true, vec![]);
        assert!(!missing_lsn.is_valid);

        let not_required = StoreResult::from_response(response(200), "a", false, true, vec![]);
        assert!(not_required.is_valid);

        let gone = StoreResult::from_response(
            response(410).with_header(headers::LSN, "5"),
            "a",
            true,
            true,
            vec![],
        );
        assert!(!gone.is_valid);
        assert!(gone.to_response().unwrap_err().is_gone());

        let stale_name_cache = StoreResult::from_response(
            response(410)
                .with_header(headers::LSN, "5")
                .with_header(headers::SUB_STATUS, "1000"),
            "a",
            true,
            true,
            vec![],
        );
        assert!(stale_name_cache.is_valid);

        let not_found = StoreResult::from_response(
            response(404).with_header(headers::LSN, "5"),
            "a",
            true,
            true,
            vec![],
        );
        assert!(not_found.is_valid);
        assert!(!not_found.is_success());
    }

    #[test]
    fn test_transport_failures() {
        let error = Error::from_transport(
            TransportError::new(TransportErrorCode::ConnectFailed, "a", "refused"),
            true,
        );
        let result = StoreResult::from_error(error, "a", true, vec![]);
        assert!(result.is_transport_failure());
        assert!(result.is_gone());
        assert!(!result.is_valid);
        assert_eq!(result.sub_status, SubStatusCode::TRANSPORT_GENERATED_410);
    }
}
