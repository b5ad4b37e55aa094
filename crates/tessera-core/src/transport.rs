//! Transport contract
//!
//! The byte-level framing and connection pooling live behind
//! [`TransportClient`]. A replica's answer, including error statuses, comes
//! back as a [`StoreResponse`]; only failures to get an answer at all are
//! reported as [`TransportError`].

use crate::request::ServiceRequest;
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use tessera_protocol::{Headers, StatusCode, SubStatusCode, headers};
use thiserror::Error;
use uuid::Uuid;

/// Raw response of one replica
#[derive(Debug, Clone)]
pub struct StoreResponse {
    /// HTTP-like status
    pub status: StatusCode,
    /// Response headers
    pub headers: Headers,
    /// Response body
    pub body: Option<Bytes>,
}

impl StoreResponse {
    /// Create a response with no headers and no body
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: None,
        }
    }

    /// Builder-style header insert
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.set(name, value);
        self
    }

    /// Builder-style body
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Sub-status header; absent means unknown
    pub fn sub_status(&self) -> SubStatusCode {
        self.headers
            .get_i64(headers::SUB_STATUS)
            .and_then(|v| u32::try_from(v).ok())
            .map(SubStatusCode)
            .unwrap_or_default()
    }

    /// Session token header, still partition qualified
    pub fn session_token(&self) -> Option<&str> {
        self.headers.get(headers::SESSION_TOKEN)
    }

    /// Request charge header
    pub fn request_charge(&self) -> f64 {
        self.headers.get_f64(headers::REQUEST_CHARGE).unwrap_or(0.0)
    }
}

/// Classified transport failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportErrorCode {
    /// TCP / TLS connect failed
    ConnectFailed,
    /// Connect did not finish in time
    ConnectTimeout,
    /// Request could not be written
    SendFailed,
    /// Whole request exceeded its budget
    RequestTimeout,
    /// No response arrived in time
    ReceiveTimeout,
    /// Response could not be read
    ReceiveFailed,
    /// Connection dropped mid-request
    ConnectionBroken,
    /// Channel was closed locally
    ChannelClosed,
}

impl TransportErrorCode {
    /// True for the timeout family
    pub fn is_timeout(self) -> bool {
        matches!(
            self,
            Self::ConnectTimeout | Self::RequestTimeout | Self::ReceiveTimeout
        )
    }
}

impl fmt::Display for TransportErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Transport failure with the context needed to decide whether a replay is
/// safe
#[derive(Error, Debug, Clone)]
#[error("{code} at {endpoint} (activity {activity_id}, payload sent: {payload_sent}): {message}")]
pub struct TransportError {
    /// Failure class
    pub code: TransportErrorCode,
    /// Replica endpoint
    pub endpoint: String,
    /// Activity id of the request
    pub activity_id: Uuid,
    /// Whether any of the request payload reached the wire
    pub payload_sent: bool,
    /// Detail
    pub message: String,
}

impl TransportError {
    /// Create a transport error; the payload is assumed unsent
    pub fn new(
        code: TransportErrorCode,
        endpoint: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            code,
            endpoint: endpoint.into(),
            activity_id: Uuid::nil(),
            payload_sent: false,
            message: message.into(),
        }
    }

    /// Mark whether the payload was sent
    pub fn with_payload_sent(mut self, payload_sent: bool) -> Self {
        self.payload_sent = payload_sent;
        self
    }

    /// Attach the request's activity id
    pub fn with_activity_id(mut self, activity_id: Uuid) -> Self {
        self.activity_id = activity_id;
        self
    }
}

/// Sends one request to one replica
#[async_trait]
pub trait TransportClient: Send + Sync {
    /// Invoke `request` at `endpoint`
    async fn invoke(
        &self,
        endpoint: &str,
        request: &ServiceRequest,
    ) -> std::result::Result<StoreResponse, TransportError>;
}
