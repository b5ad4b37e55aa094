//! Error types for Tessera Core
//!
//! Every failure carries an HTTP-like status / sub-status pair. The
//! sub-status is what higher layers key their retry decisions on, so the
//! helpers below always take one explicitly.

use crate::transport::TransportError;
use std::sync::Arc;
use tessera_protocol::{ProtocolError, StatusCode, SubStatusCode};
use thiserror::Error;

/// Result type alias using Tessera Error
pub type Result<T> = std::result::Result<T, Error>;

/// Failures surfaced by the replica coordination layer
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Replica or partition moved, split or is unreachable (410)
    #[error("Gone ({sub_status}): {message}")]
    Gone {
        /// Refinement of the failure
        sub_status: SubStatusCode,
        /// Human readable context
        message: String,
        /// Transport failure behind the error, if any
        #[source]
        source: Option<Arc<TransportError>>,
    },

    /// Service could not serve the request (503)
    #[error("Service unavailable ({sub_status}): {message}")]
    ServiceUnavailable {
        /// Refinement of the failure
        sub_status: SubStatusCode,
        /// Human readable context
        message: String,
        /// Transport failure behind the error, if any
        #[source]
        source: Option<Arc<TransportError>>,
    },

    /// Resource does not exist, or the session is not yet readable (404)
    #[error("Not found ({sub_status}): {message}")]
    NotFound {
        /// Refinement of the failure
        sub_status: SubStatusCode,
        /// Human readable context
        message: String,
        /// Session token the replica answered with
        session_token: Option<String>,
    },

    /// Replica reported a request timeout (408)
    #[error("Request timeout ({sub_status}): {message}")]
    RequestTimeout {
        /// Refinement of the failure
        sub_status: SubStatusCode,
        /// Human readable context
        message: String,
    },

    /// Request is malformed (400)
    #[error("Bad request ({sub_status}): {message}")]
    BadRequest {
        /// Refinement of the failure
        sub_status: SubStatusCode,
        /// Human readable context
        message: String,
    },

    /// Any other error status returned by a replica (409, 412, 429, ...)
    #[error("Store error {status} ({sub_status}): {message}")]
    Store {
        /// Status returned by the replica
        status: StatusCode,
        /// Sub-status returned by the replica
        sub_status: SubStatusCode,
        /// Human readable context
        message: String,
        /// Session token the replica answered with
        session_token: Option<String>,
    },

    /// Protocol invariant violation on either side of the wire (500)
    #[error("Internal error: {0}")]
    Internal(String),

    /// The caller cancelled the operation
    #[error("Operation cancelled")]
    Cancelled,
}

impl Error {
    /// Create a Gone error
    pub fn gone(sub_status: SubStatusCode, message: impl Into<String>) -> Self {
        Self::Gone {
            sub_status,
            message: message.into(),
            source: None,
        }
    }

    /// Create a service unavailable error
    pub fn service_unavailable(sub_status: SubStatusCode, message: impl Into<String>) -> Self {
        Self::ServiceUnavailable {
            sub_status,
            message: message.into(),
            source: None,
        }
    }

    /// Create a not found error
    pub fn not_found(sub_status: SubStatusCode, message: impl Into<String>) -> Self {
        Self::NotFound {
            sub_status,
            message: message.into(),
            session_token: None,
        }
    }

    /// Create a bad request error
    pub fn bad_request(sub_status: SubStatusCode, message: impl Into<String>) -> Self {
        Self::BadRequest {
            sub_status,
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Build the error matching a replica's error status
    pub fn from_status(
        status: StatusCode,
        sub_status: SubStatusCode,
        message: impl Into<String>,
    ) -> Self {
        let message = message.into();
        match status {
            StatusCode::GONE => Self::gone(sub_status, message),
            StatusCode::SERVICE_UNAVAILABLE => Self::service_unavailable(sub_status, message),
            StatusCode::NOT_FOUND => Self::not_found(sub_status, message),
            StatusCode::REQUEST_TIMEOUT => Self::RequestTimeout {
                sub_status,
                message,
            },
            StatusCode::BAD_REQUEST => Self::bad_request(sub_status, message),
            StatusCode::INTERNAL_SERVER_ERROR => Self::Internal(message),
            _ => Self::Store {
                status,
                sub_status,
                message,
                session_token: None,
            },
        }
    }

    /// Translate a transport failure
    ///
    /// Reads, and writes whose payload never left the client, are safe to
    /// replay and become Gone. A write that may have been applied becomes
    /// ServiceUnavailable so it is not blindly retried.
    pub fn from_transport(error: TransportError, read_only: bool) -> Self {
        let replayable = read_only || !error.payload_sent;
        let message = error.to_string();
        let source = Some(Arc::new(error));
        if replayable {
            Self::Gone {
                sub_status: SubStatusCode::TRANSPORT_GENERATED_410,
                message,
                source,
            }
        } else {
            Self::ServiceUnavailable {
                sub_status: SubStatusCode::TRANSPORT_GENERATED_503,
                message,
                source,
            }
        }
    }

    /// HTTP-like status of the error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Gone { .. } => StatusCode::GONE,
            Self::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::RequestTimeout { .. } => StatusCode::REQUEST_TIMEOUT,
            Self::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Self::Store { status, .. } => *status,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Cancelled => StatusCode::REQUEST_TIMEOUT,
        }
    }

    /// Sub-status of the error
    pub fn sub_status(&self) -> SubStatusCode {
        match self {
            Self::Gone { sub_status, .. }
            | Self::ServiceUnavailable { sub_status, .. }
            | Self::NotFound { sub_status, .. }
            | Self::RequestTimeout { sub_status, .. }
            | Self::BadRequest { sub_status, .. }
            | Self::Store { sub_status, .. } => *sub_status,
            Self::Internal(_) | Self::Cancelled => SubStatusCode::UNKNOWN,
        }
    }

    /// True for any 410
    pub fn is_gone(&self) -> bool {
        matches!(self, Self::Gone { .. })
    }

    /// True for 404 / ReadSessionNotAvailable
    pub fn is_read_session_not_available(&self) -> bool {
        matches!(
            self,
            Self::NotFound { sub_status, .. }
                if *sub_status == SubStatusCode::READ_SESSION_NOT_AVAILABLE
        )
    }

    /// Attach the session token of the replica response behind the error
    ///
    /// Only replica answers that still advance the session (404 and the
    /// other store statuses) keep it.
    pub fn with_session_token(mut self, token: Option<&str>) -> Self {
        if let Self::NotFound { session_token, .. } | Self::Store { session_token, .. } = &mut self
        {
            *session_token = token.map(str::to_string);
        }
        self
    }

    /// Session token of the replica response behind the error, if any
    pub fn session_token(&self) -> Option<&str> {
        match self {
            Self::NotFound { session_token, .. } | Self::Store { session_token, .. } => {
                session_token.as_deref()
            }
            _ => None,
        }
    }

    /// Transport failure behind the error, if any
    pub fn transport(&self) -> Option<&TransportError> {
        match self {
            Self::Gone { source, .. } | Self::ServiceUnavailable { source, .. } => {
                source.as_deref()
            }
            _ => None,
        }
    }

    /// Re-label a Gone as ServiceUnavailable, keeping sub-status and source
    pub fn into_service_unavailable(self) -> Self {
        match self {
            Self::Gone {
                sub_status,
                message,
                source,
            } => Self::ServiceUnavailable {
                sub_status,
                message,
                source,
            },
            other => other,
        }
    }
}

impl From<ProtocolError> for Error {
    fn from(error: ProtocolError) -> Self {
        match error {
            ProtocolError::InvalidSessionToken(_) => {
                Self::bad_request(SubStatusCode::INVALID_SESSION_TOKEN, error.to_string())
            }
            ProtocolError::InvalidConsistencyLevel(_) => {
                Self::bad_request(SubStatusCode::INVALID_CONSISTENCY_LEVEL, error.to_string())
            }
            ProtocolError::RegionSetMismatch { .. } | ProtocolError::IncompatibleTokens { .. } => {
                Self::Internal(error.to_string())
            }
        }
    }
}
