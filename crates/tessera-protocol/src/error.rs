//! Error types for the wire contract

use thiserror::Error;

/// Result type alias using [`ProtocolError`]
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Violations of the wire contract
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Session token text does not follow the grammar
    #[error("Invalid session token: {0}")]
    InvalidSessionToken(String),

    /// Two vector tokens of the same version disagree on their region set
    #[error("Region set mismatch at session token version {version}: {left} vs {right}")]
    RegionSetMismatch {
        /// Shared token version
        version: i64,
        /// First token
        left: String,
        /// Second token
        right: String,
    },

    /// A simple token was compared with or merged into a vector token
    #[error("Incompatible session tokens: {left} vs {right}")]
    IncompatibleTokens {
        /// First token
        left: String,
        /// Second token
        right: String,
    },

    /// Unknown consistency level name
    #[error("Invalid consistency level: {0}")]
    InvalidConsistencyLevel(String),
}

impl ProtocolError {
    /// Create an invalid session token error
    pub fn invalid_session_token(token: impl Into<String>) -> Self {
        Self::InvalidSessionToken(token.into())
    }

    /// True when the error signals a bug on either side of the wire rather
    /// than malformed caller input
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            Self::RegionSetMismatch { .. } | Self::IncompatibleTokens { .. }
        )
    }
}
