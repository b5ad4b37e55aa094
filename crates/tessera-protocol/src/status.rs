//! Status and sub-status codes
//!
//! Status codes follow HTTP. Sub-status codes refine a status; several
//! numeric values are reused under different statuses (1002 is both
//! "read session not available" under 404 and "partition key range gone"
//! under 410), so a sub-status is only meaningful next to its status.

use serde::{Deserialize, Serialize};
use std::fmt;

/// HTTP-like status code returned by a replica
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StatusCode(pub u16);

impl StatusCode {
    /// 200
    pub const OK: Self = Self(200);
    /// 201
    pub const CREATED: Self = Self(201);
    /// 204
    pub const NO_CONTENT: Self = Self(204);
    /// 304
    pub const NOT_MODIFIED: Self = Self(304);
    /// 400
    pub const BAD_REQUEST: Self = Self(400);
    /// 404
    pub const NOT_FOUND: Self = Self(404);
    /// 408
    pub const REQUEST_TIMEOUT: Self = Self(408);
    /// 409
    pub const CONFLICT: Self = Self(409);
    /// 410
    pub const GONE: Self = Self(410);
    /// 412
    pub const PRECONDITION_FAILED: Self = Self(412);
    /// 429
    pub const TOO_MANY_REQUESTS: Self = Self(429);
    /// 449
    pub const RETRY_WITH: Self = Self(449);
    /// 500
    pub const INTERNAL_SERVER_ERROR: Self = Self(500);
    /// 503
    pub const SERVICE_UNAVAILABLE: Self = Self(503);

    /// First status treated as an error
    pub const STARTING_ERROR_CODE: Self = Self(400);

    /// Status below the error threshold
    pub fn is_success(self) -> bool {
        self < Self::STARTING_ERROR_CODE
    }

    /// Raw numeric value
    pub fn as_u16(self) -> u16 {
        self.0
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Sub-status code refining a [`StatusCode`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct SubStatusCode(pub u32);

impl SubStatusCode {
    /// No refinement
    pub const UNKNOWN: Self = Self(0);

    // 400
    /// Session token text is malformed
    pub const INVALID_SESSION_TOKEN: Self = Self(1001);
    /// Requested consistency is stronger than the account allows
    pub const INVALID_CONSISTENCY_LEVEL: Self = Self(1013);

    // 404
    /// The replica has not caught up with the caller's session
    pub const READ_SESSION_NOT_AVAILABLE: Self = Self(1002);

    // 410
    /// Cached name resolution is stale
    pub const NAME_CACHE_IS_STALE: Self = Self(1000);
    /// The partition key range was split or merged
    pub const PARTITION_KEY_RANGE_GONE: Self = Self(1002);
    /// A split is completing
    pub const COMPLETING_SPLIT: Self = Self(1007);
    /// A partition migration is completing
    pub const COMPLETING_PARTITION_MIGRATION: Self = Self(1008);

    // Client generated
    /// Gone raised by the transport layer
    pub const TRANSPORT_GENERATED_410: Self = Self(20001);
    /// Gone raised because the request budget elapsed
    pub const TIMEOUT_GENERATED_410: Self = Self(20002);
    /// Service unavailable raised by the transport layer
    pub const TRANSPORT_GENERATED_503: Self = Self(20003);

    // Raised by the replica coordination layer
    /// Global-strong write barrier did not converge
    pub const GLOBAL_STRONG_WRITE_BARRIER_NOT_MET: Self = Self(21010);
    /// Read quorum could not be established
    pub const READ_QUORUM_NOT_MET: Self = Self(21011);
    /// No replica returned a usable response
    pub const NO_VALID_STORE_RESPONSE: Self = Self(21012);

    /// Raw numeric value
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for SubStatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
