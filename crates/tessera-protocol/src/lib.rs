//! Tessera Protocol - the direct-mode wire contract
//!
//! Everything in this crate has to match the service byte-for-byte:
//! - Header names and the case-insensitive header map ([`headers`])
//! - Status and sub-status codes ([`status`])
//! - Consistency level names ([`consistency`])
//! - Session tokens and their string grammar ([`session_token`])
//!
//! # Session token grammar
//!
//! ```text
//! simple   := lsn
//! vector   := version '#' global_lsn ( '#' region_id '=' local_lsn )*
//! qualified:= partition_key_range_id ':' ( simple | vector )
//! compound := qualified ( ',' qualified )*
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod consistency;
pub mod error;
pub mod headers;
pub mod session_token;
pub mod status;

pub use consistency::ConsistencyLevel;
pub use error::{ProtocolError, Result};
pub use headers::Headers;
pub use session_token::{
    SessionToken, SimpleSessionToken, VectorSessionToken, format_qualified, parse_compound,
    parse_qualified,
};
pub use status::{StatusCode, SubStatusCode};
