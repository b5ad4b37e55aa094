//! Header names and the header map exchanged with replicas
//!
//! Names are kept exactly as the service spells them. Lookups are
//! case-insensitive, so `x-ms-global-Committed-lsn` and
//! `x-ms-global-committed-lsn` address the same entry.

use std::collections::BTreeMap;
use std::fmt;

/// Partition-qualified session token(s)
pub const SESSION_TOKEN: &str = "x-ms-session-token";
/// Numeric sub-status code
pub const SUB_STATUS: &str = "x-ms-substatus";
/// Barrier target LSN
pub const TARGET_LSN: &str = "x-ms-target-lsn";
/// Barrier target global committed LSN
pub const TARGET_GLOBAL_COMMITTED_LSN: &str = "x-ms-target-global-committed-lsn";

/// Replica LSN
pub const LSN: &str = "lsn";
/// LSN acknowledged by the write quorum
pub const QUORUM_ACKED_LSN: &str = "x-ms-quorum-acked-lsn";
/// LSN durable across the read quorum of every region
pub const GLOBAL_COMMITTED_LSN: &str = "x-ms-global-Committed-lsn";
/// Number of read regions of the account
pub const NUMBER_OF_READ_REGIONS: &str = "x-ms-number-of-read-regions";
/// LSN of the returned item
pub const ITEM_LSN: &str = "x-ms-item-lsn";
/// Current replica set size of the partition
pub const CURRENT_REPLICA_SET_SIZE: &str = "x-ms-current-replica-set-size";
/// Current write quorum of the partition
pub const CURRENT_WRITE_QUORUM: &str = "x-ms-current-write-quorum";
/// Region-local LSN (multi-region writes)
pub const LOCAL_LSN: &str = "x-ms-cosmos-llsn";
/// Region-local quorum acknowledged LSN
pub const QUORUM_ACKED_LOCAL_LSN: &str = "x-ms-cosmos-quorum-acked-llsn";
/// Region-local item LSN
pub const ITEM_LOCAL_LSN: &str = "x-ms-cosmos-item-llsn";

/// Request units charged by the replica
pub const REQUEST_CHARGE: &str = "x-ms-request-charge";
/// Activity id correlating client and service traces
pub const ACTIVITY_ID: &str = "x-ms-activity-id";
/// Requested consistency level
pub const CONSISTENCY_LEVEL: &str = "x-ms-consistency-level";
/// Partition key range the replica belongs to
pub const PARTITION_KEY_RANGE_ID: &str = "x-ms-documentdb-partitionkeyrangeid";
/// Request timestamp (RFC 1123)
pub const X_DATE: &str = "x-ms-date";
/// Partition key of the addressed item
pub const PARTITION_KEY: &str = "x-ms-documentdb-partitionkey";
/// Resolved collection resource id
pub const COLLECTION_RID: &str = "x-ms-documentdb-collection-rid";

/// Case-insensitive header map
///
/// Keys are folded to lowercase on insert; the iteration order is the
/// lexicographic order of the folded keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: BTreeMap<String, String>,
}

impl Headers {
    /// Create an empty header map
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a header
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.entries.insert(name.to_ascii_lowercase(), value.into());
    }

    /// Builder-style insert
    pub fn with(mut self, name: &str, value: impl Into<String>) -> Self {
        self.set(name, value);
        self
    }

    /// Look up a header
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Remove a header, returning the previous value
    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.entries.remove(&name.to_ascii_lowercase())
    }

    /// Check whether a header is present
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(&name.to_ascii_lowercase())
    }

    /// Parse a numeric header; absent or malformed values yield `None`
    pub fn get_i64(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(|v| v.trim().parse().ok())
    }

    /// Parse a floating point header; absent or malformed values yield `None`
    pub fn get_f64(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(|v| v.trim().parse().ok())
    }

    /// Number of headers
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no header is set
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over `(name, value)` pairs, names lowercased
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl fmt::Display for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (name, value) in self.iter() {
            if !first {
                f.write_str(", ")?;
            }
            write!(f, "{}: {}", name, value)?;
            first = false;
        }
        Ok(())
    }
}
