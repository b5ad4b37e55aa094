//! Consistency levels

use crate::error::{ProtocolError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Consistency level requested by a caller or configured on the account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ConsistencyLevel {
    /// Linearizable reads
    Strong,
    /// Reads lag writes by a bounded amount
    BoundedStaleness,
    /// Read-your-writes within a session token
    #[default]
    Session,
    /// Reads never observe out-of-order writes
    ConsistentPrefix,
    /// No ordering guarantee
    Eventual,
}

impl ConsistencyLevel {
    /// Relative strength, higher is stronger
    pub fn strength(self) -> u8 {
        match self {
            Self::Strong => 4,
            Self::BoundedStaleness => 3,
            Self::Session => 2,
            Self::ConsistentPrefix => 1,
            Self::Eventual => 0,
        }
    }

    /// True when `self` is strictly stronger than `other`
    pub fn is_stronger_than(self, other: Self) -> bool {
        self.strength() > other.strength()
    }

    /// Wire name
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Strong => "Strong",
            Self::BoundedStaleness => "BoundedStaleness",
            Self::Session => "Session",
            Self::ConsistentPrefix => "ConsistentPrefix",
            Self::Eventual => "Eventual",
        }
    }
}

impl fmt::Display for ConsistencyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConsistencyLevel {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            v if v.eq_ignore_ascii_case("Strong") => Ok(Self::Strong),
            v if v.eq_ignore_ascii_case("BoundedStaleness") => Ok(Self::BoundedStaleness),
            v if v.eq_ignore_ascii_case("Session") => Ok(Self::Session),
            v if v.eq_ignore_ascii_case("ConsistentPrefix") => Ok(Self::ConsistentPrefix),
            v if v.eq_ignore_ascii_case("Eventual") => Ok(Self::Eventual),
            other => Err(ProtocolError::InvalidConsistencyLevel(other.to_string())),
        }
    }
}
