//! Session tokens
//!
//! A session token is a progress marker a client carries between requests so
//! that it never observes a replica older than its own prior writes.
//!
//! - [`SimpleSessionToken`]: one global LSN (pre-partitioned protocol)
//! - [`VectorSessionToken`]: a version, a global LSN and one local LSN per
//!   write region
//!
//! `a.is_valid(&b)` answers "does `b` satisfy the progress recorded in `a`";
//! the request's token is always the receiver and the replica's token the
//! argument.

use crate::error::{ProtocolError, Result};
use std::fmt;
use std::str::FromStr;

const SEGMENT_SEPARATOR: char = '#';
const REGION_PROGRESS_SEPARATOR: char = '=';
const PARTITION_SEPARATOR: char = ':';
const COMPOUND_SEPARATOR: char = ',';

/// Session token of the legacy single-LSN protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SimpleSessionToken {
    lsn: i64,
}

impl SimpleSessionToken {
    /// Create a token at `lsn`
    pub fn new(lsn: i64) -> Self {
        Self { lsn }
    }

    /// Global LSN
    pub fn lsn(&self) -> i64 {
        self.lsn
    }

    /// True when `other` has progressed at least as far as `self`
    pub fn is_valid(&self, other: &SimpleSessionToken) -> bool {
        other.lsn >= self.lsn
    }

    /// The later of the two tokens
    pub fn merge(&self, other: &SimpleSessionToken) -> SimpleSessionToken {
        Self::new(self.lsn.max(other.lsn))
    }

    fn try_parse(text: &str) -> Option<Self> {
        text.parse::<i64>().ok().map(Self::new)
    }
}

impl fmt::Display for SimpleSessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.lsn)
    }
}

/// Session token carrying per-region progress
///
/// Two tokens with the same `version` describe the same set of write regions;
/// anything else is a protocol violation reported as
/// [`ProtocolError::RegionSetMismatch`]. Region order is kept as received so a
/// parsed token prints back exactly as it was read.
#[derive(Debug, Clone)]
pub struct VectorSessionToken {
    version: i64,
    global_lsn: i64,
    local_lsn_by_region: Vec<(u32, i64)>,
}

impl VectorSessionToken {
    /// Create a token; a region listed twice keeps its last LSN
    pub fn new(
        version: i64,
        global_lsn: i64,
        regions: impl IntoIterator<Item = (u32, i64)>,
    ) -> Self {
        let mut local_lsn_by_region: Vec<(u32, i64)> = Vec::new();
        for (region, lsn) in regions {
            match local_lsn_by_region.iter_mut().find(|(r, _)| *r == region) {
                Some(entry) => entry.1 = lsn,
                None => local_lsn_by_region.push((region, lsn)),
            }
        }
        Self {
            version,
            global_lsn,
            local_lsn_by_region,
        }
    }

    /// Topology version of the partition
    pub fn version(&self) -> i64 {
        self.version
    }

    /// Global LSN
    pub fn global_lsn(&self) -> i64 {
        self.global_lsn
    }

    /// Local LSN recorded for `region`
    pub fn local_lsn(&self, region: u32) -> Option<i64> {
        self.local_lsn_by_region
            .iter()
            .find(|(r, _)| *r == region)
            .map(|(_, lsn)| *lsn)
    }

    /// Regions in token order
    pub fn regions(&self) -> impl Iterator<Item = (u32, i64)> + '_ {
        self.local_lsn_by_region.iter().copied()
    }

    /// True when `other` has progressed at least as far as `self` in its
    /// version, its global LSN and every region of `self`
    pub fn is_valid(&self, other: &VectorSessionToken) -> Result<bool> {
        if other.version < self.version || other.global_lsn < self.global_lsn {
            return Ok(false);
        }

        let same_version = other.version == self.version;
        if same_version && other.local_lsn_by_region.len() != self.local_lsn_by_region.len() {
            return Err(self.region_mismatch(other));
        }

        for (region, lsn) in self.regions() {
            match other.local_lsn(region) {
                Some(other_lsn) if other_lsn < lsn => return Ok(false),
                Some(_) => {}
                None if same_version => return Err(self.region_mismatch(other)),
                // Region left the topology in a later version
                None => {}
            }
        }

        Ok(true)
    }

    /// Element-wise maximum; the region set of the higher version wins
    pub fn merge(&self, other: &VectorSessionToken) -> Result<VectorSessionToken> {
        let same_version = self.version == other.version;
        if same_version && self.local_lsn_by_region.len() != other.local_lsn_by_region.len() {
            return Err(self.region_mismatch(other));
        }

        let (higher, lower) = if self.version < other.version {
            (other, self)
        } else {
            (self, other)
        };

        let mut merged = Vec::with_capacity(higher.local_lsn_by_region.len());
        for (region, lsn) in higher.regions() {
            match lower.local_lsn(region) {
                Some(lower_lsn) => merged.push((region, lsn.max(lower_lsn))),
                None if same_version => return Err(self.region_mismatch(other)),
                None => merged.push((region, lsn)),
            }
        }

        Ok(VectorSessionToken {
            version: higher.version,
            global_lsn: self.global_lsn.max(other.global_lsn),
            local_lsn_by_region: merged,
        })
    }

    fn region_mismatch(&self, other: &VectorSessionToken) -> ProtocolError {
        ProtocolError::RegionSetMismatch {
            version: self.version,
            left: self.to_string(),
            right: other.to_string(),
        }
    }

    fn try_parse(text: &str) -> Option<Self> {
        let mut segments = text.split(SEGMENT_SEPARATOR);
        let version = segments.next()?.parse::<i64>().ok()?;
        let global_lsn = segments.next()?.parse::<i64>().ok()?;

        let mut regions: Vec<(u32, i64)> = Vec::new();
        for segment in segments {
            let (region, lsn) = segment.split_once(REGION_PROGRESS_SEPARATOR)?;
            if lsn.contains(REGION_PROGRESS_SEPARATOR) {
                return None;
            }
            let region = region.parse::<u32>().ok()?;
            let lsn = lsn.parse::<i64>().ok()?;
            if regions.iter().any(|(r, _)| *r == region) {
                return None;
            }
            regions.push((region, lsn));
        }

        Some(Self {
            version,
            global_lsn,
            local_lsn_by_region: regions,
        })
    }
}

impl PartialEq for VectorSessionToken {
    fn eq(&self, other: &Self) -> bool {
        self.version == other.version
            && self.global_lsn == other.global_lsn
            && self.local_lsn_by_region.len() == other.local_lsn_by_region.len()
            && self
                .regions()
                .all(|(region, lsn)| other.local_lsn(region) == Some(lsn))
    }
}

impl Eq for VectorSessionToken {}

impl fmt::Display for VectorSessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.version, SEGMENT_SEPARATOR, self.global_lsn)?;
        for (region, lsn) in self.regions() {
            write!(
                f,
                "{}{}{}{}",
                SEGMENT_SEPARATOR, region, REGION_PROGRESS_SEPARATOR, lsn
            )?;
        }
        Ok(())
    }
}

/// A parsed session token of either protocol generation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionToken {
    /// Single global LSN
    Simple(SimpleSessionToken),
    /// Versioned per-region progress
    Vector(VectorSessionToken),
}

impl SessionToken {
    /// Parse an unqualified token. Anything before a `:` is ignored, so the
    /// value of a single-range `x-ms-session-token` header parses too.
    pub fn parse(text: &str) -> Result<Self> {
        let token = text
            .rsplit(PARTITION_SEPARATOR)
            .next()
            .unwrap_or(text)
            .trim();

        if let Some(simple) = SimpleSessionToken::try_parse(token) {
            return Ok(Self::Simple(simple));
        }
        VectorSessionToken::try_parse(token)
            .map(Self::Vector)
            .ok_or_else(|| ProtocolError::invalid_session_token(text))
    }

    /// Global LSN of the token
    pub fn lsn(&self) -> i64 {
        match self {
            Self::Simple(token) => token.lsn(),
            Self::Vector(token) => token.global_lsn(),
        }
    }

    /// True when `other` has progressed at least as far as `self`
    pub fn is_valid(&self, other: &SessionToken) -> Result<bool> {
        match (self, other) {
            (Self::Simple(a), Self::Simple(b)) => Ok(a.is_valid(b)),
            (Self::Vector(a), Self::Vector(b)) => a.is_valid(b),
            _ => Err(self.incompatible(other)),
        }
    }

    /// Combine two tokens into one that is at least as advanced as both
    pub fn merge(&self, other: &SessionToken) -> Result<SessionToken> {
        match (self, other) {
            (Self::Simple(a), Self::Simple(b)) => Ok(Self::Simple(a.merge(b))),
            (Self::Vector(a), Self::Vector(b)) => a.merge(b).map(Self::Vector),
            _ => Err(self.incompatible(other)),
        }
    }

    fn incompatible(&self, other: &SessionToken) -> ProtocolError {
        ProtocolError::IncompatibleTokens {
            left: self.to_string(),
            right: other.to_string(),
        }
    }
}

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Simple(token) => token.fmt(f),
            Self::Vector(token) => token.fmt(f),
        }
    }
}

impl FromStr for SessionToken {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl From<SimpleSessionToken> for SessionToken {
    fn from(token: SimpleSessionToken) -> Self {
        Self::Simple(token)
    }
}

impl From<VectorSessionToken> for SessionToken {
    fn from(token: VectorSessionToken) -> Self {
        Self::Vector(token)
    }
}

/// Format a partition-qualified token: `{partition_key_range_id}:{token}`
pub fn format_qualified(partition_key_range_id: &str, token: &SessionToken) -> String {
    format!("{}{}{}", partition_key_range_id, PARTITION_SEPARATOR, token)
}

/// Split a partition-qualified token into its range id and token
pub fn parse_qualified(text: &str) -> Result<(String, SessionToken)> {
    let mut parts = text.split(PARTITION_SEPARATOR);
    match (parts.next(), parts.next(), parts.next()) {
        (Some(range), Some(token), None) if !range.trim().is_empty() => {
            Ok((range.trim().to_string(), SessionToken::parse(token)?))
        }
        _ => Err(ProtocolError::invalid_session_token(text)),
    }
}

/// Split a compound header value (`{range}:{token},{range}:{token}`)
pub fn parse_compound(text: &str) -> Result<Vec<(String, SessionToken)>> {
    text.split(COMPOUND_SEPARATOR)
        .filter(|segment| !segment.trim().is_empty())
        .map(parse_qualified)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vector(text: &str) -> VectorSessionToken {
        match SessionToken::parse(text).unwrap() {
            SessionToken::Vector(token) => token,
            other => panic!("expected vector token, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_simple_before_vector() {
        assert_eq!(
            SessionToken::parse("42").unwrap(),
            SessionToken::Simple(SimpleSessionToken::new(42))
        );
        assert!(matches!(
            SessionToken::parse("1#42").unwrap(),
            SessionToken::Vector(_)
        ));
    }

    #[test]
    fn test_vector_round_trips_byte_for_byte() {
        for text in ["1#100#3=50#1=60", "7#9", "2#100#1=20#2=30#3=40"] {
            assert_eq!(vector(text).to_string(), text);
        }
    }

    #[test]
    fn test_rejects_malformed_tokens() {
        for text in ["", "#", "1#", "a#1", "1#2#3", "1#2#3=x", "1#2#3=4=5", "1#2#1=3#1=4"] {
            assert!(SessionToken::parse(text).is_err(), "accepted {:?}", text);
        }
    }

    #[test]
    fn test_is_valid_same_version() {
        let request = vector("1#100#1=20#2=30");
        assert!(request.is_valid(&vector("1#100#1=20#2=30")).unwrap());
        assert!(request.is_valid(&vector("1#101#1=25#2=30")).unwrap());
        assert!(!request.is_valid(&vector("1#100#1=19#2=30")).unwrap());
        assert!(!request.is_valid(&vector("1#99#1=20#2=30")).unwrap());
    }

    #[test]
    fn test_is_valid_rejects_older_version() {
        let request = vector("2#100#1=20");
        assert!(!request.is_valid(&vector("1#200#1=90")).unwrap());
    }

    #[test]
    fn test_region_mismatch_at_equal_version_is_an_error() {
        let a = vector("1#100#1=20#2=30");
        let b = vector("1#100#1=20#3=30");
        assert!(matches!(
            a.is_valid(&b),
            Err(ProtocolError::RegionSetMismatch { version: 1, .. })
        ));
        assert!(a.merge(&b).is_err());

        let c = vector("1#100#1=20");
        assert!(a.is_valid(&c).unwrap_err().is_invariant_violation());
    }

    #[test]
    fn test_region_sets_may_differ_across_versions() {
        let old = vector("1#100#1=20#2=30");
        let new = vector("2#110#1=25#3=5");
        assert!(old.is_valid(&new).unwrap());

        let merged = old.merge(&new).unwrap();
        assert_eq!(merged, vector("2#110#1=25#3=5"));
        assert_eq!(merged.to_string(), "2#110#1=25#3=5");
    }

    #[test]
    fn test_merge_takes_maximum_per_region() {
        let a = vector("1#100#1=20#2=35");
        let b = vector("1#90#1=25#2=30");
        assert_eq!(a.merge(&b).unwrap(), vector("1#100#1=25#2=35"));
    }

    #[test]
    fn test_simple_and_vector_do_not_mix() {
        let simple = SessionToken::parse("10").unwrap();
        let vector = SessionToken::parse("1#10#1=1").unwrap();
        assert!(matches!(
            simple.is_valid(&vector),
            Err(ProtocolError::IncompatibleTokens { .. })
        ));
        assert!(vector.merge(&simple).is_err());
    }

    #[test]
    fn test_qualified_and_compound() {
        let token = SessionToken::parse("1#100#1=20").unwrap();
        assert_eq!(format_qualified("7", &token), "7:1#100#1=20");

        let (range, parsed) = parse_qualified("7:1#100#1=20").unwrap();
        assert_eq!(range, "7");
        assert_eq!(parsed, token);

        let all = parse_compound("0:1#10#1=5,1:1#20#1=6").unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].0, "1");
        assert_eq!(all[1].1.lsn(), 20);

        assert!(parse_qualified("1#100").is_err());
        assert!(parse_compound("0:1#10,garbage").is_err());
    }

    #[test]
    fn test_parse_strips_range_prefix() {
        assert_eq!(SessionToken::parse("3:55").unwrap().lsn(), 55);
    }
}
