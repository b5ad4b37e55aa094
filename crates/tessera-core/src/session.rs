//! Session progress across requests
//!
//! The container remembers, per collection and partition key range, the
//! latest session token seen in a response. Before each replica call the
//! request gets a partition-local token: the caller's own header value if it
//! sent one, otherwise whatever the container holds.

use crate::context::PartitionKeyRange;
use crate::error::Result;
use crate::request::ServiceRequest;
use parking_lot::RwLock;
use std::collections::HashMap;
use tessera_protocol::{Headers, SessionToken, format_qualified, headers, parse_compound};

/// Stores and resolves session tokens
pub trait SessionContainer: Send + Sync {
    /// Token of `range` (merged with its parents) for the request's collection
    fn resolve_partition_local_session_token(
        &self,
        request: &ServiceRequest,
        range: &PartitionKeyRange,
    ) -> Result<Option<SessionToken>>;

    /// Merge the session token of a response into the container
    fn set_session_token(&self, request: &ServiceRequest, response_headers: &Headers) -> Result<()>;

    /// Forget every token of a collection
    fn clear_token_by_resource_id(&self, resource_id: &str);
}

#[derive(Default)]
struct Tokens {
    by_collection: HashMap<String, HashMap<String, SessionToken>>,
    rid_by_name: HashMap<String, String>,
}

/// Process-local [`SessionContainer`]
#[derive(Default)]
pub struct InMemorySessionContainer {
    tokens: RwLock<Tokens>,
}

impl InMemorySessionContainer {
    /// Create an empty container
    pub fn new() -> Self {
        Self::default()
    }

    /// Compound header value of every range known for the request's
    /// collection, ranges in lexicographic order
    pub fn resolve_global_session_token(&self, request: &ServiceRequest) -> Option<String> {
        let tokens = self.tokens.read();
        let key = collection_key(&tokens, request)?;
        let ranges = tokens.by_collection.get(&key)?;
        let mut entries: Vec<_> = ranges.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        Some(
            entries
                .into_iter()
                .map(|(range, token)| format_qualified(range, token))
                .collect::<Vec<_>>()
                .join(","),
        )
    }
}

impl SessionContainer for InMemorySessionContainer {
    fn resolve_partition_local_session_token(
        &self,
        request: &ServiceRequest,
        range: &PartitionKeyRange,
    ) -> Result<Option<SessionToken>> {
        let tokens = self.tokens.read();
        let Some(ranges) = collection_key(&tokens, request).and_then(|k| tokens.by_collection.get(&k))
        else {
            return Ok(None);
        };
        merge_for_range(
            ranges.iter().map(|(id, token)| (id.as_str(), token)),
            range,
        )
    }

    fn set_session_token(&self, request: &ServiceRequest, response_headers: &Headers) -> Result<()> {
        let Some(raw) = response_headers.get(headers::SESSION_TOKEN) else {
            return Ok(());
        };
        let parsed = parse_compound(raw)?;

        let mut tokens = self.tokens.write();
        let Some(key) = request
            .collection_rid()
            .or_else(|| collection_key(&tokens, request))
        else {
            tracing::debug!(
                "No collection identity for {}, session token dropped",
                request.resource_address
            );
            return Ok(());
        };
        if let (Some(name), Some(rid)) = (request.collection_path(), request.collection_rid()) {
            tokens.rid_by_name.insert(name, rid);
        }

        let ranges = tokens.by_collection.entry(key).or_default();
        for (range, token) in parsed {
            let merged = match ranges.get(&range) {
                Some(existing) => existing.merge(&token)?,
                None => token,
            };
            ranges.insert(range, merged);
        }
        Ok(())
    }

    fn clear_token_by_resource_id(&self, resource_id: &str) {
        let mut tokens = self.tokens.write();
        tokens.by_collection.remove(resource_id);
        tokens.rid_by_name.retain(|name, rid| {
            let matches = rid == resource_id || name == resource_id;
            !matches
        });
    }
}

fn collection_key(tokens: &Tokens, request: &ServiceRequest) -> Option<String> {
    if let Some(rid) = request.collection_rid() {
        return Some(rid);
    }
    let name = request.collection_path()?;
    Some(tokens.rid_by_name.get(&name).cloned().unwrap_or(name))
}

fn merge_for_range<'a>(
    tokens: impl Iterator<Item = (&'a str, &'a SessionToken)>,
    range: &PartitionKeyRange,
) -> Result<Option<SessionToken>> {
    let mut merged: Option<SessionToken> = None;
    for (id, token) in tokens {
        if id != range.id && !range.parents.iter().any(|p| p == id) {
            continue;
        }
        merged = Some(match merged {
            Some(current) => current.merge(token)?,
            None => token.clone(),
        });
    }
    Ok(merged)
}

/// Replace the request's session header with its partition-local token
///
/// Without a resolved partition key range there is nothing to scope a token
/// to and the header is removed.
pub fn set_partition_local_session_token(
    request: &mut ServiceRequest,
    container: &dyn SessionContainer,
) -> Result<()> {
    let Some(range) = request.context.resolved_partition_key_range.clone() else {
        clear_session_token(request);
        return Ok(());
    };

    let token = match request.headers.get(headers::SESSION_TOKEN) {
        Some(value) if !value.trim().is_empty() => {
            let parsed = parse_compound(value)?;
            merge_for_range(
                parsed.iter().map(|(id, token)| (id.as_str(), token)),
                &range,
            )?
        }
        _ => container.resolve_partition_local_session_token(request, &range)?,
    };

    match token {
        Some(token) => {
            request
                .headers
                .set(headers::SESSION_TOKEN, format_qualified(&range.id, &token));
            request.context.session_token = Some(token);
        }
        None => clear_session_token(request),
    }
    Ok(())
}

/// Strip any session token from the request
pub fn clear_session_token(request: &mut ServiceRequest) {
    request.headers.remove(headers::SESSION_TOKEN);
    request.context.session_token = None;
}
