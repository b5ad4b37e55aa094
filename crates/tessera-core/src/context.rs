//! Per-operation scratch state
//!
//! A [`RequestContext`] is created once per logical request and cloned when a
//! derived request (a barrier, an alternate-region read) is built from it.
//! Cloning copies every field except two that are deliberately shared between
//! the original and its clones:
//! - the request charge tracker, so charges of derived requests add up
//! - the failed-endpoint set, so a replica that failed once is tried last by
//!   every later attempt of the same operation

use crate::store_result::StoreResult;
use crate::timeout::TimeoutHelper;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tessera_protocol::{ConsistencyLevel, SessionToken};

/// Partition key range a request resolved to
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PartitionKeyRange {
    /// Range id
    pub id: String,
    /// Ids of the ranges this one was split from
    pub parents: Vec<String>,
}

impl PartitionKeyRange {
    /// Create a range without parents
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            parents: Vec::new(),
        }
    }

    /// Builder-style parents
    pub fn with_parents(mut self, parents: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.parents = parents.into_iter().map(Into::into).collect();
        self
    }
}

/// Request units accumulated across every replica contacted
#[derive(Debug, Default)]
pub struct RequestChargeTracker {
    bits: AtomicU64,
}

impl RequestChargeTracker {
    /// Add a charge
    pub fn add(&self, charge: f64) {
        if charge == 0.0 {
            return;
        }
        // Closure always returns Some, the update cannot fail
        let _ = self
            .bits
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                Some((f64::from_bits(bits) + charge).to_bits())
            });
    }

    /// Total so far
    pub fn total(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Acquire))
    }
}

/// Mutable state threaded through the read and write pipelines
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Budget of the logical request
    pub timeout: Option<TimeoutHelper>,
    /// Consistency level the caller asked for through the header, if any
    pub original_consistency: Option<ConsistencyLevel>,
    /// Partition-local session token sent with the current attempt
    pub session_token: Option<SessionToken>,
    /// Range the request resolved to
    pub resolved_partition_key_range: Option<PartitionKeyRange>,
    /// Collection resource id the request resolved to
    pub resolved_collection_rid: Option<String>,
    /// Response chosen by the last quorum read that still needs a barrier
    pub quorum_selected_response: Option<Arc<StoreResult>>,
    /// LSN of `quorum_selected_response`
    pub quorum_selected_lsn: i64,
    /// Global committed LSN a barrier has to observe
    pub global_committed_selected_lsn: i64,
    /// Responses contacted by the last quorum read
    pub store_responses: Vec<Arc<StoreResult>>,
    /// Global-strong write whose barrier has not converged yet
    pub global_strong_write_response: Option<Arc<StoreResult>>,
    /// Next resolution bypasses the address cache
    pub force_refresh_address_cache: bool,
    /// Next resolution also refreshes the partition key range
    pub force_partition_key_range_refresh: bool,
    /// A background refresh was already started for this request
    pub performed_background_address_refresh: bool,
    /// Preferred region index for routing overrides
    pub location_index: Option<usize>,
    /// Region the request was routed to
    pub region_name: Option<String>,
    request_charge: Arc<RequestChargeTracker>,
    failed_endpoints: Arc<Mutex<HashSet<String>>>,
}

impl Default for RequestContext {
    fn default() -> Self {
        Self {
            timeout: None,
            original_consistency: None,
            session_token: None,
            resolved_partition_key_range: None,
            resolved_collection_rid: None,
            quorum_selected_response: None,
            quorum_selected_lsn: -1,
            global_committed_selected_lsn: -1,
            store_responses: Vec::new(),
            global_strong_write_response: None,
            force_refresh_address_cache: false,
            force_partition_key_range_refresh: false,
            performed_background_address_refresh: false,
            location_index: None,
            region_name: None,
            request_charge: Arc::new(RequestChargeTracker::default()),
            failed_endpoints: Arc::new(Mutex::new(HashSet::new())),
        }
    }
}

impl RequestContext {
    /// Charge tracker shared with every clone
    pub fn request_charge(&self) -> &Arc<RequestChargeTracker> {
        &self.request_charge
    }

    /// Total request units charged so far
    pub fn total_request_charge(&self) -> f64 {
        self.request_charge.total()
    }

    /// Remember that `endpoint` failed during this operation
    pub fn mark_endpoint_failed(&self, endpoint: &str) {
        self.failed_endpoints.lock().insert(endpoint.to_string());
    }

    /// Snapshot of the failed endpoints
    pub fn failed_endpoints(&self) -> HashSet<String> {
        self.failed_endpoints.lock().clone()
    }

    /// Replace the quorum-selected response; the previous one is released
    pub fn update_quorum_selected_response(
        &mut self,
        response: Arc<StoreResult>,
        store_responses: Vec<Arc<StoreResult>>,
        quorum_selected_lsn: i64,
        global_committed_selected_lsn: i64,
    ) {
        self.quorum_selected_response = Some(response);
        self.store_responses = store_responses;
        self.quorum_selected_lsn = quorum_selected_lsn;
        self.global_committed_selected_lsn = global_committed_selected_lsn;
    }

    /// Drop any pending quorum barrier state
    pub fn clear_quorum_selected_response(&mut self) {
        self.quorum_selected_response = None;
        self.store_responses.clear();
        self.quorum_selected_lsn = -1;
        self.global_committed_selected_lsn = -1;
    }
}
