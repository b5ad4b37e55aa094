//! Quorum reads for Strong and BoundedStaleness consistency
//!
//! ```text
//! read quorum ──► quorum met ─────────────────────────────► done
//!      │
//!      ├──► quorum selected ──► barrier ──► met ──────────► done
//!      │                           └──► not met ──────────► Gone(ReadQuorumNotMet)
//!      │
//!      └──► too few replicas ──► read primary ──► caught up ► done
//!                                   ├──► replica set larger than quorum
//!                                   │        └──► read quorum again, primary included
//!                                   └──► otherwise ───────► Gone(ReadQuorumNotMet)
//! ```
//!
//! A quorum-selected response whose barrier did not converge is parked in
//! the request context. When the request is retried the barrier resumes
//! from that response instead of reading the replicas again.

use crate::barrier::create_barrier_request;
use crate::config::DirectConfig;
use crate::error::{Error, Result};
use crate::request::{ReadMode, ServiceRequest};
use crate::store_reader::StoreReader;
use crate::store_result::StoreResult;
use crate::transport::StoreResponse;
use std::collections::BTreeMap;
use std::sync::Arc;
use tessera_protocol::{ConsistencyLevel, SessionToken, SubStatusCode};

/// Outcome of one quorum read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadQuorumOutcome {
    /// A quorum agreed, confirmed by a barrier when one was needed
    QuorumMet,
    /// A response was selected but its barrier did not converge
    QuorumSelected,
    /// Fewer than a quorum of valid replicas answered
    QuorumNotSelected,
}

/// Result of one quorum read
#[derive(Debug, Clone)]
pub struct ReadQuorumResult {
    /// Outcome
    pub outcome: ReadQuorumOutcome,
    /// LSN the barrier waited for
    pub selected_lsn: i64,
    /// Global committed LSN the barrier waited for, -1 when none
    pub global_committed_selected_lsn: i64,
    /// Chosen response
    pub selected_response: Option<Arc<StoreResult>>,
    /// Every valid response received
    pub responses: Vec<Arc<StoreResult>>,
}

/// Candidate picked from a set of replica responses
#[derive(Debug, Clone)]
pub struct QuorumSelection {
    /// True when a quorum of replicas agrees on `lsn`
    pub quorum_met: bool,
    /// LSN the selection settled on
    pub lsn: i64,
    /// LSN a barrier has to observe before `selected` may be returned
    pub barrier_lsn: i64,
    /// Global committed LSN a barrier has to observe, -1 when none
    pub global_committed_lsn: i64,
    /// Response to return
    pub selected: Arc<StoreResult>,
}

/// Pick the highest LSN that at least `read_quorum` valid replicas report
///
/// Without such an LSN the highest LSN is selected and the quorum is not met.
/// Among responses at the chosen LSN, successful statuses win over errors,
/// then responses whose session token satisfies `request_token`, then the
/// lowest endpoint, so the choice never depends on arrival order. Global
/// strong candidates additionally need a global committed LSN at least as
/// high as the chosen LSN. An agreed LSN of zero never meets the quorum.
///
/// The quorum is also met when the selected item's LSN is at or below the
/// lowest LSN of a quorum of responses (and, for global strong, at or below
/// the highest global committed LSN).
pub fn select_quorum(
    responses: &[Arc<StoreResult>],
    read_quorum: usize,
    request_token: Option<&SessionToken>,
    global_strong_candidate: bool,
) -> Option<QuorumSelection> {
    let valid: Vec<&Arc<StoreResult>> = responses.iter().filter(|r| r.is_valid).collect();
    let max_lsn = valid.iter().map(|r| r.lsn).max()?;

    let mut replicas_by_lsn: BTreeMap<i64, usize> = BTreeMap::new();
    for response in &valid {
        *replicas_by_lsn.entry(response.lsn).or_default() += 1;
    }
    let quorum_lsn = replicas_by_lsn
        .iter()
        .rev()
        .find(|(_, count)| **count >= read_quorum)
        .map(|(lsn, _)| *lsn);

    let lsn = quorum_lsn.unwrap_or(max_lsn);
    let selected = valid
        .iter()
        .filter(|r| r.lsn == lsn)
        .min_by_key(|r| {
            let session_ok = match (request_token, &r.session_token) {
                (Some(expected), Some(actual)) => expected.is_valid(actual).unwrap_or(false),
                (None, _) => true,
                (Some(_), None) => false,
            };
            (!r.status.is_success(), !session_ok, r.endpoint.clone())
        })
        .map(|r| Arc::clone(r))?;

    let number_of_read_regions = valid
        .iter()
        .map(|r| r.number_of_read_regions)
        .max()
        .unwrap_or(-1);
    let max_global_committed_lsn = valid
        .iter()
        .map(|r| r.global_committed_lsn)
        .max()
        .unwrap_or(-1);
    let check_global_strong = global_strong_candidate && number_of_read_regions > 0;

    let barrier_lsn = if selected.item_lsn >= 0 {
        selected.item_lsn.min(lsn)
    } else {
        lsn
    };

    let agreed = barrier_lsn > 0
        && quorum_lsn.is_some()
        && (!check_global_strong || max_global_committed_lsn >= lsn);
    // An item no newer than the slowest replica is already held by all of them
    let min_lsn = valid.iter().map(|r| r.lsn).min().unwrap_or(-1);
    let item_settled = valid.len() >= read_quorum
        && selected.item_lsn >= 0
        && selected.item_lsn <= min_lsn
        && (!check_global_strong || selected.item_lsn <= max_global_committed_lsn);

    Some(QuorumSelection {
        quorum_met: agreed || item_settled,
        lsn,
        barrier_lsn,
        global_committed_lsn: if check_global_strong { barrier_lsn } else { -1 },
        selected,
    })
}

enum PrimaryRead {
    Success(Arc<StoreResult>),
    RetryOnSecondaries,
}

enum PrimaryLsnWait {
    Met,
    Inconclusive,
    NotMet,
}

/// Reads a quorum of replicas and reconciles their answers
#[derive(Clone)]
pub struct QuorumReader {
    store_reader: StoreReader,
    config: Arc<DirectConfig>,
}

impl QuorumReader {
    /// Create a quorum reader
    pub fn new(store_reader: StoreReader, config: Arc<DirectConfig>) -> Self {
        Self {
            store_reader,
            config,
        }
    }

    /// Read under Strong or BoundedStaleness consistency
    pub async fn read_strong(
        &self,
        request: &mut ServiceRequest,
        read_quorum: usize,
        read_mode: ReadMode,
    ) -> Result<StoreResponse> {
        let mut has_performed_read_from_primary = false;
        let mut include_primary = false;

        for attempt in 0..self.config.max_read_quorum_retries {
            if let Some(timeout) = &request.context.timeout {
                timeout.throw_gone_if_elapsed()?;
            }

            let result = self
                .read_quorum(request, read_quorum, include_primary, read_mode)
                .await?;

            match result.outcome {
                ReadQuorumOutcome::QuorumMet => {
                    request.context.clear_quorum_selected_response();
                    return selected_response(&result);
                }
                ReadQuorumOutcome::QuorumSelected => {
                    let barrier = create_barrier_request(
                        request,
                        result.selected_lsn,
                        result.global_committed_selected_lsn,
                    )?;
                    if self
                        .wait_for_read_barrier(
                            barrier,
                            true,
                            read_quorum,
                            result.selected_lsn,
                            result.global_committed_selected_lsn,
                            read_mode,
                        )
                        .await?
                    {
                        request.context.clear_quorum_selected_response();
                        return selected_response(&result);
                    }

                    tracing::warn!(
                        "Read barrier for {} not met at lsn {} / global committed lsn {}",
                        request.resource_address,
                        result.selected_lsn,
                        result.global_committed_selected_lsn
                    );
                    if let Some(selected) = result.selected_response.clone() {
                        request.context.update_quorum_selected_response(
                            selected,
                            result.responses.clone(),
                            result.selected_lsn,
                            result.global_committed_selected_lsn,
                        );
                    }
                    break;
                }
                ReadQuorumOutcome::QuorumNotSelected => {
                    if has_performed_read_from_primary {
                        tracing::warn!(
                            "Primary read already performed for {}, quorum still not selected",
                            request.resource_address
                        );
                        break;
                    }

                    match self.read_primary(request, read_quorum).await? {
                        PrimaryRead::Success(result) => return result.to_response(),
                        PrimaryRead::RetryOnSecondaries => {
                            tracing::debug!(
                                "Retrying quorum read of {} on secondaries (attempt {})",
                                request.resource_address,
                                attempt + 1
                            );
                            has_performed_read_from_primary = true;
                            include_primary = true;
                        }
                    }
                }
            }
        }

        Err(read_quorum_not_met(request))
    }

    /// One quorum read, including the barrier of a selected response
    pub async fn read_quorum(
        &self,
        request: &mut ServiceRequest,
        read_quorum: usize,
        include_primary: bool,
        read_mode: ReadMode,
    ) -> Result<ReadQuorumResult> {
        let (selected, responses, lsn, global_committed_lsn) =
            match request.context.quorum_selected_response.clone() {
                Some(selected) => {
                    tracing::debug!(
                        "Resuming read barrier for {} at lsn {}",
                        request.resource_address,
                        request.context.quorum_selected_lsn
                    );
                    (
                        selected,
                        request.context.store_responses.clone(),
                        request.context.quorum_selected_lsn,
                        request.context.global_committed_selected_lsn,
                    )
                }
                None => {
                    let responses = self
                        .store_reader
                        .read_multiple_replicas(
                            request,
                            include_primary,
                            read_quorum,
                            true,
                            false,
                            read_mode,
                            false,
                        )
                        .await?;

                    let valid: Vec<Arc<StoreResult>> =
                        responses.into_iter().filter(|r| r.is_valid).collect();
                    if valid.len() < read_quorum {
                        return Ok(ReadQuorumResult {
                            outcome: ReadQuorumOutcome::QuorumNotSelected,
                            selected_lsn: -1,
                            global_committed_selected_lsn: -1,
                            selected_response: None,
                            responses: valid,
                        });
                    }

                    let request_token = self.store_reader.partition_local_session_token(request)?;
                    let Some(selection) = select_quorum(
                        &valid,
                        read_quorum,
                        request_token.as_ref(),
                        self.is_global_strong_read_candidate(request),
                    ) else {
                        return Err(read_quorum_not_met(request));
                    };

                    if selection.quorum_met {
                        return Ok(ReadQuorumResult {
                            outcome: ReadQuorumOutcome::QuorumMet,
                            selected_lsn: selection.lsn,
                            global_committed_selected_lsn: selection.global_committed_lsn,
                            selected_response: Some(selection.selected),
                            responses: valid,
                        });
                    }

                    tracing::debug!(
                        "No quorum at lsn {} for {}, barrier required",
                        selection.lsn,
                        request.resource_address
                    );
                    request.context.force_refresh_address_cache = false;
                    (
                        selection.selected,
                        valid,
                        selection.barrier_lsn,
                        selection.global_committed_lsn,
                    )
                }
            };

        let barrier = create_barrier_request(request, lsn, global_committed_lsn)?;
        let barrier_met = self
            .wait_for_read_barrier(
                barrier,
                false,
                read_quorum,
                lsn,
                global_committed_lsn,
                read_mode,
            )
            .await?;

        Ok(ReadQuorumResult {
            outcome: if barrier_met {
                ReadQuorumOutcome::QuorumMet
            } else {
                ReadQuorumOutcome::QuorumSelected
            },
            selected_lsn: lsn,
            global_committed_selected_lsn: global_committed_lsn,
            selected_response: Some(selected),
            responses,
        })
    }

    fn is_global_strong_read_candidate(&self, request: &ServiceRequest) -> bool {
        self.config.global_strong_enabled
            && self.config.account_consistency == ConsistencyLevel::Strong
            && request
                .context
                .original_consistency
                .is_none_or(|level| level == ConsistencyLevel::Strong)
    }

    async fn wait_for_read_barrier(
        &self,
        mut barrier: ServiceRequest,
        allow_primary: bool,
        read_quorum: usize,
        barrier_lsn: i64,
        target_global_committed_lsn: i64,
        read_mode: ReadMode,
    ) -> Result<bool> {
        let mut max_global_committed_lsn = -1;

        for attempt in 0..self.config.max_read_barrier_retries {
            let (met, observed) = self
                .poll_read_barrier(
                    &mut barrier,
                    allow_primary,
                    read_quorum,
                    barrier_lsn,
                    target_global_committed_lsn,
                    read_mode,
                )
                .await?;
            if met {
                return Ok(true);
            }
            max_global_committed_lsn = max_global_committed_lsn.max(observed);
            barrier.context.force_refresh_address_cache = false;

            if attempt + 1 < self.config.max_read_barrier_retries {
                tokio::time::sleep(self.config.read_barrier_delay).await;
            }
        }

        if target_global_committed_lsn > 0 {
            for attempt in 0..self.config.max_global_strong_barrier_retries {
                let (met, observed) = self
                    .poll_read_barrier(
                        &mut barrier,
                        allow_primary,
                        read_quorum,
                        barrier_lsn,
                        target_global_committed_lsn,
                        read_mode,
                    )
                    .await?;
                if met {
                    return Ok(true);
                }
                max_global_committed_lsn = max_global_committed_lsn.max(observed);
                barrier.context.force_refresh_address_cache = false;

                if attempt + 1 < self.config.max_global_strong_barrier_retries {
                    tokio::time::sleep(self.config.global_strong_barrier_delay_for(attempt)).await;
                }
            }
        }

        tracing::debug!(
            "Read barrier exhausted waiting for lsn {} / global committed lsn {} (observed {})",
            barrier_lsn,
            target_global_committed_lsn,
            max_global_committed_lsn
        );
        Ok(false)
    }

    async fn poll_read_barrier(
        &self,
        barrier: &mut ServiceRequest,
        allow_primary: bool,
        read_quorum: usize,
        barrier_lsn: i64,
        target_global_committed_lsn: i64,
        read_mode: ReadMode,
    ) -> Result<(bool, i64)> {
        if let Some(timeout) = &barrier.context.timeout {
            timeout.throw_gone_if_elapsed()?;
        }

        let responses = self
            .store_reader
            .read_multiple_replicas(
                barrier,
                allow_primary,
                read_quorum,
                true,
                false,
                read_mode,
                false,
            )
            .await?;

        let caught_up = responses.iter().filter(|r| r.lsn >= barrier_lsn).count();
        let max_global_committed_lsn = responses
            .iter()
            .map(|r| r.global_committed_lsn)
            .max()
            .unwrap_or(-1);
        let met = caught_up >= read_quorum
            && (target_global_committed_lsn <= 0
                || max_global_committed_lsn >= target_global_committed_lsn);
        Ok((met, max_global_committed_lsn))
    }

    async fn read_primary(
        &self,
        request: &mut ServiceRequest,
        read_quorum: usize,
    ) -> Result<PrimaryRead> {
        request.context.force_refresh_address_cache = false;
        let result = self.store_reader.read_primary(request, true, false).await?;
        if !result.is_valid {
            return Err(result
                .error()
                .cloned()
                .unwrap_or_else(|| read_quorum_not_met(request)));
        }

        if result.current_replica_set_size <= 0 || result.lsn < 0 || result.quorum_acked_lsn < 0 {
            tracing::warn!(
                "Primary {} did not report replica set size / lsn / quorum acked lsn ({}, {}, {})",
                result.endpoint,
                result.current_replica_set_size,
                result.lsn,
                result.quorum_acked_lsn
            );
            return Err(read_quorum_not_met(request));
        }

        if result.current_replica_set_size > read_quorum as i64 {
            return Ok(PrimaryRead::RetryOnSecondaries);
        }

        if result.lsn != result.quorum_acked_lsn {
            let barrier = create_barrier_request(request, result.lsn, -1)?;
            return match self
                .wait_for_primary_lsn(barrier, result.lsn, read_quorum)
                .await?
            {
                PrimaryLsnWait::Met => Ok(PrimaryRead::Success(result)),
                PrimaryLsnWait::Inconclusive => Ok(PrimaryRead::RetryOnSecondaries),
                PrimaryLsnWait::NotMet => Err(read_quorum_not_met(request)),
            };
        }

        Ok(PrimaryRead::Success(result))
    }

    async fn wait_for_primary_lsn(
        &self,
        mut barrier: ServiceRequest,
        lsn_to_wait_for: i64,
        read_quorum: usize,
    ) -> Result<PrimaryLsnWait> {
        for attempt in 0..self.config.max_primary_read_retries {
            if let Some(timeout) = &barrier.context.timeout {
                timeout.throw_gone_if_elapsed()?;
            }
            barrier.context.force_refresh_address_cache = false;

            let result = self.store_reader.read_primary(&mut barrier, true, false).await?;
            if !result.is_valid {
                return Err(result.error().cloned().unwrap_or_else(|| {
                    Error::gone(SubStatusCode::READ_QUORUM_NOT_MET, "Invalid primary barrier response")
                }));
            }
            if result.current_replica_set_size > read_quorum as i64 {
                return Ok(PrimaryLsnWait::Inconclusive);
            }
            if result.lsn >= lsn_to_wait_for && result.quorum_acked_lsn >= lsn_to_wait_for {
                return Ok(PrimaryLsnWait::Met);
            }

            if attempt + 1 < self.config.max_primary_read_retries {
                tokio::time::sleep(self.config.read_barrier_delay).await;
            }
        }
        Ok(PrimaryLsnWait::NotMet)
    }
}

fn selected_response(result: &ReadQuorumResult) -> Result<StoreResponse> {
    match &result.selected_response {
        Some(selected) => selected.to_response(),
        None => Err(Error::internal("Quorum result without a selected response")),
    }
}

fn read_quorum_not_met(request: &ServiceRequest) -> Error {
    Error::gone(
        SubStatusCode::READ_QUORUM_NOT_MET,
        format!("Read quorum not met for {}", request.resource_address),
    )
}
