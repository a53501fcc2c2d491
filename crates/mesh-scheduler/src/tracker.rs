//! Request SLO tracker and per-candidate strictest-target index
//!
//! Every in-flight request's SLO is registered here on scheduler entry. Once
//! the request is routed it is assigned to its replica, and from then on its
//! targets contribute to that replica's strictest running TTFT and TPOT. Each
//! replica has one entry in a sharded map holding its requests' targets and
//! the cached minimum per metric, so reading the index is a single shard
//! lookup.
//!
//! Unset (0) targets never enter the index.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use mesh_core::{Candidate, CandidateId, Error, Metric, RequestId, RequestSlo, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info};

#[derive(Debug, Clone)]
struct TrackedRequest {
    slo: RequestSlo,
    candidate: Option<CandidateId>,
    tracked_at: Instant,
}

#[derive(Debug, Default)]
struct CandidateIndex {
    targets: HashMap<RequestId, RequestSlo>,
    strictest_ttft_ms: Option<f64>,
    strictest_tpot_ms: Option<f64>,
}

impl CandidateIndex {
    fn recompute(&mut self) {
        self.strictest_ttft_ms = Self::min_target(&self.targets, Metric::Ttft);
        self.strictest_tpot_ms = Self::min_target(&self.targets, Metric::Tpot);
    }

    fn min_target(targets: &HashMap<RequestId, RequestSlo>, metric: Metric) -> Option<f64> {
        targets
            .values()
            .map(|slo| slo.target(metric))
            .filter(|t| *t > 0.0)
            .fold(None, |acc: Option<f64>, t| Some(acc.map_or(t, |m| m.min(t))))
    }

    fn strictest(&self, metric: Metric) -> Option<f64> {
        match metric {
            Metric::Ttft => self.strictest_ttft_ms,
            Metric::Tpot => self.strictest_tpot_ms,
        }
    }
}

/// Tracker statistics
#[derive(Debug, Default)]
pub struct TrackerStats {
    pub tracked: AtomicU64,
    pub assigned: AtomicU64,
    pub untracked: AtomicU64,
    pub expired: AtomicU64,
}

/// Holds in-flight request SLOs and the strictest running targets per replica
#[derive(Debug, Default)]
pub struct RequestSloTracker {
    requests: DashMap<RequestId, TrackedRequest>,
    candidates: DashMap<CandidateId, CandidateIndex>,
    stats: TrackerStats,
}

impl RequestSloTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request's SLO
    pub fn track(&self, request_id: &RequestId, slo: RequestSlo) -> Result<()> {
        slo.validate()?;
        let tracked = TrackedRequest {
            slo,
            candidate: None,
            tracked_at: Instant::now(),
        };
        // the old assignment leaves the index before the entry lock is released
        match self.requests.entry(request_id.clone()) {
            Entry::Occupied(mut occupied) => {
                if let Some(candidate) = occupied.insert(tracked).candidate {
                    self.remove_from_index(&candidate, request_id);
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(tracked);
            }
        }
        self.stats.tracked.fetch_add(1, Ordering::Relaxed);
        debug!(
            request_id = %request_id,
            ttft_target_ms = slo.ttft_target_ms,
            tpot_target_ms = slo.tpot_target_ms,
            "Tracking request SLO"
        );
        Ok(())
    }

    /// Bind a tracked request to the replica it was routed to
    pub fn assign(&self, request_id: &RequestId, candidate_id: &CandidateId) -> Result<()> {
        // the request entry stays locked until the index reflects the assignment
        let mut entry = self
            .requests
            .get_mut(request_id)
            .ok_or_else(|| Error::not_found(format!("request {} is not tracked", request_id)))?;

        if let Some(previous) = entry.candidate.replace(candidate_id.clone()) {
            if &previous == candidate_id {
                return Ok(());
            }
            self.remove_from_index(&previous, request_id);
        }

        let mut index = self.candidates.entry(candidate_id.clone()).or_default();
        index.targets.insert(request_id.clone(), entry.slo);
        index.recompute();
        self.stats.assigned.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Stop tracking a request; returns its SLO if it was tracked
    pub fn untrack(&self, request_id: &RequestId) -> Option<RequestSlo> {
        let Entry::Occupied(occupied) = self.requests.entry(request_id.clone()) else {
            return None;
        };
        if let Some(candidate) = &occupied.get().candidate {
            self.remove_from_index(candidate, request_id);
        }
        let tracked = occupied.remove();
        self.stats.untracked.fetch_add(1, Ordering::Relaxed);
        Some(tracked.slo)
    }

    fn remove_from_index(&self, candidate_id: &CandidateId, request_id: &RequestId) {
        let emptied = match self.candidates.get_mut(candidate_id) {
            Some(mut index) => {
                if index.targets.remove(request_id).is_some() {
                    index.recompute();
                }
                index.targets.is_empty()
            }
            None => false,
        };
        if emptied {
            self.candidates
                .remove_if(candidate_id, |_, index| index.targets.is_empty());
        }
    }

    /// Tightest target of the metric among requests assigned to the candidate
    pub fn strictest_for(&self, candidate_id: &CandidateId, metric: Metric) -> Option<f64> {
        self.candidates
            .get(candidate_id)
            .and_then(|index| index.strictest(metric))
    }

    /// Fill strictest running targets into a candidate snapshot
    pub fn annotate(&self, candidates: &mut [Candidate]) {
        for candidate in candidates.iter_mut() {
            match self.candidates.get(&candidate.id) {
                Some(index) => {
                    candidate.strictest_running_ttft_ms = index.strictest_ttft_ms;
                    candidate.strictest_running_tpot_ms = index.strictest_tpot_ms;
                }
                None => {
                    candidate.strictest_running_ttft_ms = None;
                    candidate.strictest_running_tpot_ms = None;
                }
            }
        }
    }

    /// SLO of a tracked request
    pub fn slo_of(&self, request_id: &RequestId) -> Option<RequestSlo> {
        self.requests.get(request_id).map(|r| r.slo)
    }

    /// Replica a tracked request was assigned to
    pub fn candidate_of(&self, request_id: &RequestId) -> Option<CandidateId> {
        self.requests.get(request_id).and_then(|r| r.candidate.clone())
    }

    /// Remove requests tracked longer than `max_age`; returns their ids
    pub fn expire_stale(&self, max_age: Duration) -> Vec<RequestId> {
        let stale: Vec<RequestId> = self
            .requests
            .iter()
            .filter(|entry| entry.tracked_at.elapsed() >= max_age)
            .map(|entry| entry.key().clone())
            .collect();

        for request_id in &stale {
            self.untrack(request_id);
        }

        if !stale.is_empty() {
            self.stats
                .expired
                .fetch_add(stale.len() as u64, Ordering::Relaxed);
            info!(
                expired = stale.len(),
                max_age_ms = max_age.as_millis() as u64,
                "Expired stale request SLOs"
            );
        }
        stale
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn stats(&self) -> &TrackerStats {
        &self.stats
    }
}
