//! Observed-latency sample collection
//!
//! A sample is opened when a request is routed, filled in while the response
//! streams, and finalized into a bounded [`UploadBuffer`] that the
//! [`crate::uploader::SampleUploader`] drains in the background. TPOT is
//! sampled every `stride` decode tokens; `token_index` counts decode tokens
//! after the first one starting at 1, so index 0 is never a TPOT sample.

use chrono::Utc;
use dashmap::DashMap;
use mesh_core::{
    CandidateId, Forecast, LatencyReport, LatencySample, LiveFeatures, RequestId,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Whether a decode token at `token_index` is a TPOT sample
pub fn is_sampled(token_index: u32, stride: u32) -> bool {
    stride > 0 && token_index > 0 && token_index % stride == 0
}

#[derive(Debug)]
struct PendingSample {
    candidate_id: CandidateId,
    features: LiveFeatures,
    forecast: Option<Forecast>,
    observed_ttft_ms: Option<f64>,
    sampled_token_indices: Vec<u32>,
    observed_tpot_ms: Vec<f64>,
    started: Instant,
}

impl PendingSample {
    fn new(candidate_id: CandidateId, features: LiveFeatures, forecast: Option<Forecast>) -> Self {
        Self {
            candidate_id,
            features,
            forecast,
            observed_ttft_ms: None,
            sampled_token_indices: Vec::new(),
            observed_tpot_ms: Vec::new(),
            started: Instant::now(),
        }
    }

    fn has_observations(&self) -> bool {
        self.observed_ttft_ms.is_some() || !self.observed_tpot_ms.is_empty()
    }

    fn report(&self) -> LatencyReport {
        let mut report = LatencyReport::from_prediction(self.forecast.as_ref());
        report.observed_ttft_ms = self.observed_ttft_ms;
        report.sampled_token_indices = self.sampled_token_indices.clone();
        report.observed_tpot_ms = self.observed_tpot_ms.clone();
        if let Some(forecast) = &self.forecast {
            report.predicted_tpot_ms = vec![forecast.tpot_p90_ms; self.observed_tpot_ms.len()];
        }
        report
    }
}

/// Collects per-request observations while responses stream
pub struct SampleCollector {
    stride: u32,
    pending: DashMap<RequestId, PendingSample>,
    buffer: Arc<UploadBuffer>,
}

impl SampleCollector {
    pub fn new(stride: u32, buffer: Arc<UploadBuffer>) -> Self {
        Self {
            stride,
            pending: DashMap::new(),
            buffer,
        }
    }

    pub fn stride(&self) -> u32 {
        self.stride
    }

    pub fn buffer(&self) -> &Arc<UploadBuffer> {
        &self.buffer
    }

    /// Open a sample for a routed request
    pub fn begin(
        &self,
        request_id: &RequestId,
        candidate_id: &CandidateId,
        features: LiveFeatures,
        forecast: Option<Forecast>,
    ) {
        self.pending.insert(
            request_id.clone(),
            PendingSample::new(candidate_id.clone(), features, forecast),
        );
    }

    /// Record the observed time to first token
    pub fn record(&self, request_id: &RequestId, candidate_id: &CandidateId, ttft_ms: f64) {
        if !ttft_ms.is_finite() || ttft_ms < 0.0 {
            warn!(request_id = %request_id, ttft_ms, "Ignoring invalid TTFT observation");
            return;
        }
        let mut entry = self.pending.entry(request_id.clone()).or_insert_with(|| {
            PendingSample::new(candidate_id.clone(), LiveFeatures::default(), None)
        });
        entry.candidate_id = candidate_id.clone();
        entry.observed_ttft_ms = Some(ttft_ms);
    }

    /// Record one decode tick; returns whether it was kept as a TPOT sample
    pub fn record_tpot_tick(&self, request_id: &RequestId, token_index: u32, tpot_ms: f64) -> bool {
        if !is_sampled(token_index, self.stride) {
            return false;
        }
        if !tpot_ms.is_finite() || tpot_ms < 0.0 {
            warn!(request_id = %request_id, token_index, tpot_ms, "Ignoring invalid TPOT observation");
            return false;
        }
        match self.pending.get_mut(request_id) {
            Some(mut sample) => {
                sample.sampled_token_indices.push(token_index);
                sample.observed_tpot_ms.push(tpot_ms);
                true
            }
            None => {
                debug!(request_id = %request_id, token_index, "TPOT tick for unknown request");
                false
            }
        }
    }

    /// Close the sample, enqueue it for upload and return the latency report
    ///
    /// Samples without any observation are not enqueued.
    pub fn finalize(&self, request_id: &RequestId) -> Option<LatencyReport> {
        let (_, sample) = self.pending.remove(request_id)?;
        let report = sample.report();

        if sample.has_observations() {
            self.buffer.push(LatencySample {
                request_id: request_id.clone(),
                candidate_id: sample.candidate_id,
                observed_ttft_ms: sample.observed_ttft_ms,
                observed_tpot_ms: sample.observed_tpot_ms,
                features: sample.features,
                forecast: sample.forecast,
                timestamp: Utc::now(),
            });
        } else {
            debug!(request_id = %request_id, "Finalized sample without observations, not uploading");
        }

        Some(report)
    }

    /// Drop an open sample without uploading it
    pub fn discard(&self, request_id: &RequestId) -> bool {
        self.pending.remove(request_id).is_some()
    }

    /// Drop open samples older than `max_age`
    pub fn expire_stale(&self, max_age: Duration) -> usize {
        let before = self.pending.len();
        self.pending.retain(|_, sample| sample.started.elapsed() < max_age);
        before.saturating_sub(self.pending.len())
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

/// Upload buffer counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferStats {
    pub enqueued: u64,
    pub evicted: u64,
    pub acknowledged: u64,
    pub len: usize,
}

/// Samples read from the buffer but not yet acknowledged
#[derive(Debug, Clone)]
pub struct PendingBatch {
    /// Highest sequence number in the batch
    pub up_to_seq: u64,
    pub samples: Vec<LatencySample>,
}

/// Queue contents; sequence numbers are assigned under the same lock so
/// `entries` is always in strictly increasing seq order
#[derive(Default)]
struct BufferState {
    next_seq: u64,
    entries: VecDeque<(u64, LatencySample)>,
}

/// Capacity-capped FIFO of finalized samples, evicting oldest first
pub struct UploadBuffer {
    capacity: usize,
    state: Mutex<BufferState>,
    enqueued: AtomicU64,
    evicted: AtomicU64,
    acknowledged: AtomicU64,
}

impl UploadBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(BufferState::default()),
            enqueued: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
            acknowledged: AtomicU64::new(0),
        }
    }

    /// Append a sample; returns true if the oldest sample was evicted
    pub fn push(&self, sample: LatencySample) -> bool {
        let mut state = self.state.lock();
        let mut evicted = false;
        while state.entries.len() >= self.capacity {
            if let Some((_, dropped)) = state.entries.pop_front() {
                self.evicted.fetch_add(1, Ordering::Relaxed);
                evicted = true;
                debug!(request_id = %dropped.request_id, "Upload buffer full, evicted oldest sample");
            }
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.entries.push_back((seq, sample));
        self.enqueued.fetch_add(1, Ordering::Relaxed);
        evicted
    }

    /// Oldest `max` samples, left in place until acknowledged
    pub fn peek_batch(&self, max: usize) -> Option<PendingBatch> {
        let state = self.state.lock();
        let batch: Vec<&(u64, LatencySample)> = state.entries.iter().take(max).collect();
        let up_to_seq = batch.iter().map(|(seq, _)| *seq).max()?;
        Some(PendingBatch {
            up_to_seq,
            samples: batch.into_iter().map(|(_, sample)| sample.clone()).collect(),
        })
    }

    /// Remove every sample with a sequence number up to and including `up_to_seq`
    ///
    /// Samples evicted while the batch was in flight are simply gone, so the
    /// count can be lower than the batch size.
    pub fn acknowledge(&self, up_to_seq: u64) -> usize {
        let mut state = self.state.lock();
        let mut removed = 0;
        while state.entries.front().map_or(false, |(seq, _)| *seq <= up_to_seq) {
            state.entries.pop_front();
            removed += 1;
        }
        self.acknowledged.fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> BufferStats {
        BufferStats {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            acknowledged: self.acknowledged.load(Ordering::Relaxed),
            len: self.len(),
        }
    }
}
