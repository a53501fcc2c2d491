//! Serving replicas under consideration and the forecasts made for them

use crate::{CandidateId, Metric};
use serde::{Deserialize, Serialize};

/// Live load signals of one replica, captured once per scheduling decision
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LiveFeatures {
    /// KV-cache occupancy fraction (0.0 to 1.0)
    pub kv_cache_usage: f64,

    /// Prompt length of the request being scheduled, in tokens
    pub input_tokens: u32,

    /// Requests waiting in the replica's queue
    pub waiting_requests: u32,

    /// Requests currently decoding on the replica
    pub running_requests: u32,

    /// Prefix-cache overlap between the request and the replica (0.0 to 1.0)
    pub prefix_cache_score: f64,
}

/// A serving replica eligible to receive a request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    /// Replica identifier
    pub id: CandidateId,

    /// Requests currently running on this replica
    pub running_request_count: u32,

    /// Tightest TTFT target among requests tracked against this replica
    #[serde(default)]
    pub strictest_running_ttft_ms: Option<f64>,

    /// Tightest TPOT target among requests tracked against this replica
    #[serde(default)]
    pub strictest_running_tpot_ms: Option<f64>,

    /// Live load snapshot
    pub features: LiveFeatures,
}

impl Candidate {
    /// Create a candidate from a live snapshot
    pub fn new(id: impl Into<CandidateId>, features: LiveFeatures) -> Self {
        Self {
            id: id.into(),
            running_request_count: features.running_requests,
            strictest_running_ttft_ms: None,
            strictest_running_tpot_ms: None,
            features,
        }
    }

    /// Strictest running target for a metric, if any request is tracked here
    pub fn strictest_running(&self, metric: Metric) -> Option<f64> {
        match metric {
            Metric::Ttft => self.strictest_running_ttft_ms,
            Metric::Tpot => self.strictest_running_tpot_ms,
        }
    }
}

/// p90 latency forecast for one (request, candidate) pair
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Forecast {
    /// Predicted p90 time to first token
    pub ttft_p90_ms: f64,

    /// Predicted p90 time per output token
    pub tpot_p90_ms: f64,

    /// Forecaster-reported uncertainty, 0 when not provided
    #[serde(default)]
    pub uncertainty: f64,
}

impl Forecast {
    pub fn new(ttft_p90_ms: f64, tpot_p90_ms: f64) -> Self {
        Self {
            ttft_p90_ms,
            tpot_p90_ms,
            uncertainty: 0.0,
        }
    }

    /// Forecast for the given metric
    pub fn value(&self, metric: Metric) -> f64 {
        match metric {
            Metric::Ttft => self.ttft_p90_ms,
            Metric::Tpot => self.tpot_p90_ms,
        }
    }

    /// Absolute latency used by best-effort ranking
    pub fn combined_ms(&self) -> f64 {
        self.ttft_p90_ms + self.tpot_p90_ms
    }

    /// Forecast values must be finite and non-negative
    pub fn is_valid(&self) -> bool {
        self.ttft_p90_ms.is_finite()
            && self.tpot_p90_ms.is_finite()
            && self.ttft_p90_ms >= 0.0
            && self.tpot_p90_ms >= 0.0
    }
}
