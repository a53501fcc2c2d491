//! Observed-latency samples and trainer metadata

use crate::{CandidateId, Forecast, LiveFeatures, RequestId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Observed latencies of one finished request, as uploaded to the trainer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencySample {
    pub request_id: RequestId,
    pub candidate_id: CandidateId,

    /// Observed time to first token, absent if the stream never produced one
    pub observed_ttft_ms: Option<f64>,

    /// Strided TPOT observations
    pub observed_tpot_ms: Vec<f64>,

    /// Replica snapshot the request was scheduled against
    pub features: LiveFeatures,

    /// Forecast used when the request was scheduled, if any
    #[serde(default)]
    pub forecast: Option<Forecast>,

    /// Finalization time
    pub timestamp: DateTime<Utc>,
}

/// Predicted vs observed latencies surfaced on stream completion
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencyReport {
    pub predicted_ttft_ms: Option<f64>,
    pub observed_ttft_ms: Option<f64>,

    /// Token indices at which TPOT was sampled
    pub sampled_token_indices: Vec<u32>,

    /// Predicted TPOT at each sampled index
    pub predicted_tpot_ms: Vec<f64>,

    /// Observed TPOT at each sampled index
    pub observed_tpot_ms: Vec<f64>,
}

impl LatencyReport {
    /// Absolute TTFT prediction error, when both sides are known
    pub fn ttft_error_ms(&self) -> Option<f64> {
        match (self.predicted_ttft_ms, self.observed_ttft_ms) {
            (Some(predicted), Some(observed)) => Some((predicted - observed).abs()),
            _ => None,
        }
    }

    /// Mean absolute TPOT prediction error over the sampled indices
    pub fn mean_tpot_error_ms(&self) -> Option<f64> {
        let n = self.predicted_tpot_ms.len().min(self.observed_tpot_ms.len());
        if n == 0 {
            return None;
        }
        let total: f64 = self
            .predicted_tpot_ms
            .iter()
            .zip(&self.observed_tpot_ms)
            .map(|(p, o)| (p - o).abs())
            .sum();
        Some(total / n as f64)
    }

    /// Empty report carrying the scheduling-time prediction
    pub fn from_prediction(forecast: Option<&Forecast>) -> Self {
        Self {
            predicted_ttft_ms: forecast.map(|f| f.ttft_p90_ms),
            ..Default::default()
        }
    }
}

/// Batched sample upload body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleBatch {
    pub samples: Vec<LatencySample>,
}

/// Trainer acknowledgement of a sample batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestAck {
    pub accepted: usize,
}

/// Trainer-side metadata of the current forecasting model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub version: String,
    pub trained_at: DateTime<Utc>,
    pub sample_count: u64,
}

/// Reference to the model artifact forecasters are serving
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifactRef {
    pub name: String,
    pub version: String,
    pub fetched_at: DateTime<Utc>,
}

impl ModelArtifactRef {
    pub fn from_info(name: impl Into<String>, info: &ModelInfo) -> Self {
        Self {
            name: name.into(),
            version: info.version.clone(),
            fetched_at: Utc::now(),
        }
    }
}
