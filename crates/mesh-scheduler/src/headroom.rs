//! Headroom evaluation and in-bucket scoring
//!
//! Headroom is the signed slack between a target and a forecast. A candidate
//! whose TTFT and TPOT headroom are both non-negative lands in the positive
//! bucket, anything else in the negative bucket.

use mesh_core::{CandidateId, Forecast, HeadroomConfig, HeadroomStrategy, RequestSlo};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Headroom classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bucket {
    /// Both targets met by the forecast
    Positive,
    /// At least one target violated
    Negative,
}

impl Bucket {
    pub fn as_str(&self) -> &'static str {
        match self {
            Bucket::Positive => "positive",
            Bucket::Negative => "negative",
        }
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Signed headroom of one candidate against one SLO
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Headroom {
    pub ttft_ms: f64,
    pub tpot_ms: f64,
    pub bucket: Bucket,
}

impl Headroom {
    /// TTFT deficit, 0 when the target is met
    pub fn ttft_deficit_ms(&self) -> f64 {
        (-self.ttft_ms).max(0.0)
    }

    /// TPOT deficit, 0 when the target is met
    pub fn tpot_deficit_ms(&self) -> f64 {
        (-self.tpot_ms).max(0.0)
    }
}

/// Computes headroom and ranks candidates inside a bucket
#[derive(Debug, Clone)]
pub struct HeadroomEvaluator {
    config: HeadroomConfig,
}

impl HeadroomEvaluator {
    pub fn new(config: HeadroomConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &HeadroomConfig {
        &self.config
    }

    /// Headroom of a forecast against an SLO
    pub fn evaluate(&self, forecast: &Forecast, slo: &RequestSlo) -> Headroom {
        let ttft_ms = slo.ttft_target_ms - forecast.ttft_p90_ms;
        let tpot_ms = slo.tpot_target_ms * self.config.slo_buffer_factor - forecast.tpot_p90_ms;
        let bucket = if ttft_ms >= 0.0 && tpot_ms >= 0.0 {
            Bucket::Positive
        } else {
            Bucket::Negative
        };
        Headroom {
            ttft_ms,
            tpot_ms,
            bucket,
        }
    }

    /// Score every entry of one bucket in [0, 1], higher is better
    ///
    /// Values are min-max normalized within the bucket; a bucket where all
    /// candidates share a value normalizes that metric to 1. The positive
    /// bucket follows the configured strategy, the negative bucket always
    /// prefers the smallest deficit.
    pub fn score_bucket(&self, bucket: Bucket, entries: &[(CandidateId, Headroom)]) -> Vec<(CandidateId, f64)> {
        if entries.is_empty() {
            return Vec::new();
        }

        let (ttft, tpot, ttft_weight, tpot_weight) = match bucket {
            Bucket::Positive => {
                let ttft: Vec<f64> = entries.iter().map(|(_, h)| h.ttft_ms).collect();
                let tpot: Vec<f64> = entries.iter().map(|(_, h)| h.tpot_ms).collect();
                let (ttft, tpot) = match self.config.strategy {
                    HeadroomStrategy::Least => (normalize_lower_better(&ttft), normalize_lower_better(&tpot)),
                    HeadroomStrategy::Most => (normalize_higher_better(&ttft), normalize_higher_better(&tpot)),
                };
                (ttft, tpot, self.config.positive_ttft_weight, self.config.positive_tpot_weight)
            }
            Bucket::Negative => {
                let ttft: Vec<f64> = entries.iter().map(|(_, h)| h.ttft_deficit_ms()).collect();
                let tpot: Vec<f64> = entries.iter().map(|(_, h)| h.tpot_deficit_ms()).collect();
                (
                    normalize_lower_better(&ttft),
                    normalize_lower_better(&tpot),
                    self.config.negative_ttft_weight,
                    self.config.negative_tpot_weight,
                )
            }
        };

        let total_weight = ttft_weight + tpot_weight;
        entries
            .iter()
            .enumerate()
            .map(|(i, (id, _))| {
                let score = if total_weight > 0.0 {
                    (ttft_weight * ttft[i] + tpot_weight * tpot[i]) / total_weight
                } else {
                    1.0
                };
                (id.clone(), score.clamp(0.0, 1.0))
            })
            .collect()
    }
}

fn range(values: &[f64]) -> (f64, f64) {
    values
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(*v), hi.max(*v)))
}

/// 1 for the smallest value, 0 for the largest
fn normalize_lower_better(values: &[f64]) -> Vec<f64> {
    let (lo, hi) = range(values);
    normalize(values, |v| hi / 2.0 - v / 2.0, hi / 2.0 - lo / 2.0)
}

/// 1 for the largest value, 0 for the smallest
fn normalize_higher_better(values: &[f64]) -> Vec<f64> {
    let (lo, hi) = range(values);
    normalize(values, |v| v / 2.0 - lo / 2.0, hi / 2.0 - lo / 2.0)
}

// halves keep the span finite for any pair of finite values
fn normalize(values: &[f64], offset: impl Fn(f64) -> f64, half_span: f64) -> Vec<f64> {
    if !(half_span > 0.0 && half_span.is_finite()) {
        return vec![1.0; values.len()];
    }
    values
        .iter()
        .map(|v| {
            let normalized = offset(*v) / half_span;
            if normalized.is_nan() {
                0.0
            } else {
                normalized.clamp(0.0, 1.0)
            }
        })
        .collect()
}
