//! Per-request SLO targets and the request context they are parsed from
//!
//! Targets arrive either as structured fields on the schedule request or as
//! request headers. Structured fields win when both are present. A request that
//! enables prediction without naming targets gets `0` for each target, which
//! downstream scoring reads as "minimize, no slack".

use crate::{Error, Metric, RequestId, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Header carrying the prediction-enablement signal
pub const PREDICTION_HEADER: &str = "x-prediction-based-scheduling";

/// Header carrying the TTFT target in milliseconds
pub const TTFT_SLO_HEADER: &str = "x-slo-ttft-ms";

/// Header carrying the TPOT target in milliseconds
pub const TPOT_SLO_HEADER: &str = "x-slo-tpot-ms";

/// Header carrying the request priority
pub const PRIORITY_HEADER: &str = "x-request-priority";

/// Latency objective attached to one request
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RequestSlo {
    /// Maximum time to first token, 0 when unset
    pub ttft_target_ms: f64,

    /// Maximum time per output token, 0 when unset
    pub tpot_target_ms: f64,

    /// Negative priorities are sheddable
    pub priority: i32,

    /// Whether the predictive profile was requested
    pub prediction_enabled: bool,
}

impl RequestSlo {
    /// Create a validated SLO
    pub fn new(
        ttft_target_ms: f64,
        tpot_target_ms: f64,
        priority: i32,
        prediction_enabled: bool,
    ) -> Result<Self> {
        let slo = Self {
            ttft_target_ms,
            tpot_target_ms,
            priority,
            prediction_enabled,
        };
        slo.validate()?;
        Ok(slo)
    }

    /// SLO with no targets: prediction enabled, lowest latency wins
    pub fn best_effort(priority: i32) -> Self {
        Self {
            ttft_target_ms: 0.0,
            tpot_target_ms: 0.0,
            priority,
            prediction_enabled: true,
        }
    }

    /// Reject negative or non-finite targets
    pub fn validate(&self) -> Result<()> {
        for (metric, value) in [
            (Metric::Ttft, self.ttft_target_ms),
            (Metric::Tpot, self.tpot_target_ms),
        ] {
            if !value.is_finite() {
                return Err(Error::invalid_slo(format!("{} target is not finite", metric)));
            }
            if value < 0.0 {
                return Err(Error::invalid_slo(format!(
                    "{} target must be >= 0, got {}",
                    metric, value
                )));
            }
        }
        Ok(())
    }

    /// Target for the given metric
    pub fn target(&self, metric: Metric) -> f64 {
        match metric {
            Metric::Ttft => self.ttft_target_ms,
            Metric::Tpot => self.tpot_target_ms,
        }
    }

    /// Both targets unset
    pub fn is_best_effort(&self) -> bool {
        self.ttft_target_ms == 0.0 && self.tpot_target_ms == 0.0
    }

    /// Low-priority requests are shed instead of placed on a violating replica
    pub fn is_sheddable(&self) -> bool {
        self.priority < 0
    }
}

/// SLO values supplied as structured request fields
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SloFields {
    #[serde(default)]
    pub prediction_enabled: Option<bool>,
    #[serde(default)]
    pub ttft_target_ms: Option<f64>,
    #[serde(default)]
    pub tpot_target_ms: Option<f64>,
    #[serde(default)]
    pub priority: Option<i32>,
}

/// Request-level inputs to the forecaster
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestFeatures {
    /// Prompt length in tokens
    pub input_tokens: u32,

    /// Requested generation limit, if known
    #[serde(default)]
    pub max_output_tokens: Option<u32>,
}

impl RequestFeatures {
    pub fn new(input_tokens: u32) -> Self {
        Self {
            input_tokens,
            max_output_tokens: None,
        }
    }
}

/// Everything the scheduler knows about an incoming request
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Unique request ID
    pub request_id: RequestId,

    /// Request headers, keys lowercased
    pub headers: HashMap<String, String>,

    /// Structured SLO fields
    pub slo_fields: SloFields,

    /// Forecaster inputs
    pub features: RequestFeatures,

    /// Arrival timestamp
    pub timestamp: DateTime<Utc>,
}

impl RequestContext {
    /// Create a new request context
    pub fn new(request_id: impl Into<RequestId>) -> Self {
        Self {
            request_id: request_id.into(),
            headers: HashMap::new(),
            slo_fields: SloFields::default(),
            features: RequestFeatures::default(),
            timestamp: Utc::now(),
        }
    }

    /// Add header
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into().to_lowercase(), value.into());
        self
    }

    /// Set structured SLO fields
    pub fn with_slo_fields(mut self, fields: SloFields) -> Self {
        self.slo_fields = fields;
        self
    }

    /// Set forecaster inputs
    pub fn with_features(mut self, features: RequestFeatures) -> Self {
        self.features = features;
        self
    }

    /// Look up a header case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_lowercase()).map(|v| v.trim())
    }

    /// Whether the request carries the prediction-enablement signal
    pub fn prediction_requested(&self) -> bool {
        if let Some(enabled) = self.slo_fields.prediction_enabled {
            return enabled;
        }
        self.header(PREDICTION_HEADER).map(parse_flag).unwrap_or(false)
    }

    /// Parse the request's SLO from fields and headers
    pub fn slo(&self) -> Result<RequestSlo> {
        let ttft = match self.slo_fields.ttft_target_ms {
            Some(v) => v,
            None => self.header_f64(TTFT_SLO_HEADER)?.unwrap_or(0.0),
        };
        let tpot = match self.slo_fields.tpot_target_ms {
            Some(v) => v,
            None => self.header_f64(TPOT_SLO_HEADER)?.unwrap_or(0.0),
        };
        let priority = match self.slo_fields.priority {
            Some(p) => p,
            None => match self.header(PRIORITY_HEADER) {
                Some(raw) => raw.parse::<i32>().map_err(|_| {
                    Error::invalid_slo(format!("{} is not an integer: '{}'", PRIORITY_HEADER, raw))
                })?,
                None => 0,
            },
        };

        RequestSlo::new(ttft, tpot, priority, self.prediction_requested())
    }

    fn header_f64(&self, name: &str) -> Result<Option<f64>> {
        match self.header(name) {
            Some(raw) if !raw.is_empty() => raw
                .parse::<f64>()
                .map(Some)
                .map_err(|_| Error::invalid_slo(format!("{} is not a number: '{}'", name, raw))),
            _ => Ok(None),
        }
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new(RequestId::generate())
    }
}

fn parse_flag(raw: &str) -> bool {
    matches!(raw.to_lowercase().as_str(), "true" | "1" | "yes" | "on")
}
