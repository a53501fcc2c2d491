//! Error handling for the scheduling core
//!
//! Provides the unified error type shared by the predict and scheduler crates.
//! Only [`Error::InvalidSlo`] is ever surfaced to the caller of a scheduling
//! decision; the other variants are absorbed and degrade the decision.

use crate::CandidateId;

/// Result type alias for scheduling core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for the scheduling core
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed or negative SLO target on a request
    #[error("Invalid SLO: {0}")]
    InvalidSlo(String),

    /// A single candidate could not be forecast in time
    #[error("Forecast unavailable for candidate {candidate}: {reason}")]
    ForecastUnavailable {
        candidate: CandidateId,
        reason: String,
    },

    /// No candidate returned a forecast for this decision
    #[error("All forecasts unavailable ({0} candidates)")]
    AllForecastsUnavailable(usize),

    /// Training service rejected or did not acknowledge a sample batch
    #[error("Upload failure: {0}")]
    UploadFailure(String),

    /// Rejected scheduler configuration
    #[error("Invalid scheduler configuration: {0}")]
    InvalidConfiguration(String),

    /// Connection, status or decode failure against forecaster or trainer
    #[error("Service call failed: {0}")]
    Transport(String),

    /// Forecaster or trainer did not answer in time
    #[error("Service call timed out: {0}")]
    Timeout(String),

    /// Unknown request id or trainer model
    #[error("Not found: {0}")]
    NotFound(String),

    /// Configuration source could not be read or deserialized
    #[error("Failed to load configuration: {0}")]
    Config(#[from] config::ConfigError),
}

impl Error {
    /// Create an invalid SLO error
    pub fn invalid_slo(msg: impl Into<String>) -> Self {
        Self::InvalidSlo(msg.into())
    }

    /// Create a forecast unavailable error for one candidate
    pub fn forecast_unavailable(candidate: CandidateId, reason: impl Into<String>) -> Self {
        Self::ForecastUnavailable {
            candidate,
            reason: reason.into(),
        }
    }

    /// Create an upload failure error
    pub fn upload(msg: impl Into<String>) -> Self {
        Self::UploadFailure(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Worth another attempt with backoff
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::Timeout(_) | Error::UploadFailure(_))
    }

    /// Check if this error is visible to the caller of a scheduling decision
    pub fn is_user_visible(&self) -> bool {
        matches!(self, Error::InvalidSlo(_))
    }

    /// Stable label for logs, metrics and error bodies
    pub fn category(&self) -> &'static str {
        match self {
            Error::InvalidSlo(_) => "invalid_slo",
            Error::ForecastUnavailable { .. } => "forecast_unavailable",
            Error::AllForecastsUnavailable(_) => "all_forecasts_unavailable",
            Error::UploadFailure(_) => "upload_failure",
            Error::InvalidConfiguration(_) => "configuration",
            Error::Transport(_) => "transport",
            Error::Timeout(_) => "timeout",
            Error::NotFound(_) => "not_found",
            Error::Config(_) => "config",
        }
    }

    /// Status used when the error reaches the HTTP surface
    pub fn to_http_status(&self) -> u16 {
        match self {
            Error::InvalidSlo(_) | Error::InvalidConfiguration(_) => 400,
            Error::NotFound(_) => 404,
            Error::Timeout(_) => 504,
            Error::ForecastUnavailable { .. } | Error::AllForecastsUnavailable(_) => 503,
            Error::Transport(_) | Error::UploadFailure(_) => 502,
            _ => 500,
        }
    }
}
