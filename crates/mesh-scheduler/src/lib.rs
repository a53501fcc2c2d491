//! # mesh-scheduler
//!
//! Predictive SLO-aware scheduling for inference requests.
//!
//! This crate provides:
//! - The request SLO tracker and per-replica strictest-target index
//! - Headroom evaluation and the SLO scorer with shedding
//! - Baseline queue/cache/prefix scoring and per-request profile routing
//! - The [`Scheduler`] facade driving a request from decision to completion
//! - Prometheus metrics and the HTTP surface
//!
//! ## Example
//!
//! ```rust,no_run
//! use mesh_core::{RequestContext, SchedulerConfig};
//! use mesh_predict::{HttpForecaster, UploadBuffer};
//! use mesh_scheduler::Scheduler;
//! use std::sync::Arc;
//!
//! # async fn run() -> mesh_scheduler::Result<()> {
//! let config = SchedulerConfig::default();
//! let forecaster = Arc::new(HttpForecaster::new(&config.forecast)?);
//! let buffer = Arc::new(UploadBuffer::new(config.samples.buffer_capacity));
//! let scheduler = Scheduler::new(config, forecaster, buffer)?;
//!
//! let outcome = scheduler.schedule(RequestContext::new("req-1"), Vec::new()).await?;
//! # let _ = outcome;
//! # Ok(())
//! # }
//! ```

use thiserror::Error;

pub mod baseline;
pub mod headroom;
pub mod metrics;
pub mod profile;
pub mod scheduler;
pub mod scorer;
pub mod server;
pub mod tracker;

pub use baseline::{BaselinePick, BaselineProfile, BaselineScorer};
pub use headroom::{Bucket, Headroom, HeadroomEvaluator};
pub use metrics::SchedulerMetrics;
pub use profile::ProfileRouter;
pub use scheduler::{Decision, DecisionMode, Scheduler, SchedulingOutcome};
pub use scorer::{ScoreOutcome, Selection, SelectionMode, SloScorer};
pub use server::{create_app, AppState};
pub use tracker::RequestSloTracker;

/// Result type for scheduler operations
pub type Result<T> = std::result::Result<T, SchedulerError>;

/// Errors that can occur in the scheduler service
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error(transparent)]
    Core(#[from] mesh_core::Error),

    #[error("No candidates supplied")]
    NoCandidates,

    #[error("Metrics error: {0}")]
    Metrics(String),

    #[error("Server error: {0}")]
    Server(String),
}

impl SchedulerError {
    /// Convert to HTTP status code
    pub fn to_status_code(&self) -> u16 {
        match self {
            SchedulerError::Core(e) => e.to_http_status(),
            SchedulerError::NoCandidates => 400,
            SchedulerError::Metrics(_) => 500,
            SchedulerError::Server(_) => 500,
        }
    }
}

impl From<prometheus::Error> for SchedulerError {
    fn from(e: prometheus::Error) -> Self {
        SchedulerError::Metrics(e.to_string())
    }
}
