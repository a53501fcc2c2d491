//! # mesh-core
//!
//! Core types, traits, and utilities for the predictive SLO-aware scheduler.
//!
//! This crate provides the foundational data structures and interfaces that are
//! shared across the predict and scheduler crates. It includes:
//!
//! - Request SLOs and the request context they are parsed from
//! - Candidates, live features, and latency forecasts
//! - Latency samples and trainer metadata
//! - The forecaster and trainer service traits
//! - Configuration schema and loading
//! - Error handling types

pub mod candidate;
pub mod config;
pub mod error;
pub mod sample;
pub mod slo;
pub mod traits;
pub mod types;

// Re-export commonly used types at the crate root
pub use candidate::{Candidate, Forecast, LiveFeatures};
pub use config::{
    ForecastConfig, HeadroomConfig, ObservabilityConfig, PluginConfig, ProfilesConfig,
    SamplesConfig, SchedulerConfig, ServerConfig, TrackerConfig, TrainerConfig,
};
pub use error::{Error, Result};
pub use sample::{IngestAck, LatencyReport, LatencySample, ModelArtifactRef, ModelInfo, SampleBatch};
pub use slo::{RequestContext, RequestFeatures, RequestSlo, SloFields};
pub use traits::{Forecaster, TrainerClient};
pub use types::{CandidateId, EndpointSelection, HeadroomStrategy, Metric, ProfileName, RequestId};
