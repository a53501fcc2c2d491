//! Service boundaries of the scheduling core
//!
//! The forecaster and the trainer are external services. The scheduler only
//! sees them through these traits, which lets the HTTP clients in
//! `mesh-predict` and the in-process mocks be swapped freely.

use crate::{
    Candidate, Forecast, IngestAck, LatencySample, ModelInfo, RequestFeatures, RequestId, Result,
};
use async_trait::async_trait;

/// Latency forecasting service
#[async_trait]
pub trait Forecaster: Send + Sync {
    /// Forecast p90 latencies for one (request, candidate) pair
    async fn forecast(
        &self,
        request_id: &RequestId,
        request: &RequestFeatures,
        candidate: &Candidate,
    ) -> Result<Forecast>;

    /// Whether the forecaster can currently serve forecasts
    async fn ready(&self) -> bool {
        true
    }
}

/// Training service that ingests observed samples and publishes models
#[async_trait]
pub trait TrainerClient: Send + Sync {
    /// Upload a batch of samples
    async fn ingest(&self, samples: &[LatencySample]) -> Result<IngestAck>;

    /// Metadata of the named model
    async fn model_info(&self, model_name: &str) -> Result<ModelInfo>;

    /// Readiness probe
    async fn ready(&self) -> Result<bool>;
}
