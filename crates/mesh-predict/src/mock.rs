//! In-process forecaster and trainer mocks for tests and local runs

use async_trait::async_trait;
use chrono::Utc;
use mesh_core::{
    Candidate, CandidateId, Error, Forecast, Forecaster, IngestAck, LatencySample, ModelInfo,
    RequestFeatures, RequestId, Result, TrainerClient,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone)]
enum MockBehavior {
    Answer(Forecast),
    Fail,
}

/// Mock forecaster answering from a per-candidate table
///
/// Candidates without an entry fail, as does any candidate marked with
/// [`MockForecaster::set_failure`].
#[derive(Debug, Default)]
pub struct MockForecaster {
    behaviors: RwLock<HashMap<CandidateId, MockBehavior>>,
    delays: RwLock<HashMap<CandidateId, Duration>>,
    calls: AtomicUsize,
    ready: AtomicBool,
}

impl MockForecaster {
    pub fn new() -> Self {
        Self {
            ready: AtomicBool::new(true),
            ..Default::default()
        }
    }

    /// Forecaster answering every listed candidate
    pub fn with_forecasts<I, S>(forecasts: I) -> Self
    where
        I: IntoIterator<Item = (S, Forecast)>,
        S: Into<CandidateId>,
    {
        let mock = Self::new();
        for (id, forecast) in forecasts {
            mock.set_forecast(id, forecast);
        }
        mock
    }

    pub fn set_forecast(&self, candidate: impl Into<CandidateId>, forecast: Forecast) {
        self.behaviors
            .write()
            .insert(candidate.into(), MockBehavior::Answer(forecast));
    }

    pub fn set_failure(&self, candidate: impl Into<CandidateId>) {
        self.behaviors.write().insert(candidate.into(), MockBehavior::Fail);
    }

    /// Delay every answer for this candidate
    pub fn set_delay(&self, candidate: impl Into<CandidateId>, delay: Duration) {
        self.delays.write().insert(candidate.into(), delay);
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Forecaster for MockForecaster {
    async fn forecast(
        &self,
        request_id: &RequestId,
        _request: &RequestFeatures,
        candidate: &Candidate,
    ) -> Result<Forecast> {
        self.calls.fetch_add(1, Ordering::Relaxed);

        let delay = self.delays.read().get(&candidate.id).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let behavior = self.behaviors.read().get(&candidate.id).cloned();
        debug!(request_id = %request_id, candidate = %candidate.id, behavior = ?behavior, "Mock forecast");
        match behavior {
            Some(MockBehavior::Answer(forecast)) => Ok(forecast),
            Some(MockBehavior::Fail) => Err(Error::forecast_unavailable(
                candidate.id.clone(),
                "mock failure",
            )),
            None => Err(Error::forecast_unavailable(
                candidate.id.clone(),
                "no mock forecast configured",
            )),
        }
    }

    async fn ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }
}

/// Mock trainer recording every uploaded batch
#[derive(Debug)]
pub struct MockTrainer {
    batches: RwLock<Vec<Vec<LatencySample>>>,
    failures_remaining: AtomicU32,
    ready: AtomicBool,
    model: RwLock<Option<ModelInfo>>,
}

impl Default for MockTrainer {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTrainer {
    pub fn new() -> Self {
        Self {
            batches: RwLock::new(Vec::new()),
            failures_remaining: AtomicU32::new(0),
            ready: AtomicBool::new(true),
            model: RwLock::new(None),
        }
    }

    /// Fail the next `count` ingest calls
    pub fn fail_next(&self, count: u32) {
        self.failures_remaining.store(count, Ordering::Relaxed);
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }

    /// Publish a model version
    pub fn set_model_version(&self, version: impl Into<String>) {
        let sample_count = self.received().len() as u64;
        *self.model.write() = Some(ModelInfo {
            version: version.into(),
            trained_at: Utc::now(),
            sample_count,
        });
    }

    /// Every sample received so far, in upload order
    pub fn received(&self) -> Vec<LatencySample> {
        self.batches.read().iter().flatten().cloned().collect()
    }

    /// Size of each received batch
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batches.read().iter().map(Vec::len).collect()
    }
}

#[async_trait]
impl TrainerClient for MockTrainer {
    async fn ingest(&self, samples: &[LatencySample]) -> Result<IngestAck> {
        let remaining = self.failures_remaining.load(Ordering::Relaxed);
        if remaining > 0 {
            self.failures_remaining.store(remaining - 1, Ordering::Relaxed);
            return Err(Error::transport("mock trainer unavailable"));
        }
        self.batches.write().push(samples.to_vec());
        Ok(IngestAck {
            accepted: samples.len(),
        })
    }

    async fn model_info(&self, model_name: &str) -> Result<ModelInfo> {
        self.model
            .read()
            .clone()
            .ok_or_else(|| Error::not_found(format!("model '{}'", model_name)))
    }

    async fn ready(&self) -> Result<bool> {
        Ok(self.ready.load(Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_core::LiveFeatures;

    #[tokio::test]
    async fn test_mock_forecaster() {
        let mock = MockForecaster::with_forecasts([("a", Forecast::new(10.0, 1.0))]);
        let rid = RequestId::new("r");
        let features = RequestFeatures::new(1);

        let a = Candidate::new("a", LiveFeatures::default());
        let b = Candidate::new("b", LiveFeatures::default());
        assert_eq!(mock.forecast(&rid, &features, &a).await.unwrap().ttft_p90_ms, 10.0);
        assert!(mock.forecast(&rid, &features, &b).await.is_err());

        mock.set_failure("a");
        assert!(mock.forecast(&rid, &features, &a).await.is_err());
        assert_eq!(mock.call_count(), 3);

        assert!(mock.ready().await);
        mock.set_ready(false);
        assert!(!mock.ready().await);
    }

    #[tokio::test]
    async fn test_mock_trainer_failures() {
        let trainer = MockTrainer::new();
        trainer.fail_next(1);
        assert!(trainer.ingest(&[]).await.is_err());
        assert_eq!(trainer.ingest(&[]).await.unwrap().accepted, 0);
        assert_eq!(trainer.batch_sizes(), vec![0]);
    }
}
