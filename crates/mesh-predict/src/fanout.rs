//! Concurrent per-candidate forecasting under one deadline

use futures::stream::{FuturesUnordered, StreamExt};
use mesh_core::{
    Candidate, CandidateId, Error, Forecast, Forecaster, RequestFeatures, RequestId, Result,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Forecasts gathered for one scheduling decision
#[derive(Debug, Default)]
pub struct FanoutResult {
    /// Forecasts that arrived before the deadline, keyed by candidate
    pub forecasts: BTreeMap<CandidateId, Forecast>,

    /// Candidates whose forecast failed
    pub failures: Vec<(CandidateId, Error)>,

    /// Candidates still outstanding when the deadline passed
    pub timed_out: Vec<CandidateId>,
}

impl FanoutResult {
    /// Number of candidates that did not produce a forecast
    pub fn unavailable(&self) -> usize {
        self.failures.len() + self.timed_out.len()
    }

    /// Forecast for a candidate, if one arrived
    pub fn get(&self, candidate: &CandidateId) -> Option<&Forecast> {
        self.forecasts.get(candidate)
    }

    pub fn is_empty(&self) -> bool {
        self.forecasts.is_empty()
    }

    /// Forecasts, or `AllForecastsUnavailable` when none arrived
    pub fn require_any(self) -> Result<BTreeMap<CandidateId, Forecast>> {
        if self.forecasts.is_empty() {
            return Err(Error::AllForecastsUnavailable(self.unavailable()));
        }
        Ok(self.forecasts)
    }
}

/// Issues one forecast per candidate concurrently and joins them under a deadline
#[derive(Clone)]
pub struct ForecastFanout {
    forecaster: Arc<dyn Forecaster>,
    deadline: Duration,
}

impl ForecastFanout {
    pub fn new(forecaster: Arc<dyn Forecaster>, deadline: Duration) -> Self {
        Self {
            forecaster,
            deadline,
        }
    }

    pub fn forecaster(&self) -> &Arc<dyn Forecaster> {
        &self.forecaster
    }

    /// Forecast a single candidate, bounded by the fan-out deadline
    pub async fn forecast(
        &self,
        request_id: &RequestId,
        request: &RequestFeatures,
        candidate: &Candidate,
    ) -> Result<Forecast> {
        match tokio::time::timeout(
            self.deadline,
            self.forecaster.forecast(request_id, request, candidate),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(Error::forecast_unavailable(
                candidate.id.clone(),
                format!("no answer within {:?}", self.deadline),
            )),
        }
    }

    /// Forecast every candidate; late answers are dropped
    pub async fn forecast_all(
        &self,
        request_id: &RequestId,
        request: &RequestFeatures,
        candidates: &[Candidate],
    ) -> FanoutResult {
        let deadline = Instant::now() + self.deadline;
        let mut pending: FuturesUnordered<_> = candidates
            .iter()
            .map(|candidate| {
                let forecaster = Arc::clone(&self.forecaster);
                async move {
                    let result = forecaster.forecast(request_id, request, candidate).await;
                    (candidate.id.clone(), result)
                }
            })
            .collect();

        let mut result = FanoutResult::default();

        loop {
            match tokio::time::timeout_at(deadline, pending.next()).await {
                Ok(Some((candidate, Ok(forecast)))) => {
                    result.forecasts.insert(candidate, forecast);
                }
                Ok(Some((candidate, Err(e)))) => {
                    warn!(
                        request_id = %request_id,
                        candidate = %candidate,
                        error = %e,
                        "Forecast unavailable, excluding candidate"
                    );
                    result.failures.push((candidate, e));
                }
                Ok(None) => break,
                Err(_) => {
                    let answered: Vec<&CandidateId> = result
                        .forecasts
                        .keys()
                        .chain(result.failures.iter().map(|(id, _)| id))
                        .collect();
                    result.timed_out = candidates
                        .iter()
                        .map(|c| &c.id)
                        .filter(|id| !answered.contains(id))
                        .cloned()
                        .collect();
                    warn!(
                        request_id = %request_id,
                        timed_out = result.timed_out.len(),
                        deadline_ms = self.deadline.as_millis() as u64,
                        "Forecast fan-out deadline reached"
                    );
                    break;
                }
            }
        }

        debug!(
            request_id = %request_id,
            candidates = candidates.len(),
            forecasts = result.forecasts.len(),
            unavailable = result.unavailable(),
            "Forecast fan-out complete"
        );

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockForecaster;
    use mesh_core::LiveFeatures;

    fn candidates(ids: &[&str]) -> Vec<Candidate> {
        ids.iter()
            .map(|id| Candidate::new(*id, LiveFeatures::default()))
            .collect()
    }

    #[tokio::test]
    async fn test_all_answer() {
        let mock = Arc::new(MockForecaster::new());
        mock.set_forecast("a", Forecast::new(100.0, 10.0));
        mock.set_forecast("b", Forecast::new(200.0, 20.0));

        let fanout = ForecastFanout::new(mock.clone(), Duration::from_millis(300));
        let result = fanout
            .forecast_all(&RequestId::new("r"), &RequestFeatures::new(10), &candidates(&["a", "b"]))
            .await;

        assert_eq!(result.forecasts.len(), 2);
        assert_eq!(result.unavailable(), 0);
        assert_eq!(mock.call_count(), 2);
    }

    #[tokio::test]
    async fn test_failure_excludes_only_that_candidate() {
        let mock = Arc::new(MockForecaster::new());
        mock.set_forecast("a", Forecast::new(100.0, 10.0));
        mock.set_failure("b");

        let fanout = ForecastFanout::new(mock, Duration::from_millis(300));
        let result = fanout
            .forecast_all(&RequestId::new("r"), &RequestFeatures::new(10), &candidates(&["a", "b"]))
            .await;

        assert!(result.get(&CandidateId::new("a")).is_some());
        assert!(result.get(&CandidateId::new("b")).is_none());
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].0.as_str(), "b");
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_calls_dropped_at_deadline() {
        let mock = Arc::new(MockForecaster::new());
        mock.set_forecast("fast", Forecast::new(100.0, 10.0));
        mock.set_forecast("slow", Forecast::new(100.0, 10.0));
        mock.set_delay("slow", Duration::from_secs(10));

        let fanout = ForecastFanout::new(mock, Duration::from_millis(300));
        let result = fanout
            .forecast_all(
                &RequestId::new("r"),
                &RequestFeatures::new(10),
                &candidates(&["fast", "slow"]),
            )
            .await;

        assert_eq!(result.forecasts.len(), 1);
        assert_eq!(result.timed_out, vec![CandidateId::new("slow")]);
    }

    #[tokio::test]
    async fn test_require_any_with_no_answers() {
        let mock = Arc::new(MockForecaster::new());
        mock.set_failure("a");
        mock.set_failure("b");

        let fanout = ForecastFanout::new(mock, Duration::from_millis(300));
        let result = fanout
            .forecast_all(&RequestId::new("r"), &RequestFeatures::new(10), &candidates(&["a", "b"]))
            .await;

        match result.require_any() {
            Err(Error::AllForecastsUnavailable(n)) => assert_eq!(n, 2),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_forecast_bounded_by_deadline() {
        let mock = Arc::new(MockForecaster::new());
        mock.set_forecast("slow", Forecast::new(1.0, 1.0));
        mock.set_delay("slow", Duration::from_secs(10));

        let fanout = ForecastFanout::new(mock, Duration::from_millis(300));
        let candidate = Candidate::new("slow", LiveFeatures::default());
        let err = fanout
            .forecast(&RequestId::new("r"), &RequestFeatures::new(1), &candidate)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ForecastUnavailable { .. }));
    }
}
