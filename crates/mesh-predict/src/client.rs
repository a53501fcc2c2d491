//! HTTP client for the replicated forecaster service

use crate::endpoint::{EndpointSelector, SelectorFactory, SelectorStats};
use async_trait::async_trait;
use mesh_core::{
    Candidate, CandidateId, Error, Forecast, ForecastConfig, Forecaster, LiveFeatures,
    RequestFeatures, RequestId, Result,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// Body of `POST /predict`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictRequest {
    pub request_id: RequestId,
    pub request: RequestFeatures,
    pub candidate: CandidateFeatures,
}

/// Candidate-side forecaster inputs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateFeatures {
    pub id: CandidateId,
    pub running_request_count: u32,
    pub features: LiveFeatures,
}

impl From<&Candidate> for CandidateFeatures {
    fn from(candidate: &Candidate) -> Self {
        Self {
            id: candidate.id.clone(),
            running_request_count: candidate.running_request_count,
            features: candidate.features.clone(),
        }
    }
}

/// Body of the `POST /predict` response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictResponse {
    pub ttft_p90_ms: f64,
    pub tpot_p90_ms: f64,
    #[serde(default)]
    pub uncertainty: Option<f64>,
}

impl From<PredictResponse> for Forecast {
    fn from(response: PredictResponse) -> Self {
        Forecast {
            ttft_p90_ms: response.ttft_p90_ms,
            tpot_p90_ms: response.tpot_p90_ms,
            uncertainty: response.uncertainty.unwrap_or(0.0),
        }
    }
}

/// Forecaster reached over HTTP, one endpoint per call
pub struct HttpForecaster {
    endpoints: Vec<String>,
    selector: Box<dyn EndpointSelector>,
    client: reqwest::Client,
}

impl HttpForecaster {
    /// Create a forecaster client from configuration
    pub fn new(config: &ForecastConfig) -> Result<Self> {
        config.validate()?;
        Self::with_selector(
            config.endpoints.clone(),
            SelectorFactory::create(config.selection),
            config.call_timeout(),
        )
    }

    /// Create a forecaster client with an explicit endpoint list and selector
    pub fn with_selector(
        endpoints: Vec<String>,
        selector: Box<dyn EndpointSelector>,
        call_timeout: Duration,
    ) -> Result<Self> {
        if endpoints.is_empty() {
            return Err(Error::config("At least one forecaster endpoint is required"));
        }
        let client = reqwest::Client::builder()
            .timeout(call_timeout)
            .build()
            .map_err(|e| Error::config(format!("Failed to build forecaster client: {}", e)))?;

        Ok(Self {
            endpoints: endpoints
                .into_iter()
                .map(|e| e.trim_end_matches('/').to_string())
                .collect(),
            selector,
            client,
        })
    }

    /// Configured endpoints
    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    /// Endpoint selection statistics
    pub fn selector_stats(&self) -> SelectorStats {
        self.selector.stats()
    }
}

#[async_trait]
impl Forecaster for HttpForecaster {
    async fn forecast(
        &self,
        request_id: &RequestId,
        request: &RequestFeatures,
        candidate: &Candidate,
    ) -> Result<Forecast> {
        let index = self.selector.select(&self.endpoints, request_id).ok_or_else(|| {
            Error::forecast_unavailable(candidate.id.clone(), "no forecaster endpoints")
        })?;
        let url = format!("{}/predict", self.endpoints[index]);

        let body = PredictRequest {
            request_id: request_id.clone(),
            request: request.clone(),
            candidate: CandidateFeatures::from(candidate),
        };

        let response = self.client.post(&url).json(&body).send().await.map_err(|e| {
            let reason = if e.is_timeout() {
                format!("{} timed out", url)
            } else {
                format!("{}: {}", url, e)
            };
            Error::forecast_unavailable(candidate.id.clone(), reason)
        })?;

        if !response.status().is_success() {
            return Err(Error::forecast_unavailable(
                candidate.id.clone(),
                format!("{} returned {}", url, response.status()),
            ));
        }

        let forecast: Forecast = response
            .json::<PredictResponse>()
            .await
            .map_err(|e| {
                Error::forecast_unavailable(candidate.id.clone(), format!("bad response: {}", e))
            })?
            .into();

        if !forecast.is_valid() {
            return Err(Error::forecast_unavailable(
                candidate.id.clone(),
                format!("invalid forecast {:?}", forecast),
            ));
        }

        debug!(
            request_id = %request_id,
            candidate = %candidate.id,
            ttft_p90_ms = forecast.ttft_p90_ms,
            tpot_p90_ms = forecast.tpot_p90_ms,
            "Forecast received"
        );

        Ok(forecast)
    }

    async fn ready(&self) -> bool {
        for endpoint in &self.endpoints {
            let url = format!("{}/readyz", endpoint);
            match self.client.get(&url).send().await {
                Ok(response) if response.status().is_success() => return true,
                Ok(response) => {
                    debug!(endpoint = %endpoint, status = %response.status(), "Forecaster not ready");
                }
                Err(e) => {
                    warn!(endpoint = %endpoint, error = %e, "Forecaster readiness probe failed");
                }
            }
        }
        false
    }
}
