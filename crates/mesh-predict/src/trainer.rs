//! HTTP client for the training service

use async_trait::async_trait;
use mesh_core::{
    Error, IngestAck, LatencySample, ModelInfo, Result, TrainerClient, TrainerConfig,
};
use serde::Serialize;
use tracing::debug;

/// Trainer reached over HTTP
pub struct HttpTrainerClient {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct SampleBatchRef<'a> {
    samples: &'a [LatencySample],
}

impl HttpTrainerClient {
    pub fn new(config: &TrainerConfig) -> Result<Self> {
        config.validate()?;
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| Error::config(format!("Failed to build trainer client: {}", e)))?;

        Ok(Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn map_send_error(url: &str, e: reqwest::Error) -> Error {
        if e.is_timeout() {
            Error::timeout(format!("{} timed out", url))
        } else {
            Error::transport(format!("{}: {}", url, e))
        }
    }
}

#[async_trait]
impl TrainerClient for HttpTrainerClient {
    async fn ingest(&self, samples: &[LatencySample]) -> Result<IngestAck> {
        let url = format!("{}/samples", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&SampleBatchRef { samples })
            .send()
            .await
            .map_err(|e| Self::map_send_error(&url, e))?;

        if !response.status().is_success() {
            return Err(Error::upload(format!("{} returned {}", url, response.status())));
        }

        let ack: IngestAck = response
            .json()
            .await
            .map_err(|e| Error::upload(format!("bad acknowledgement from {}: {}", url, e)))?;

        debug!(sent = samples.len(), accepted = ack.accepted, "Trainer acknowledged samples");
        Ok(ack)
    }

    async fn model_info(&self, model_name: &str) -> Result<ModelInfo> {
        let url = format!("{}/models/{}", self.base_url, model_name);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Self::map_send_error(&url, e))?;

        match response.status() {
            s if s.is_success() => response
                .json()
                .await
                .map_err(|e| Error::transport(format!("bad model info from {}: {}", url, e))),
            reqwest::StatusCode::NOT_FOUND => {
                Err(Error::not_found(format!("model '{}'", model_name)))
            }
            s => Err(Error::transport(format!("{} returned {}", url, s))),
        }
    }

    async fn ready(&self) -> Result<bool> {
        let url = format!("{}/readyz", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Self::map_send_error(&url, e))?;
        Ok(response.status().is_success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        extract::Path,
        http::StatusCode,
        routing::{get, post},
        Json, Router,
    };
    use chrono::Utc;
    use mesh_core::{CandidateId, LiveFeatures, RequestId, SampleBatch};
    use tokio::net::TcpListener;

    async fn serve(app: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn client(url: String) -> HttpTrainerClient {
        HttpTrainerClient::new(&TrainerConfig {
            url,
            ..TrainerConfig::default()
        })
        .unwrap()
    }

    fn trainer_app() -> Router {
        Router::new()
            .route(
                "/samples",
                post(|Json(batch): Json<SampleBatch>| async move {
                    Json(IngestAck {
                        accepted: batch.samples.len(),
                    })
                }),
            )
            .route(
                "/models/:name",
                get(|Path(name): Path<String>| async move {
                    if name == "latency" {
                        Ok(Json(ModelInfo {
                            version: "v3".to_string(),
                            trained_at: Utc::now(),
                            sample_count: 4200,
                        }))
                    } else {
                        Err(StatusCode::NOT_FOUND)
                    }
                }),
            )
            .route("/readyz", get(|| async { StatusCode::OK }))
    }

    #[tokio::test]
    async fn test_ingest_and_metadata() {
        let base = serve(trainer_app()).await;
        let trainer = client(base);

        let samples: Vec<LatencySample> = (0..3)
            .map(|i| LatencySample {
                request_id: RequestId::new(format!("r{i}")),
                candidate_id: CandidateId::new("pod-a"),
                observed_ttft_ms: Some(100.0),
                observed_tpot_ms: vec![20.0, 21.0],
                features: LiveFeatures::default(),
                forecast: None,
                timestamp: Utc::now(),
            })
            .collect();

        let ack = trainer.ingest(&samples).await.unwrap();
        assert_eq!(ack.accepted, 3);

        let info = trainer.model_info("latency").await.unwrap();
        assert_eq!(info.version, "v3");
        assert_eq!(info.sample_count, 4200);

        let err = trainer.model_info("missing").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));

        assert!(trainer.ready().await.unwrap());
    }

    #[tokio::test]
    async fn test_rejected_batch_is_upload_failure() {
        let app = Router::new().route("/samples", post(|| async { StatusCode::SERVICE_UNAVAILABLE }));
        let trainer = client(serve(app).await);

        let err = trainer.ingest(&[]).await.unwrap_err();
        assert!(matches!(err, Error::UploadFailure(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_unreachable_trainer() {
        // bind then drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let trainer = client(format!("http://{}", addr));
        assert!(trainer.ready().await.is_err());
    }
}
