//! HTTP surface of the scheduler

use crate::scheduler::{Scheduler, SchedulingOutcome};
use crate::{Result, SchedulerError};
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router as AxumRouter,
};
use mesh_core::{Candidate, RequestContext, RequestFeatures, RequestId, SloFields};
use mesh_predict::{TrainerWatcher, UploaderStats};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<Scheduler>,
    pub uploader_stats: Option<Arc<UploaderStats>>,
    pub watcher: Option<Arc<TrainerWatcher>>,
}

impl AppState {
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        Self {
            scheduler,
            uploader_stats: None,
            watcher: None,
        }
    }

    pub fn with_uploader_stats(mut self, stats: Arc<UploaderStats>) -> Self {
        self.uploader_stats = Some(stats);
        self
    }

    pub fn with_watcher(mut self, watcher: Arc<TrainerWatcher>) -> Self {
        self.watcher = Some(watcher);
        self
    }
}

/// Body of `POST /v1/schedule`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleRequest {
    /// Generated when absent
    #[serde(default)]
    pub request_id: Option<RequestId>,

    /// Structured SLO fields, taking precedence over headers
    #[serde(default)]
    pub slo: SloFields,

    #[serde(default)]
    pub features: RequestFeatures,

    pub candidates: Vec<Candidate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirstTokenRequest {
    pub ttft_ms: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenRequest {
    pub token_index: u32,
    pub tpot_ms: f64,
}

/// Build the router with every scheduler route
pub fn create_app(state: AppState) -> AxumRouter {
    let metrics_enabled = state.scheduler.config().observability.metrics_enabled;
    let mut router = AxumRouter::new()
        .route("/health", get(health_handler))
        .route("/v1/schedule", post(schedule_handler))
        .route("/v1/requests/:id/first-token", post(first_token_handler))
        .route("/v1/requests/:id/tokens", post(token_handler))
        .route("/v1/requests/:id/complete", post(complete_handler))
        .route("/v1/requests/:id/abort", post(abort_handler));

    if metrics_enabled {
        router = router.route("/metrics", get(metrics_handler));
    }

    router.layer(TraceLayer::new_for_http()).with_state(state)
}

/// Bind and serve until the shutdown signal resolves
pub async fn serve(
    state: AppState,
    bind_addr: SocketAddr,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let app = create_app(state);
    let listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| SchedulerError::Server(format!("Failed to bind to {}: {}", bind_addr, e)))?;

    info!("Starting scheduler HTTP server on {}", bind_addr);

    if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(shutdown).await {
        error!("HTTP server error: {}", e);
        return Err(SchedulerError::Server(format!("HTTP server failed: {}", e)));
    }
    Ok(())
}

impl IntoResponse for SchedulerError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.to_status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let category = match &self {
            SchedulerError::Core(e) => e.category(),
            SchedulerError::NoCandidates => "no_candidates",
            SchedulerError::Metrics(_) => "metrics",
            SchedulerError::Server(_) => "server",
        };
        (
            status,
            Json(json!({
                "error": self.to_string(),
                "category": category,
            })),
        )
            .into_response()
    }
}

fn request_context(headers: &HeaderMap, body: ScheduleRequest) -> RequestContext {
    let request_id = body.request_id.unwrap_or_else(RequestId::generate);
    let mut context = RequestContext::new(request_id)
        .with_slo_fields(body.slo)
        .with_features(body.features);
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            context = context.with_header(name.as_str(), value);
        }
    }
    context
}

async fn schedule_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ScheduleRequest>,
) -> std::result::Result<Response, SchedulerError> {
    let candidates = body.candidates.clone();
    let context = request_context(&headers, body);
    debug!(request_id = %context.request_id, candidates = candidates.len(), "Schedule request");

    let outcome = state.scheduler.schedule(context, candidates).await?;
    let status = match &outcome {
        SchedulingOutcome::Routed(_) => StatusCode::OK,
        SchedulingOutcome::Shed { .. } => StatusCode::TOO_MANY_REQUESTS,
    };
    Ok((status, Json(outcome)).into_response())
}

async fn first_token_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<FirstTokenRequest>,
) -> std::result::Result<StatusCode, SchedulerError> {
    state
        .scheduler
        .on_first_token(&RequestId::new(id), body.ttft_ms)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn token_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<TokenRequest>,
) -> impl IntoResponse {
    let sampled = state
        .scheduler
        .on_token(&RequestId::new(id), body.token_index, body.tpot_ms);
    Json(json!({ "sampled": sampled }))
}

async fn complete_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> std::result::Result<impl IntoResponse, StatusCode> {
    state
        .scheduler
        .complete(&RequestId::new(id))
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn abort_handler(State(state): State<AppState>, Path(id): Path<String>) -> StatusCode {
    if state.scheduler.abort(&RequestId::new(id)) {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let forecaster_ready = state.scheduler.forecaster_ready().await;
    let trainer_ready = state.watcher.as_ref().map(|w| w.is_ready());
    let model = state.watcher.as_ref().and_then(|w| w.current());
    let status = if forecaster_ready { "healthy" } else { "degraded" };

    Json(json!({
        "status": status,
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "forecaster_ready": forecaster_ready,
        "trainer_ready": trainer_ready,
        "model": model,
        "in_flight": state.scheduler.tracker().len(),
        "buffered_samples": state.scheduler.collector().buffer().len(),
    }))
}

async fn metrics_handler(State(state): State<AppState>) -> std::result::Result<Response, SchedulerError> {
    let metrics = state.scheduler.metrics();
    let uploader = state.uploader_stats.clone().unwrap_or_default();
    metrics.refresh_samples(state.scheduler.collector().buffer().stats(), &uploader);
    let body = metrics.export()?;

    Ok((
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use mesh_core::slo::PREDICTION_HEADER;
    use mesh_core::{Forecast, LatencyReport, LiveFeatures, SchedulerConfig};
    use mesh_predict::{MockForecaster, UploadBuffer};
    use serde_json::Value;
    use tower::ServiceExt;

    fn app_with(mock: MockForecaster) -> (AxumRouter, Arc<Scheduler>) {
        let config = SchedulerConfig::default();
        let buffer = Arc::new(UploadBuffer::new(100));
        let scheduler = Arc::new(Scheduler::new(config, Arc::new(mock), buffer).unwrap());
        (create_app(AppState::new(scheduler.clone())), scheduler)
    }

    fn schedule_body(id: &str, ttft: f64, tpot: f64, priority: i32) -> Value {
        let candidates: Vec<Candidate> = ["a", "b"]
            .iter()
            .map(|c| Candidate::new(*c, LiveFeatures::default()))
            .collect();
        json!({
            "request_id": id,
            "slo": {
                "ttft_target_ms": ttft,
                "tpot_target_ms": tpot,
                "priority": priority,
            },
            "features": { "input_tokens": 32 },
            "candidates": candidates,
        })
    }

    fn post_json(uri: &str, body: &Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .header(PREDICTION_HEADER, "true")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(response: Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_schedule_and_stream() {
        let (app, scheduler) = app_with(MockForecaster::with_forecasts([
            ("a", Forecast::new(180.0, 40.0)),
            ("b", Forecast::new(300.0, 60.0)),
        ]));

        let response = app
            .clone()
            .oneshot(post_json("/v1/schedule", &schedule_body("r1", 250.0, 50.0, 0)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["outcome"], "routed");
        assert_eq!(body["candidate"], "a");
        assert_eq!(body["profile"], "slo");

        let response = app
            .clone()
            .oneshot(post_json("/v1/requests/r1/first-token", &json!({ "ttft_ms": 170.0 })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app
            .clone()
            .oneshot(post_json(
                "/v1/requests/r1/tokens",
                &json!({ "token_index": 200, "tpot_ms": 38.0 }),
            ))
            .await
            .unwrap();
        assert_eq!(json_body(response).await["sampled"], true);

        let response = app
            .clone()
            .oneshot(post_json("/v1/requests/r1/complete", &json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let report: LatencyReport = serde_json::from_value(json_body(response).await).unwrap();
        assert_eq!(report.predicted_ttft_ms, Some(180.0));
        assert_eq!(report.observed_ttft_ms, Some(170.0));
        assert_eq!(report.sampled_token_indices, vec![200]);
        assert!(scheduler.tracker().is_empty());
    }

    #[tokio::test]
    async fn test_shed_is_429() {
        let (app, _) = app_with(MockForecaster::with_forecasts([
            ("a", Forecast::new(400.0, 40.0)),
            ("b", Forecast::new(300.0, 60.0)),
        ]));

        let response = app
            .oneshot(post_json("/v1/schedule", &schedule_body("r1", 250.0, 50.0, -1)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let body = json_body(response).await;
        assert_eq!(body["outcome"], "shed");
        assert_eq!(body["request_id"], "r1");
    }

    #[tokio::test]
    async fn test_invalid_slo_is_400() {
        let (app, _) = app_with(MockForecaster::new());
        let response = app
            .oneshot(post_json("/v1/schedule", &schedule_body("r1", -10.0, 50.0, 0)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["category"], "invalid_slo");
    }

    #[tokio::test]
    async fn test_unknown_request_routes() {
        let (app, _) = app_with(MockForecaster::new());

        let response = app
            .clone()
            .oneshot(post_json("/v1/requests/ghost/complete", &json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .clone()
            .oneshot(post_json("/v1/requests/ghost/abort", &json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(post_json("/v1/requests/ghost/first-token", &json!({ "ttft_ms": 1.0 })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_health_and_metrics() {
        let (app, _) = app_with(MockForecaster::new());

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["in_flight"], 0);
        assert!(body["model"].is_null());

        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("slo_mesh_samples"));
    }
}
