//! Core library for SafeRoute.  This module wires together the redaction
//! pipeline, the request/response structures shared with clients and the
//! HTTP handlers.  Middleware, admission control and metrics live in
//! their own modules and are assembled here into the final router.

mod config;
pub mod admission;
pub mod clients;
pub mod metrics;
pub mod middleware;
pub mod pipeline;

pub use config::AppConfig;

pub use crate::admission::AdmissionController;
pub use crate::clients::{HttpCompletionProvider, HttpEntityDetector, HttpMappingStore};
pub use crate::metrics::Metrics;
pub use crate::pipeline::{detokenize, tokenize, PipelineError, RedactionPipeline};

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{
    rejection::{BytesRejection, FailedToBufferBody, JsonRejection},
    DefaultBodyLimit, State,
};
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware::{from_fn, from_fn_with_state};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::catch_panic::CatchPanicLayer;
use uuid::Uuid;

/// Wire structures shared with chat clients and the upstream provider.
/// Field names follow the JSON the services exchange; unknown inbound
/// fields are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<Choice>,
    pub usage: Usage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    pub index: u32,
    pub message: Message,
    pub finish_reason: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// One detected PII mapping. The store returns these without position or
/// confidence, so both default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub original: String,
    pub token: String,
    #[serde(rename = "type")]
    pub entity_type: String,
    #[serde(default)]
    pub position: usize,
    #[serde(default)]
    pub confidence: f64,
}

/// Identifies one gateway request end to end: it tags log lines, keys the
/// mapping store and is echoed to the client in `x-request-id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnonymizeRequest {
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnonymizeResponse {
    pub request_id: CorrelationId,
    pub anonymized_text: String,
    pub entities_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreRequest {
    pub request_id: CorrelationId,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreResponse {
    pub restored_text: String,
}

/// Shared application state handed to every handler and middleware.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<RedactionPipeline>,
    pub admission: Arc<AdmissionController>,
    pub metrics: Arc<Metrics>,
    /// Optional request body cap in bytes.
    pub max_request_bytes: Option<usize>,
    /// Cancelled once when the process begins shutting down.
    pub shutdown: CancellationToken,
}

/// Builds the application state from a parsed configuration. Must be
/// called from within a Tokio runtime; the admission sweeper is spawned
/// here.
pub fn build_state(config: &AppConfig) -> AppState {
    let detector = HttpEntityDetector::new(
        config.detector_url.clone(),
        Duration::from_millis(config.detector_timeout_ms),
    );
    let store = HttpMappingStore::new(
        config.store_url.clone(),
        Duration::from_millis(config.store_timeout_ms),
    );
    let provider = HttpCompletionProvider::new(
        config.provider_url.clone(),
        config.provider_api_key.clone(),
        Duration::from_millis(config.provider_timeout_ms),
    );
    let pipeline = RedactionPipeline::new(Arc::new(detector), Arc::new(store), Arc::new(provider));
    let admission = AdmissionController::start(
        config.rate_limit_max,
        Duration::from_millis(config.rate_limit_window_ms),
        Duration::from_secs(config.rate_limit_sweep_secs),
    );
    AppState {
        pipeline: Arc::new(pipeline),
        admission: Arc::new(admission),
        metrics: Arc::new(Metrics::new()),
        max_request_bytes: config.max_request_bytes,
        shutdown: CancellationToken::new(),
    }
}

/// Reads the configuration from the environment and builds the state.
pub async fn build_state_from_env() -> anyhow::Result<AppState> {
    let config = AppConfig::from_env()?;
    tracing::info!(
        port = config.port,
        detector_url = %config.detector_url,
        store_url = %config.store_url,
        provider_url = %config.provider_url,
        "configuration loaded"
    );
    Ok(build_state(&config))
}

/// Assembles the router with the full middleware chain.
pub fn app(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/v1/chat/completions", post(chat_completion_handler))
        .route("/v1/anonymize", post(anonymize_handler))
        .route("/v1/restore", post(restore_handler))
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/metrics", get(metrics_handler));

    if let Some(limit) = state.max_request_bytes {
        router = router.layer(DefaultBodyLimit::max(limit));
    }

    // The last layer added runs first: correlation id, then logging, then
    // CORS, then admission, then panic isolation, then metrics.
    router
        .layer(from_fn_with_state(state.clone(), middleware::track_metrics))
        .layer(CatchPanicLayer::custom(middleware::handle_panic))
        .layer(from_fn_with_state(state.clone(), middleware::admission_gate))
        .layer(middleware::cors())
        .layer(from_fn(middleware::trace_requests))
        .layer(from_fn(middleware::assign_correlation_id))
        .with_state(state)
}

async fn chat_completion_handler(
    State(state): State<AppState>,
    Extension(request_id): Extension<CorrelationId>,
    payload: Result<Json<ChatCompletionRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match payload {
        Ok(json) => json,
        Err(rejection) => return handle_json_rejection(&state, rejection),
    };
    let start = Instant::now();
    match state
        .pipeline
        .process(&request, &request_id, &state.shutdown)
        .await
    {
        Ok((completion, timings)) => {
            let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
            tracing::info!(
                request_id = %request_id,
                detect_ms = timings.detect_ms,
                store_ms = timings.store_ms,
                provider_ms = timings.provider_ms,
                retrieve_ms = timings.retrieve_ms,
                total_ms = latency_ms,
                "completion processed"
            );
            with_latency_header(
                (StatusCode::OK, Json(completion)).into_response(),
                latency_ms,
            )
        }
        Err(err) => {
            tracing::warn!(request_id = %request_id, error = %err, "completion failed");
            err.into_response()
        }
    }
}

async fn anonymize_handler(
    State(state): State<AppState>,
    Extension(request_id): Extension<CorrelationId>,
    payload: Result<Json<AnonymizeRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match payload {
        Ok(json) => json,
        Err(rejection) => return handle_json_rejection(&state, rejection),
    };
    let start = Instant::now();
    match state
        .pipeline
        .anonymize(&request.text, &request_id, &state.shutdown)
        .await
    {
        Ok((anonymized_text, entities_count)) => {
            let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
            tracing::info!(request_id = %request_id, entities_count, "text anonymized");
            with_latency_header(
                (
                    StatusCode::OK,
                    Json(AnonymizeResponse {
                        request_id,
                        anonymized_text,
                        entities_count,
                    }),
                )
                    .into_response(),
                latency_ms,
            )
        }
        Err(err) => {
            tracing::warn!(request_id = %request_id, error = %err, "anonymize failed");
            err.into_response()
        }
    }
}

async fn restore_handler(
    State(state): State<AppState>,
    payload: Result<Json<RestoreRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match payload {
        Ok(json) => json,
        Err(rejection) => return handle_json_rejection(&state, rejection),
    };
    let start = Instant::now();
    match state
        .pipeline
        .restore(&request.request_id, &request.text, &state.shutdown)
        .await
    {
        Ok(restored_text) => {
            let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
            tracing::info!(request_id = %request.request_id, "text restored");
            with_latency_header(
                (StatusCode::OK, Json(RestoreResponse { restored_text })).into_response(),
                latency_ms,
            )
        }
        Err(err) => {
            tracing::warn!(request_id = %request.request_id, error = %err, "restore failed");
            err.into_response()
        }
    }
}

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "saferoute",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn ready_handler() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ready" }))
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    let mut body = state.metrics.render();
    {
        use std::fmt::Write as _;
        writeln!(
            &mut body,
            "# HELP saferoute_admission_tracked_clients Clients currently tracked by admission control."
        )
        .ok();
        writeln!(&mut body, "# TYPE saferoute_admission_tracked_clients gauge").ok();
        writeln!(
            &mut body,
            "saferoute_admission_tracked_clients {}",
            state.admission.tracked_clients()
        )
        .ok();
    }
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body)
}

fn with_latency_header(mut response: Response, latency_ms: f64) -> Response {
    if let Ok(value) = HeaderValue::from_str(&format!("{:.2}", latency_ms)) {
        response.headers_mut().insert("x-latency-ms", value);
    }
    response
}

fn handle_json_rejection(state: &AppState, rejection: JsonRejection) -> Response {
    match rejection {
        JsonRejection::BytesRejection(BytesRejection::FailedToBufferBody(
            FailedToBufferBody::LengthLimitError(_),
        )) => {
            tracing::warn!(limit = ?state.max_request_bytes, "refused oversized request body");
            (
                StatusCode::PAYLOAD_TOO_LARGE,
                Json(ErrorBody {
                    error: "Request too large".to_string(),
                }),
            )
                .into_response()
        }
        other => {
            tracing::debug!(reason = %other.body_text(), "rejected malformed request body");
            (
                StatusCode::BAD_REQUEST,
                Json(ErrorBody {
                    error: "Invalid request body".to_string(),
                }),
            )
                .into_response()
        }
    }
}
