//! Tower middleware for the gateway: correlation ids, request logging,
//! CORS, admission control, panic isolation and metrics capture.

use std::any::Any;
use std::net::SocketAddr;
use std::time::Instant;

use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use http_body_util::Full;
use tower_http::cors::CorsLayer;

use crate::{AppState, CorrelationId, ErrorBody};

/// Mints a correlation id for the request and echoes it back in the
/// `x-request-id` response header. Runs outermost so every later layer
/// and handler sees the id as an extension.
pub async fn assign_correlation_id(mut request: axum::extract::Request, next: Next) -> Response {
    let id = CorrelationId::new();
    request.extensions_mut().insert(id);
    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&id.to_string()) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

/// Logs one line per completed request, tagged with the correlation id.
pub async fn trace_requests(request: axum::extract::Request, next: Next) -> Response {
    let id = correlation_id(&request);
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let start = Instant::now();
    let response = next.run(request).await;
    tracing::info!(
        request_id = %id,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        elapsed_ms = start.elapsed().as_secs_f64() * 1000.0,
        "request completed"
    );
    response
}

fn correlation_id(request: &axum::extract::Request) -> CorrelationId {
    request
        .extensions()
        .get::<CorrelationId>()
        .copied()
        .unwrap_or_default()
}

/// Permissive CORS: any origin, the usual methods. Preflight requests are
/// answered here and never reach the inner layers.
pub fn cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
}

/// Denies requests from clients that have exhausted their window budget.
/// Clients are keyed by peer IP, port stripped.
pub async fn admission_gate(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: axum::extract::Request,
    next: Next,
) -> Response {
    let key = addr.ip().to_string();
    if !state.admission.admit(&key) {
        tracing::warn!(client = %key, "rate limit exceeded");
        let body = ErrorBody {
            error: "Too Many Requests".to_string(),
        };
        return (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    }
    next.run(request).await
}

/// Records the route counter and latency histogram for each response.
pub async fn track_metrics(
    State(state): State<AppState>,
    request: axum::extract::Request,
    next: Next,
) -> Response {
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let start = Instant::now();
    let response = next.run(request).await;
    state
        .metrics
        .observe(&method, &path, start.elapsed().as_millis() as u64);
    response
}

/// Converts a handler panic into a generic 500 so one bad request cannot
/// take the worker down with it. The panic payload goes to the log, not
/// the client.
pub fn handle_panic(err: Box<dyn Any + Send + 'static>) -> axum::http::Response<Full<Bytes>> {
    let detail = if let Some(s) = err.downcast_ref::<String>() {
        s.as_str()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        s
    } else {
        "unknown panic payload"
    };
    tracing::error!(panic = %detail, "handler panicked");
    let body = serde_json::json!({ "error": "Internal server error" }).to_string();
    axum::http::Response::builder()
        .status(StatusCode::INTERNAL_SERVER_ERROR)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Full::from(body))
        .expect("static panic response")
}
