#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::extract::Path;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use saferoute::AppConfig;
use serde_json::{json, Value};
use tokio::net::TcpListener;

/// Tracks environment variable mutations and restores originals on drop.
pub struct EnvGuard {
    originals: HashMap<String, Option<String>>,
}

impl EnvGuard {
    pub fn new() -> Self {
        Self {
            originals: HashMap::new(),
        }
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.capture(key);
        std::env::set_var(key, value);
    }

    pub fn set_many(&mut self, entries: &[(&str, &str)]) {
        for (key, value) in entries {
            self.set(key, value);
        }
    }

    pub fn remove(&mut self, key: &str) {
        self.capture(key);
        std::env::remove_var(key);
    }

    fn capture(&mut self, key: &str) {
        if self.originals.contains_key(key) {
            return;
        }
        let original = std::env::var(key).ok();
        self.originals.insert(key.to_string(), original);
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, original) in self.originals.drain() {
            match original {
                Some(value) => std::env::set_var(&key, value),
                None => std::env::remove_var(&key),
            }
        }
    }
}

/// Serves a mock router on an ephemeral port, returning its base URL.
pub async fn serve_on_ephemeral(router: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}", addr)
}

/// Serves the gateway router with connect info attached, the way the
/// binary runs it.
pub async fn serve_gateway_router(router: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    format!("http://{}", addr)
}

/// Catalog rows for the detector mock: (original, token, type).
pub fn email_catalog() -> Vec<(String, String, String)> {
    vec![(
        "john@example.com".to_string(),
        "[EMAIL_001]".to_string(),
        "EMAIL".to_string(),
    )]
}

/// Detector mock. Reports every catalog literal found in the scanned
/// text.
pub async fn spawn_detector(catalog: Vec<(String, String, String)>) -> String {
    let router = Router::new().route(
        "/detect",
        post(move |Json(body): Json<Value>| {
            let catalog = catalog.clone();
            async move {
                let text = body["text"].as_str().unwrap_or_default().to_string();
                let entities: Vec<Value> = catalog
                    .iter()
                    .filter_map(|(original, token, entity_type)| {
                        text.find(original.as_str()).map(|position| {
                            json!({
                                "original": original,
                                "token": token,
                                "type": entity_type,
                                "position": position,
                                "confidence": 0.99,
                            })
                        })
                    })
                    .collect();
                Json(json!({
                    "entities": entities,
                    "count": entities.len(),
                    "domain": "general",
                }))
            }
        }),
    );
    serve_on_ephemeral(router).await
}

/// In-memory vault mock. Batches are kept under their request id.
pub async fn spawn_vault() -> String {
    let stored: Arc<Mutex<HashMap<String, Value>>> = Arc::new(Mutex::new(HashMap::new()));
    let store_side = stored.clone();
    let retrieve_side = stored;
    let router = Router::new()
        .route(
            "/store",
            post(move |Json(body): Json<Value>| {
                let stored = store_side.clone();
                async move {
                    let request_id = body["request_id"].as_str().unwrap_or_default().to_string();
                    stored
                        .lock()
                        .unwrap()
                        .insert(request_id.clone(), body["entities"].clone());
                    Json(json!({
                        "success": true,
                        "request_id": request_id,
                        "expires_at": chrono::Utc::now().timestamp() + 600,
                    }))
                }
            }),
        )
        .route(
            "/retrieve/:request_id",
            get(move |Path(request_id): Path<String>| {
                let stored = retrieve_side.clone();
                async move {
                    let entities = stored.lock().unwrap().get(&request_id).cloned();
                    match entities {
                        Some(entities) => {
                            (StatusCode::OK, Json(json!({ "entities": entities })))
                        }
                        None => (
                            StatusCode::NOT_FOUND,
                            Json(json!({ "error": "unknown request id" })),
                        ),
                    }
                }
            }),
        );
    serve_on_ephemeral(router).await
}

/// Vault mock whose retrieve side is down. Stores succeed, reads fail.
pub async fn spawn_write_only_vault() -> String {
    let router = Router::new()
        .route(
            "/store",
            post(|Json(body): Json<Value>| async move {
                let request_id = body["request_id"].as_str().unwrap_or_default().to_string();
                Json(json!({
                    "success": true,
                    "request_id": request_id,
                    "expires_at": chrono::Utc::now().timestamp() + 600,
                }))
            }),
        )
        .route(
            "/retrieve/:request_id",
            get(|| async {
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": "storage error" })),
                )
            }),
        );
    serve_on_ephemeral(router).await
}

/// A service that answers 500 to everything.
pub async fn spawn_failing_service() -> String {
    let router = Router::new().fallback(|| async {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "mock failure" })),
        )
    });
    serve_on_ephemeral(router).await
}

/// Observes what the provider mock received.
#[derive(Clone, Default)]
pub struct ProviderProbe {
    hits: Arc<Mutex<usize>>,
    last_prompt: Arc<Mutex<String>>,
    last_api_key: Arc<Mutex<String>>,
    last_version: Arc<Mutex<String>>,
}

impl ProviderProbe {
    pub fn hits(&self) -> usize {
        *self.hits.lock().unwrap()
    }

    pub fn last_prompt(&self) -> String {
        self.last_prompt.lock().unwrap().clone()
    }

    pub fn last_api_key(&self) -> String {
        self.last_api_key.lock().unwrap().clone()
    }

    pub fn last_version(&self) -> String {
        self.last_version.lock().unwrap().clone()
    }
}

/// Provider mock. Echoes the prompt back as the completion so tests can
/// see exactly what crossed the trust boundary.
pub async fn spawn_provider(probe: ProviderProbe) -> String {
    let router = Router::new().route(
        "/v1/messages",
        post(move |headers: HeaderMap, Json(body): Json<Value>| {
            let probe = probe.clone();
            async move {
                *probe.hits.lock().unwrap() += 1;
                if let Some(key) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
                    *probe.last_api_key.lock().unwrap() = key.to_string();
                }
                if let Some(version) = headers
                    .get("anthropic-version")
                    .and_then(|v| v.to_str().ok())
                {
                    *probe.last_version.lock().unwrap() = version.to_string();
                }
                let prompt = body["messages"]
                    .as_array()
                    .map(|messages| {
                        messages
                            .iter()
                            .filter_map(|m| m["content"].as_str())
                            .collect::<Vec<_>>()
                            .join("\n")
                    })
                    .unwrap_or_default();
                *probe.last_prompt.lock().unwrap() = prompt.clone();
                Json(json!({
                    "id": "cmpl-mock",
                    "object": "chat.completion",
                    "created": 1_700_000_000,
                    "model": body["model"].clone(),
                    "choices": [{
                        "index": 0,
                        "message": {
                            "role": "assistant",
                            "content": format!("You wrote: {}", prompt),
                        },
                        "finish_reason": "stop",
                    }],
                    "usage": { "prompt_tokens": 1, "completion_tokens": 1, "total_tokens": 2 },
                }))
            }
        }),
    );
    serve_on_ephemeral(router).await
}

/// Gateway configuration pointing at the given mock services.
pub fn gateway_config(detector_url: &str, store_url: &str, provider_url: &str) -> AppConfig {
    AppConfig {
        detector_url: detector_url.to_string(),
        store_url: store_url.to_string(),
        provider_url: provider_url.to_string(),
        provider_api_key: "test-key".to_string(),
        ..AppConfig::default()
    }
}

/// Builds and serves a gateway against the given configuration.
pub async fn spawn_gateway(config: AppConfig) -> String {
    let state = saferoute::build_state(&config);
    serve_gateway_router(saferoute::app(state)).await
}
