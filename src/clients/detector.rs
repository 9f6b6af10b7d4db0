use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{ClientError, EntityDetector};
use crate::Entity;

/// Domain hint sent with every detection request.
const DETECTION_DOMAIN: &str = "general";

#[derive(Serialize)]
struct DetectRequest<'a> {
    text: &'a str,
    domain: &'static str,
}

#[derive(Deserialize)]
struct DetectResponse {
    entities: Vec<Entity>,
    #[serde(default)]
    count: usize,
}

/// NER service client. Speaks `POST {base}/detect`.
pub struct HttpEntityDetector {
    base_url: String,
    client: reqwest::Client,
}

impl HttpEntityDetector {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("failed to build reqwest client");
        Self {
            base_url: base_url.into(),
            client,
        }
    }
}

#[async_trait::async_trait]
impl EntityDetector for HttpEntityDetector {
    async fn detect_entities(&self, text: &str) -> Result<Vec<Entity>, ClientError> {
        let url = format!("{}/detect", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&DetectRequest {
                text,
                domain: DETECTION_DOMAIN,
            })
            .send()
            .await?;
        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(ClientError::Status(status));
        }
        let body: DetectResponse = response.json().await.map_err(ClientError::Decode)?;
        tracing::debug!(count = body.count, "entity detection completed");
        Ok(body.entities)
    }
}
