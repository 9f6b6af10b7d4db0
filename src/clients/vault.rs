use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{ClientError, MappingStore};
use crate::{CorrelationId, Entity};

#[derive(Serialize)]
struct StoreRequest<'a> {
    request_id: &'a CorrelationId,
    entities: &'a [Entity],
}

#[derive(Deserialize)]
struct StoreResponse {
    success: bool,
    request_id: String,
    /// Expiry of the stored mappings as Unix seconds.
    expires_at: i64,
}

#[derive(Deserialize)]
struct RetrieveResponse {
    entities: Vec<Entity>,
}

/// Vault service client. Mappings are written with `POST {base}/store` and
/// read back with `GET {base}/retrieve/{id}`.
pub struct HttpMappingStore {
    base_url: String,
    client: reqwest::Client,
}

impl HttpMappingStore {
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
impl MappingStore for HttpMappingStore {
    async fn store_entities(
        &self,
        id: &CorrelationId,
        entities: &[Entity],
    ) -> Result<(), ClientError> {
        let url = format!("{}/store", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&StoreRequest {
                request_id: id,
                entities,
            })
            .send()
            .await?;
        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(ClientError::Status(status));
        }
        let body: StoreResponse = response.json().await.map_err(ClientError::Decode)?;
        let expires_at = chrono::DateTime::<chrono::Utc>::from_timestamp(body.expires_at, 0)
            .map(|ts| ts.to_rfc3339())
            .unwrap_or_else(|| body.expires_at.to_string());
        tracing::debug!(
            success = body.success,
            request_id = %body.request_id,
            expires_at = %expires_at,
            "mappings stored"
        );
        Ok(())
    }

    async fn fetch_entities(&self, id: &CorrelationId) -> Result<Vec<Entity>, ClientError> {
        let url = format!("{}/retrieve/{}", self.base_url, id);
        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(ClientError::Status(status));
        }
        let body: RetrieveResponse = response.json().await.map_err(ClientError::Decode)?;
        Ok(body.entities)
    }
}
