use std::time::Duration;

use super::{ClientError, CompletionProvider};
use crate::{ChatCompletionRequest, ChatCompletionResponse};

/// API version header the upstream provider expects.
const PROVIDER_API_VERSION: &str = "2023-06-01";

/// LLM provider client. By the time a request reaches this call its
/// message contents carry tokens, never the detected originals.
pub struct HttpCompletionProvider {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl HttpCompletionProvider {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("failed to build reqwest client");
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            client,
        }
    }
}

#[async_trait::async_trait]
impl CompletionProvider for HttpCompletionProvider {
    async fn chat_completion(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, ClientError> {
        let url = format!("{}/v1/messages", self.base_url);
        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", PROVIDER_API_VERSION)
            .json(request)
            .send()
            .await?;
        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(ClientError::Status(status));
        }
        response.json().await.map_err(ClientError::Decode)
    }
}
