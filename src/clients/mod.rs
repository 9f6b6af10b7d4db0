//! HTTP clients for the three services the gateway depends on.
//!
//! Each dependency sits behind a trait so the pipeline never touches a
//! concrete transport. The `Http*` implementations in the submodules talk
//! JSON over reqwest with a per-client timeout.

use crate::{ChatCompletionRequest, ChatCompletionResponse, CorrelationId, Entity};

pub mod detector;
pub mod provider;
pub mod vault;

pub use self::detector::HttpEntityDetector;
pub use self::provider::HttpCompletionProvider;
pub use self::vault::HttpMappingStore;

/// Failure classes shared by all outbound calls. `Send` covers transport
/// errors including timeouts, `Status` a non-200 answer, `Decode` a body
/// that did not match the expected schema.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Send(#[from] reqwest::Error),
    #[error("unexpected status {0}")]
    Status(reqwest::StatusCode),
    #[error("invalid response body: {0}")]
    Decode(#[source] reqwest::Error),
}

/// Finds sensitive values in free text and proposes a replacement token
/// for each.
#[async_trait::async_trait]
pub trait EntityDetector: Send + Sync {
    async fn detect_entities(&self, text: &str) -> Result<Vec<Entity>, ClientError>;
}

/// Keeps token/original mappings keyed by correlation id. A write and a
/// read fail independently; callers decide how severe each is.
#[async_trait::async_trait]
pub trait MappingStore: Send + Sync {
    async fn store_entities(
        &self,
        id: &CorrelationId,
        entities: &[Entity],
    ) -> Result<(), ClientError>;

    async fn fetch_entities(&self, id: &CorrelationId) -> Result<Vec<Entity>, ClientError>;
}

/// The upstream model endpoint that answers tokenized conversations.
#[async_trait::async_trait]
pub trait CompletionProvider: Send + Sync {
    async fn chat_completion(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, ClientError>;
}
