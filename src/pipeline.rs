//! The redaction pipeline.
//!
//! A completion pass runs a fixed stage order: extract text, detect
//! entities, store the mappings, substitute tokens into the request,
//! forward it upstream, read the mappings back and substitute the
//! originals into the response. Every stage must succeed before the next
//! one runs. Store and read always happen, even for a request with no
//! detected entities.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use aho_corasick::{AhoCorasickBuilder, MatchKind};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use tokio_util::sync::CancellationToken;

use crate::clients::{ClientError, CompletionProvider, EntityDetector, MappingStore};
use crate::{ChatCompletionRequest, ChatCompletionResponse, CorrelationId, Entity, ErrorBody};

/// Stage failures, one variant per dependency interaction. A store write
/// and a store read are distinct classes: after a failed read the
/// provider has already answered, so a retry would spend provider usage
/// twice.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("entity detection failed: {0}")]
    DetectorUnavailable(#[source] ClientError),
    #[error("mapping store write failed: {0}")]
    StoreUnavailable(#[source] ClientError),
    #[error("mapping store read failed: {0}")]
    RetrieveFailed(#[source] ClientError),
    #[error("completion request failed: {0}")]
    ProviderUnavailable(#[source] ClientError),
    #[error("conflicting mapping for token {token}")]
    ConflictingToken { token: String },
    #[error("request cancelled")]
    Cancelled,
}

impl PipelineError {
    pub fn status(&self) -> StatusCode {
        match self {
            PipelineError::DetectorUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            PipelineError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            PipelineError::RetrieveFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            PipelineError::ProviderUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            PipelineError::ConflictingToken { .. } => StatusCode::SERVICE_UNAVAILABLE,
            PipelineError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Stable client-facing message. Transport detail stays in the error
    /// chain and the logs, never in the response body.
    pub fn public_message(&self) -> &'static str {
        match self {
            PipelineError::DetectorUnavailable(_) => "NER service unavailable",
            PipelineError::StoreUnavailable(_) => "Vault service unavailable",
            PipelineError::RetrieveFailed(_) => "Vault retrieve failed",
            PipelineError::ProviderUnavailable(_) => "LLM service unavailable",
            PipelineError::ConflictingToken { .. } => "NER service unavailable",
            PipelineError::Cancelled => "Request cancelled",
        }
    }
}

impl IntoResponse for PipelineError {
    fn into_response(self) -> axum::response::Response {
        let body = ErrorBody {
            error: self.public_message().to_string(),
        };
        (self.status(), Json(body)).into_response()
    }
}

/// Wall-clock milliseconds spent in each external call of a completion
/// pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct StageTimings {
    pub detect_ms: f64,
    pub store_ms: f64,
    pub provider_ms: f64,
    pub retrieve_ms: f64,
}

/// Orchestrates the detector, the mapping store and the provider.
pub struct RedactionPipeline {
    detector: Arc<dyn EntityDetector>,
    store: Arc<dyn MappingStore>,
    provider: Arc<dyn CompletionProvider>,
}

impl RedactionPipeline {
    pub fn new(
        detector: Arc<dyn EntityDetector>,
        store: Arc<dyn MappingStore>,
        provider: Arc<dyn CompletionProvider>,
    ) -> Self {
        Self {
            detector,
            store,
            provider,
        }
    }

    /// Runs a full completion pass for `id`. The provider only ever sees
    /// the tokenized request; the caller only ever sees the restored
    /// response.
    pub async fn process(
        &self,
        request: &ChatCompletionRequest,
        id: &CorrelationId,
        cancel: &CancellationToken,
    ) -> Result<(ChatCompletionResponse, StageTimings), PipelineError> {
        let mut timings = StageTimings::default();
        let text = extract_text(request);

        let start = Instant::now();
        let detected = with_cancel(cancel, self.detector.detect_entities(&text))
            .await?
            .map_err(PipelineError::DetectorUnavailable)?;
        timings.detect_ms = elapsed_ms(start);
        tracing::debug!(
            request_id = %id,
            elapsed_ms = timings.detect_ms,
            entities = detected.len(),
            "detect stage complete"
        );
        let entities = usable_entities(detected)?;

        let start = Instant::now();
        with_cancel(cancel, self.store.store_entities(id, &entities))
            .await?
            .map_err(PipelineError::StoreUnavailable)?;
        timings.store_ms = elapsed_ms(start);
        tracing::debug!(request_id = %id, elapsed_ms = timings.store_ms, "store stage complete");

        let outbound = tokenize_request(request, &entities);

        let start = Instant::now();
        let completion = with_cancel(cancel, self.provider.chat_completion(&outbound))
            .await?
            .map_err(PipelineError::ProviderUnavailable)?;
        timings.provider_ms = elapsed_ms(start);
        tracing::debug!(
            request_id = %id,
            elapsed_ms = timings.provider_ms,
            "forward stage complete"
        );

        let start = Instant::now();
        let stored = with_cancel(cancel, self.store.fetch_entities(id))
            .await?
            .map_err(PipelineError::RetrieveFailed)?;
        timings.retrieve_ms = elapsed_ms(start);
        tracing::debug!(
            request_id = %id,
            elapsed_ms = timings.retrieve_ms,
            "recall stage complete"
        );

        Ok((detokenize_response(completion, &stored), timings))
    }

    /// Detects and stores entities for `id`, returning the tokenized text
    /// and the number of mappings recorded.
    pub async fn anonymize(
        &self,
        text: &str,
        id: &CorrelationId,
        cancel: &CancellationToken,
    ) -> Result<(String, usize), PipelineError> {
        let detected = with_cancel(cancel, self.detector.detect_entities(text))
            .await?
            .map_err(PipelineError::DetectorUnavailable)?;
        let entities = usable_entities(detected)?;
        with_cancel(cancel, self.store.store_entities(id, &entities))
            .await?
            .map_err(PipelineError::StoreUnavailable)?;
        Ok((tokenize(text, &entities), entities.len()))
    }

    /// Restores a tokenized text from the mappings stored under `id`. Any
    /// id with stored mappings works, whether or not a completion was
    /// ever forwarded for it.
    pub async fn restore(
        &self,
        id: &CorrelationId,
        text: &str,
        cancel: &CancellationToken,
    ) -> Result<String, PipelineError> {
        let stored = with_cancel(cancel, self.store.fetch_entities(id))
            .await?
            .map_err(PipelineError::RetrieveFailed)?;
        Ok(detokenize(text, &stored))
    }
}

/// Replaces every entity literal with its token in a single pass over the
/// text. Overlapping literals resolve leftmost-longest. Replaced spans are
/// never rescanned, so a replacement value that happens to equal another
/// literal is left alone.
pub fn tokenize(text: &str, entities: &[Entity]) -> String {
    substitute(
        text,
        entities
            .iter()
            .map(|e| (e.original.as_str(), e.token.as_str())),
    )
}

/// Inverse of `tokenize`: swaps tokens back to their original values.
pub fn detokenize(text: &str, entities: &[Entity]) -> String {
    substitute(
        text,
        entities
            .iter()
            .map(|e| (e.token.as_str(), e.original.as_str())),
    )
}

fn substitute<'a, I>(text: &str, pairs: I) -> String
where
    I: Iterator<Item = (&'a str, &'a str)>,
{
    let (patterns, replacements): (Vec<&str>, Vec<&str>) = pairs.unzip();
    if patterns.is_empty() {
        return text.to_string();
    }
    let ac = AhoCorasickBuilder::new()
        .match_kind(MatchKind::LeftmostLongest)
        .build(&patterns)
        .expect("failed to build literal matcher");
    ac.replace_all(text, &replacements)
}

/// Concatenates message contents in order, one line per message. This is
/// exactly the text the detector scans, so every literal it reports can
/// be found again in the individual messages.
fn extract_text(request: &ChatCompletionRequest) -> String {
    let mut text = String::new();
    for message in &request.messages {
        text.push_str(&message.content);
        text.push('\n');
    }
    text
}

fn tokenize_request(request: &ChatCompletionRequest, entities: &[Entity]) -> ChatCompletionRequest {
    let mut outbound = request.clone();
    for message in &mut outbound.messages {
        message.content = tokenize(&message.content, entities);
    }
    outbound
}

fn detokenize_response(
    mut response: ChatCompletionResponse,
    entities: &[Entity],
) -> ChatCompletionResponse {
    for choice in &mut response.choices {
        choice.message.content = detokenize(&choice.message.content, entities);
    }
    response
}

/// Drops detector output that cannot participate in substitution and
/// refuses token collisions. Two originals sharing a token would make
/// restoration ambiguous, so the whole batch is rejected.
fn usable_entities(detected: Vec<Entity>) -> Result<Vec<Entity>, PipelineError> {
    let mut kept = Vec::with_capacity(detected.len());
    for entity in detected {
        if entity.original.is_empty() || entity.token.is_empty() {
            tracing::warn!(entity_type = %entity.entity_type, "dropping entity with empty literal");
            continue;
        }
        kept.push(entity);
    }
    let mut seen: HashMap<&str, &str> = HashMap::new();
    for entity in &kept {
        match seen.get(entity.token.as_str()) {
            Some(original) if *original != entity.original => {
                return Err(PipelineError::ConflictingToken {
                    token: entity.token.clone(),
                });
            }
            _ => {
                seen.insert(&entity.token, &entity.original);
            }
        }
    }
    Ok(kept)
}

async fn with_cancel<F>(cancel: &CancellationToken, fut: F) -> Result<F::Output, PipelineError>
where
    F: Future,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(PipelineError::Cancelled),
        out = fut => Ok(out),
    }
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}
