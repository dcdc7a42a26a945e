//! Embedding provider trait and implementations.
//!
//! This module defines the interface for turning query text into a vector
//! and provides an OpenAI-compatible HTTP implementation.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{sanitize_body, ProviderError};
use crate::retry::{post_json_with_retry, RetryPolicy};

const SERVICE: &str = "embeddings";

/// Default endpoint for the OpenAI embeddings API.
pub const DEFAULT_EMBEDDINGS_URL: &str = "https://api.openai.com/v1/embeddings";

/// Trait for embedding providers.
///
/// Implementations should be Send + Sync to allow use in async contexts.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a single text
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError>;

    /// Get the model name
    fn model_name(&self) -> &str;
}

/// Request body for embedding API
#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
}

/// Response from embedding API.
///
/// Accepts both the bare `{embedding}` shape and OpenAI's `{data: [...]}`.
#[derive(Deserialize)]
#[serde(untagged)]
enum EmbeddingResponse {
    Flat { embedding: Vec<f32> },
    Listed { data: Vec<EmbeddingData> },
}

/// Individual embedding data in response
#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    #[serde(default)]
    index: usize,
}

/// OpenAI-compatible embeddings provider.
pub struct OpenAiEmbeddings {
    api_key: Option<String>,
    model: String,
    client: Client,
    base_url: String,
    retry: RetryPolicy,
}

impl OpenAiEmbeddings {
    /// Create a provider. A missing key is reported on first use, not here.
    pub fn new(api_key: Option<String>, model: Option<String>) -> Self {
        Self {
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            model: model.unwrap_or_else(|| crate::DEFAULT_EMBEDDING_MODEL.to_string()),
            client: build_client(Duration::from_secs(30)),
            base_url: DEFAULT_EMBEDDINGS_URL.to_string(),
            retry: RetryPolicy::default(),
        }
    }

    /// Set a custom base URL (useful for testing or proxies).
    pub fn with_base_url(mut self, url: String) -> Self {
        self.base_url = url;
        self
    }

    /// Replace the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Per-request timeout, independent of the retry loop.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.client = build_client(timeout);
        self
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbeddings {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or(ProviderError::Configuration { service: SERVICE })?;

        debug!(model = %self.model, chars = text.len(), "Embedding query text");

        let request = EmbeddingRequest {
            model: &self.model,
            input: text,
        };
        let body = post_json_with_retry(
            &self.client,
            SERVICE,
            &self.base_url,
            api_key,
            &request,
            &self.retry,
        )
        .await?;

        parse_embedding(&body, Some(api_key))
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

pub(crate) fn build_client(timeout: Duration) -> Client {
    Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_default()
}

/// Decode an embedding response body into a single usable vector.
fn parse_embedding(body: &str, secret: Option<&str>) -> Result<Vec<f32>, ProviderError> {
    let response: EmbeddingResponse =
        serde_json::from_str(body).map_err(|e| ProviderError::InvalidResponse {
            service: SERVICE,
            detail: format!("{}: {}", e, sanitize_body(body, secret)),
        })?;

    let vector = match response {
        EmbeddingResponse::Flat { embedding } => embedding,
        EmbeddingResponse::Listed { mut data } => {
            data.sort_by_key(|d| d.index);
            data.into_iter()
                .next()
                .map(|d| d.embedding)
                .ok_or_else(|| ProviderError::Embedding("empty data array".to_string()))?
        }
    };

    if vector.is_empty() {
        return Err(ProviderError::Embedding("empty vector".to_string()));
    }
    if vector.iter().any(|v| !v.is_finite()) {
        return Err(ProviderError::Embedding("vector contains non-finite values".to_string()));
    }
    Ok(vector)
}
