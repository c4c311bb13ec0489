use crate::error::{Result, RagError};
use crate::providers::{check_dimensions, EmbeddingCache, EmbeddingProvider};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// OpenAI embeddings API caps a request at 2048 inputs
const MAX_BATCH_SIZE: usize = 2048;
const MAX_RETRIES: usize = 3;

/// Request structure for OpenAI-compatible embeddings API
#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
    encoding_format: &'static str,
}

/// Response structure from OpenAI-compatible embeddings API
#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

/// One failed API call and whether another attempt may succeed
struct ApiFailure {
    retryable: bool,
    error: RagError,
}

/// OpenAI-compatible embeddings client
///
/// Handles batch embedding generation with retry on rate limits and server
/// errors, enforces the configured dimension, and optionally caches query
/// embeddings.
pub struct OpenAIEmbedder {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    dimension: usize,
    batch_size: usize,
    max_input_chars: usize,
    cache: Option<Arc<EmbeddingCache>>,
}

impl OpenAIEmbedder {
    /// Create a new embedder
    ///
    /// # Arguments
    ///
    /// * `api_key` - Bearer token for the provider
    /// * `base_url` - API root, e.g. `https://openrouter.ai/api/v1`
    /// * `model` - Model name (e.g., "text-embedding-3-small")
    /// * `dimension` - Expected vector length; other lengths are rejected
    /// * `batch_size` - Maximum number of texts per API request (capped at 2048)
    /// * `timeout` - Per-request HTTP timeout
    pub fn new(
        api_key: String,
        base_url: &str,
        model: String,
        dimension: usize,
        batch_size: usize,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RagError::Configuration(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            dimension,
            batch_size: batch_size.clamp(1, MAX_BATCH_SIZE),
            max_input_chars: usize::MAX,
            cache: None,
        })
    }

    /// Attach an LRU cache used for query embeddings
    pub fn with_cache(mut self, cache: Arc<EmbeddingCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Cap each input at roughly `max_tokens` tokens (~4 chars per token)
    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_input_chars = max_tokens.saturating_mul(4);
        self
    }

    fn prepare_input(&self, text: String) -> String {
        if text.len() <= self.max_input_chars {
            return text;
        }
        let mut end = self.max_input_chars;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        log::debug!("Embedding input truncated from {} to {} bytes", text.len(), end);
        text[..end].to_string()
    }

    /// Embed one API batch, retrying with exponential backoff on 429/5xx
    async fn embed_with_retry(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut attempt = 0;
        let mut delay = Duration::from_millis(500);

        loop {
            match self.embed_batch_internal(texts).await {
                Ok(embeddings) => return Ok(embeddings),
                Err(failure) if failure.retryable && attempt < MAX_RETRIES => {
                    log::warn!("Embedding retry {}/{} after error: {}", attempt + 1, MAX_RETRIES, failure.error);
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                Err(failure) => return Err(failure.error),
            }
        }
    }

    /// Single API request
    async fn embed_batch_internal(&self, texts: &[String]) -> std::result::Result<Vec<Vec<f32>>, ApiFailure> {
        let request = EmbeddingRequest {
            model: &self.model,
            input: texts,
            encoding_format: "float",
        };

        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| ApiFailure {
                retryable: e.is_timeout() || e.is_connect(),
                error: RagError::Embedding(format!("Network error: {}", e)),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read error response".to_string());
            return Err(ApiFailure {
                retryable: is_retryable_status(status),
                error: RagError::Embedding(format!("Embedding API error {}: {}", status, body)),
            });
        }

        let mut result: EmbeddingResponse = response.json().await.map_err(|e| ApiFailure {
            retryable: false,
            error: RagError::Embedding(format!("Failed to parse response: {}", e)),
        })?;

        result.data.sort_by_key(|d| d.index);
        Ok(result.data.into_iter().map(|d| d.embedding).collect())
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

#[async_trait]
impl EmbeddingProvider for OpenAIEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let texts: Vec<String> = texts.into_iter().map(|t| self.prepare_input(t)).collect();
        let mut all_embeddings = Vec::with_capacity(texts.len());

        for (batch_no, batch) in texts.chunks(self.batch_size).enumerate() {
            let embeddings = self.embed_with_retry(batch).await?;
            let labels: Vec<String> = (0..batch.len())
                .map(|i| format!("input #{}", batch_no * self.batch_size + i))
                .collect();
            check_dimensions(&embeddings, &labels, self.dimension)?;
            all_embeddings.extend(embeddings);
        }

        Ok(all_embeddings)
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        if let Some(cache) = &self.cache {
            if let Some(cached) = cache.get(text) {
                log::debug!("Query embedding cache hit");
                return Ok(cached);
            }
        }

        let mut vectors = self.embed(vec![text.to_string()]).await?;
        if vectors.is_empty() {
            return Err(RagError::Embedding("Empty response from embedding API".to_string()));
        }
        let embedding = vectors.remove(0);

        if let Some(cache) = &self.cache {
            cache.put(text.to_string(), embedding.clone());
        }
        Ok(embedding)
    }
}
