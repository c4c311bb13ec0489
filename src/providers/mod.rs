//! External model collaborators: text/vision completion and embeddings.
//!
//! The pipeline only sees the two traits below, so tests and alternative
//! backends can be substituted without touching ingestion or query code.

pub mod cache;
pub mod completion;
pub mod openai;

pub use cache::EmbeddingCache;
pub use completion::OpenAICompletion;
pub use openai::OpenAIEmbedder;

use crate::error::{RagError, Result};
use async_trait::async_trait;

/// What a completion is being asked for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionPurpose {
    /// Entity/relation extraction from a content chunk
    Extraction,
    /// Answer synthesis from retrieved context
    Answer,
}

/// A single text completion request
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub purpose: CompletionPurpose,
    pub system: Option<String>,
    pub prompt: String,
}

impl CompletionRequest {
    pub fn new(purpose: CompletionPurpose, prompt: impl Into<String>) -> Self {
        Self {
            purpose,
            system: None,
            prompt: prompt.into(),
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }
}

/// Text (and optionally vision) completion backend
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<String>;

    /// Describe an image for ingestion. Backends without a vision model refuse.
    async fn describe_image(&self, _prompt: &str, _mime_type: &str, _image: &[u8]) -> Result<String> {
        Err(RagError::Completion(
            "this completion provider has no vision model".to_string(),
        ))
    }
}

/// Text embedding backend producing fixed-dimension vectors
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Configured output dimension
    fn dimension(&self) -> usize;

    /// Embed a batch of texts, one vector per input, in input order
    async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>>;

    /// Embed a single query string
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed(vec![text.to_string()]).await?;
        if vectors.is_empty() {
            return Err(RagError::Embedding("Empty response for query embedding".to_string()));
        }
        Ok(vectors.remove(0))
    }
}

/// Verify a provider response: one vector per label, each exactly `expected` long.
///
/// A mismatch is reported against the offending label; vectors are never
/// truncated or padded.
pub fn check_dimensions(vectors: &[Vec<f32>], labels: &[String], expected: usize) -> Result<()> {
    if vectors.len() != labels.len() {
        return Err(RagError::Embedding(format!(
            "Embedding provider returned {} vectors for {} inputs",
            vectors.len(),
            labels.len()
        )));
    }
    for (vector, label) in vectors.iter().zip(labels) {
        if vector.len() != expected {
            return Err(RagError::Embedding(format!(
                "Embedding for {} has dimension {}, expected {}",
                label,
                vector.len(),
                expected
            )));
        }
    }
    Ok(())
}
