//! Vector store: embeddings plus key-value metadata for similarity retrieval.

mod sqlite;

pub use sqlite::SqliteVectorStore;

use crate::error::Result;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

/// Partition of the vector store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Namespace {
    /// Content chunks of ingested documents
    Chunks,
    /// Entity name + description
    Entities,
    /// Relation keywords + description
    Relations,
}

impl Namespace {
    pub fn as_str(&self) -> &'static str {
        match self {
            Namespace::Chunks => "chunks",
            Namespace::Entities => "entities",
            Namespace::Relations => "relations",
        }
    }
}

/// One embedding to persist
#[derive(Debug, Clone)]
pub struct VectorRecord {
    pub namespace: Namespace,
    /// Chunk id, entity key or relation id
    pub id: String,
    pub doc_id: Option<String>,
    pub content: String,
    pub embedding: Vec<f32>,
    pub metadata: Value,
}

/// A similarity search result
#[derive(Debug, Clone, Serialize)]
pub struct VectorHit {
    pub id: String,
    pub doc_id: Option<String>,
    pub content: String,
    pub metadata: Value,
    pub score: f32,
}

/// Persistent embedding store.
///
/// `upsert` is atomic per call and keyed by (namespace, id), so writing the
/// same records twice leaves one copy. Every stored vector has exactly
/// `dimension()` components.
#[async_trait]
pub trait VectorStore: Send + Sync {
    fn dimension(&self) -> usize;

    async fn upsert(&self, records: Vec<VectorRecord>) -> Result<()>;

    /// Top `k` records by cosine similarity with score >= `min_score`, best first
    async fn search(
        &self,
        namespace: Namespace,
        query: Vec<f32>,
        k: usize,
        min_score: f32,
    ) -> Result<Vec<VectorHit>>;

    /// Whether chunks of `doc_id` are already stored
    async fn has_document(&self, doc_id: &str) -> Result<bool>;

    async fn count(&self, namespace: Namespace) -> Result<usize>;
}

/// Compute cosine similarity between two vectors
///
/// Returns 0.0 if the lengths differ or either vector has zero magnitude.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }

    dot / (mag_a * mag_b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity_identical() {
        let similarity = cosine_similarity(&[1.0, 0.0, 0.0], &[1.0, 0.0, 0.0]);
        assert!((similarity - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_orthogonal_and_opposite() {
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_degenerate() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn test_cosine_similarity_magnitude_independent() {
        let similarity = cosine_similarity(&[1.0, 0.0, 0.0], &[2.0, 0.0, 0.0]);
        assert!((similarity - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_namespace_names() {
        assert_eq!(Namespace::Chunks.as_str(), "chunks");
        assert_eq!(serde_json::to_string(&Namespace::Relations).unwrap(), "\"relations\"");
    }
}
