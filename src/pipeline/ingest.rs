use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{stream, StreamExt, TryStreamExt};
use serde::Serialize;
use serde_json::json;
use sha2::{Digest, Sha256};

use super::chunker::{chunk_document, Chunk};
use crate::config::IngestConfig;
use crate::error::{RagError, Result};
use crate::graph::{
    build_extraction_prompt, parse_extraction, Entity, Extraction, GraphStore, Relation,
    EXTRACTION_SYSTEM_PROMPT,
};
use crate::providers::{check_dimensions, CompletionProvider, CompletionPurpose, CompletionRequest, EmbeddingProvider};
use crate::vector::{Namespace, VectorRecord, VectorStore};

/// Chunks extracted in parallel per document
const EXTRACTION_CONCURRENCY: usize = 4;

/// Raw content handed to the pipeline
#[derive(Debug, Clone)]
pub struct Document {
    pub content: String,
    pub description: Option<String>,
    /// Where the content came from (`api`, an upload filename, a path)
    pub source: String,
}

impl Document {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            description: None,
            source: "api".to_string(),
        }
    }

    pub fn with_description(mut self, description: Option<String>) -> Self {
        self.description = description.filter(|d| !d.trim().is_empty());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Content-derived id; identical content always maps to the same document
    pub fn doc_id(&self) -> String {
        let hash = Sha256::digest(self.content.trim().as_bytes());
        let hex: String = hash.iter().take(16).map(|b| format!("{:02x}", b)).collect();
        format!("doc-{}", hex)
    }
}

/// Outcome of one ingestion
#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestReport {
    pub doc_id: String,
    pub chunks: usize,
    pub entities: usize,
    pub relations: usize,
    /// Content was already stored; nothing was written
    pub skipped: bool,
}

/// Chunk → extract → embed → write graph → write vectors
pub struct IngestionPipeline {
    completion: Arc<dyn CompletionProvider>,
    embedder: Arc<dyn EmbeddingProvider>,
    graph: Arc<dyn GraphStore>,
    vector: Arc<dyn VectorStore>,
    config: IngestConfig,
    timeout: Duration,
}

impl IngestionPipeline {
    pub fn new(
        completion: Arc<dyn CompletionProvider>,
        embedder: Arc<dyn EmbeddingProvider>,
        graph: Arc<dyn GraphStore>,
        vector: Arc<dyn VectorStore>,
        config: IngestConfig,
        timeout: Duration,
    ) -> Self {
        Self {
            completion,
            embedder,
            graph,
            vector,
            config,
            timeout,
        }
    }

    /// Ingest one document.
    ///
    /// Everything is extracted and embedded before the first write, so
    /// extraction and dimension failures leave both stores untouched. The
    /// graph is written first; if the vector write then fails the caller gets
    /// `PartialWrite` and can re-ingest, which merges rather than duplicates.
    pub async fn ingest(&self, document: Document) -> Result<IngestReport> {
        if document.content.trim().is_empty() {
            return Err(RagError::InvalidInput("content must not be empty".to_string()));
        }

        let doc_id = document.doc_id();
        if self.vector.has_document(&doc_id).await.map_err(storage)? {
            log::info!("Document {} already ingested, skipping", doc_id);
            return Ok(IngestReport {
                doc_id,
                skipped: true,
                ..IngestReport::default()
            });
        }

        let chunks = chunk_document(&doc_id, &document.content, &self.config);
        log::debug!("Document {} split into {} chunks", doc_id, chunks.len());

        let extractions: Vec<Extraction> = stream::iter(chunks.iter().cloned())
            .map(|chunk| {
                let description = document.description.clone();
                async move { self.extract(chunk, description).await }
            })
            .buffered(EXTRACTION_CONCURRENCY)
            .try_collect()
            .await?;
        let (entities, relations) = self.merge_with_existing(extractions).await?;

        let records = self.embed_records(&doc_id, &document, &chunks, &entities, &relations).await?;

        let report = IngestReport {
            doc_id: doc_id.clone(),
            chunks: chunks.len(),
            entities: entities.len(),
            relations: relations.len(),
            skipped: false,
        };

        self.graph.upsert_entities(entities).await.map_err(storage)?;
        self.graph.upsert_relations(relations).await.map_err(storage)?;

        if let Err(e) = self.vector.upsert(records).await {
            log::error!("Vector write failed after graph write for {}: {}", doc_id, e);
            return Err(RagError::PartialWrite {
                doc_id,
                message: e.to_string(),
            });
        }

        log::info!(
            "Ingested {} ({}): {} chunks, {} entities, {} relations",
            report.doc_id,
            document.source,
            report.chunks,
            report.entities,
            report.relations
        );
        Ok(report)
    }

    async fn extract(&self, chunk: Chunk, description: Option<String>) -> Result<Extraction> {
        let request = CompletionRequest::new(
            CompletionPurpose::Extraction,
            build_extraction_prompt(&chunk.text, description.as_deref()),
        )
        .with_system(EXTRACTION_SYSTEM_PROMPT);

        let reply = tokio::time::timeout(self.timeout, self.completion.complete(request))
            .await
            .map_err(|_| {
                RagError::Extraction(format!(
                    "Extraction for {} timed out after {}s",
                    chunk.id,
                    self.timeout.as_secs()
                ))
            })?
            .map_err(|e| RagError::Extraction(format!("Extraction for {} failed: {}", chunk.id, e)))?;

        parse_extraction(&reply, &chunk.id)
    }

    /// Merge per-chunk extractions with each other and with what the graph already holds.
    ///
    /// The merged view feeds the entity/relation embeddings so their vectors
    /// describe everything known about them, not only this document.
    async fn merge_with_existing(
        &self,
        extractions: Vec<Extraction>,
    ) -> Result<(Vec<Entity>, Vec<Relation>)> {
        let mut entities: Vec<Entity> = Vec::new();
        let mut entity_index: HashMap<String, usize> = HashMap::new();
        let mut relations: Vec<Relation> = Vec::new();
        let mut relation_index: HashMap<String, usize> = HashMap::new();

        for extraction in extractions {
            for entity in extraction.entities {
                match entity_index.get(&entity.key) {
                    Some(&i) => entities[i].merge(&entity),
                    None => {
                        entity_index.insert(entity.key.clone(), entities.len());
                        entities.push(entity);
                    }
                }
            }
            for relation in extraction.relations {
                match relation_index.get(&relation.relation_id) {
                    Some(&i) => relations[i].merge(&relation),
                    None => {
                        relation_index.insert(relation.relation_id.clone(), relations.len());
                        relations.push(relation);
                    }
                }
            }
        }

        if entities.is_empty() && relations.is_empty() {
            return Ok((entities, relations));
        }

        let keys: Vec<String> = entities.iter().map(|e| e.key.clone()).collect();
        for existing in self.graph.get_entities(keys).await.map_err(storage)? {
            if let Some(&i) = entity_index.get(&existing.key) {
                let mut merged = existing;
                merged.merge(&entities[i]);
                entities[i] = merged;
            }
        }

        let mut endpoint_keys: Vec<String> = Vec::new();
        for r in &relations {
            for key in [&r.source_key, &r.target_key] {
                if !endpoint_keys.contains(key) {
                    endpoint_keys.push(key.clone());
                }
            }
        }
        for existing in self.graph.relations_between(endpoint_keys).await.map_err(storage)? {
            if let Some(&i) = relation_index.get(&existing.relation_id) {
                let mut merged = existing;
                merged.merge(&relations[i]);
                relations[i] = merged;
            }
        }

        Ok((entities, relations))
    }

    async fn embed_records(
        &self,
        doc_id: &str,
        document: &Document,
        chunks: &[Chunk],
        entities: &[Entity],
        relations: &[Relation],
    ) -> Result<Vec<VectorRecord>> {
        let chunk_vectors = self
            .embed_checked(
                chunks.iter().map(|c| c.text.clone()).collect(),
                chunks.iter().map(|c| c.id.clone()).collect(),
            )
            .await?;
        let entity_vectors = self
            .embed_checked(
                entities.iter().map(Entity::embedding_text).collect(),
                entities.iter().map(|e| format!("entity '{}'", e.name)).collect(),
            )
            .await?;
        let relation_vectors = self
            .embed_checked(
                relations.iter().map(Relation::embedding_text).collect(),
                relations
                    .iter()
                    .map(|r| format!("relation {} -> {}", r.source_key, r.target_key))
                    .collect(),
            )
            .await?;

        let mut records = Vec::with_capacity(chunks.len() + entities.len() + relations.len());
        for (chunk, embedding) in chunks.iter().zip(chunk_vectors) {
            records.push(VectorRecord {
                namespace: Namespace::Chunks,
                id: chunk.id.clone(),
                doc_id: Some(doc_id.to_string()),
                content: chunk.text.clone(),
                embedding,
                metadata: json!({
                    "chunk_index": chunk.index,
                    "tokens": chunk.tokens,
                    "source": document.source,
                    "description": document.description,
                }),
            });
        }
        for (entity, embedding) in entities.iter().zip(entity_vectors) {
            records.push(VectorRecord {
                namespace: Namespace::Entities,
                id: entity.key.clone(),
                doc_id: None,
                content: entity.embedding_text(),
                embedding,
                metadata: json!({ "name": entity.name, "entity_type": entity.entity_type }),
            });
        }
        for (relation, embedding) in relations.iter().zip(relation_vectors) {
            records.push(VectorRecord {
                namespace: Namespace::Relations,
                id: relation.relation_id.clone(),
                doc_id: None,
                content: relation.embedding_text(),
                embedding,
                metadata: json!({
                    "source": relation.source_key,
                    "target": relation.target_key,
                    "keywords": relation.keywords,
                    "weight": relation.weight,
                }),
            });
        }
        Ok(records)
    }

    async fn embed_checked(&self, texts: Vec<String>, labels: Vec<String>) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let vectors = tokio::time::timeout(self.timeout, self.embedder.embed(texts))
            .await
            .map_err(|_| {
                RagError::Embedding(format!("Embedding timed out after {}s", self.timeout.as_secs()))
            })??;
        check_dimensions(&vectors, &labels, self.vector.dimension())?;
        Ok(vectors)
    }
}

/// Any store failure surfaces as `Storage`
fn storage(e: RagError) -> RagError {
    match e {
        RagError::Storage(_) => e,
        RagError::Database(err) => RagError::Storage(err.to_string()),
        other => RagError::Storage(other.to_string()),
    }
}
