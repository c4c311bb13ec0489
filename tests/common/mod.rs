//! Deterministic providers and instrumented stores for integration tests.
#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use ragserve::db::{Db, StoreLocation};
use ragserve::graph::{Entity, GraphCounts, GraphStore, Relation, SqliteGraphStore, Subgraph};
use ragserve::parser::ParserRegistry;
use ragserve::providers::{CompletionProvider, CompletionPurpose, CompletionRequest, EmbeddingProvider};
use ragserve::vector::{Namespace, SqliteVectorStore, VectorHit, VectorRecord, VectorStore};
use ragserve::{Backends, Config, RagError, Result};

pub const DIM: usize = 64;

fn words(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Hashed bag-of-words embedder: shared words give similar vectors
pub struct HashEmbedder {
    pub dimension: usize,
    /// Length actually returned; differs from `dimension` to simulate a broken provider
    pub output_len: usize,
    pub calls: AtomicUsize,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension, output_len: dimension, calls: AtomicUsize::new(0) }
    }

    pub fn returning(dimension: usize, output_len: usize) -> Self {
        Self { dimension, output_len, calls: AtomicUsize::new(0) }
    }

    fn vector(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.output_len];
        for word in words(text) {
            let hash = Sha256::digest(word.as_bytes());
            let slot = u32::from_le_bytes([hash[0], hash[1], hash[2], hash[3]]) as usize % self.output_len;
            v[slot] += 1.0;
        }
        v
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(texts.iter().map(|t| self.vector(t)).collect())
    }
}

/// Rule-based completion: capitalised words become entities, answers echo the best context line
#[derive(Default)]
pub struct StubCompletion {
    pub fail_answers: AtomicBool,
    /// Extraction replies with prose instead of JSON
    pub garble_extraction: AtomicBool,
    /// Every call hangs far longer than any test timeout
    pub stall: AtomicBool,
    pub answer_calls: AtomicUsize,
    pub extraction_calls: AtomicUsize,
}

impl StubCompletion {
    fn extract(prompt: &str) -> String {
        let text = prompt.rsplit("Text:\n").next().unwrap_or(prompt);
        let mut names: Vec<String> = Vec::new();
        for word in text.split_whitespace() {
            let word = word.trim_matches(|c: char| !c.is_alphanumeric());
            if word.chars().next().is_some_and(char::is_uppercase) && !names.iter().any(|n| n == word) {
                names.push(word.to_string());
            }
        }

        let entities: Vec<_> = names
            .iter()
            .map(|n| serde_json::json!({"name": n, "type": "concept", "description": text.trim()}))
            .collect();
        let relations: Vec<_> = names
            .windows(2)
            .map(|pair| {
                serde_json::json!({
                    "source": pair[0],
                    "target": pair[1],
                    "description": text.trim(),
                    "keywords": "related",
                    "weight": 1.0
                })
            })
            .collect();
        format!(
            "```json\n{}\n```",
            serde_json::json!({"entities": entities, "relations": relations})
        )
    }

    fn answer(request: &CompletionRequest) -> String {
        let query_words = words(&request.prompt);
        let system = request.system.as_deref().unwrap_or("");
        let best = system
            .lines()
            .filter_map(|l| l.strip_prefix("- "))
            .max_by_key(|line| {
                let line_words = words(line);
                query_words.iter().filter(|w| line_words.contains(w)).count()
            })
            .unwrap_or("I do not know.");
        format!("According to the knowledge base: {}", best)
    }
}

#[async_trait]
impl CompletionProvider for StubCompletion {
    async fn complete(&self, request: CompletionRequest) -> Result<String> {
        if self.stall.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(300)).await;
        }
        match request.purpose {
            CompletionPurpose::Extraction => {
                self.extraction_calls.fetch_add(1, Ordering::SeqCst);
                if self.garble_extraction.load(Ordering::SeqCst) {
                    return Ok("Sorry, I could not find any entities in that text.".to_string());
                }
                Ok(Self::extract(&request.prompt))
            }
            CompletionPurpose::Answer => {
                self.answer_calls.fetch_add(1, Ordering::SeqCst);
                if self.fail_answers.load(Ordering::SeqCst) {
                    return Err(RagError::Completion("upstream returned 502".to_string()));
                }
                Ok(Self::answer(&request))
            }
        }
    }

    async fn describe_image(&self, _prompt: &str, mime_type: &str, image: &[u8]) -> Result<String> {
        Ok(format!("A diagram ({}, {} bytes) showing Paris next to the Eiffel Tower.", mime_type, image.len()))
    }
}

/// Graph store wrapper recording which operations ran
pub struct RecordingGraph {
    inner: SqliteGraphStore,
    pub calls: Mutex<Vec<&'static str>>,
}

impl RecordingGraph {
    fn record(&self, op: &'static str) {
        self.calls.lock().unwrap().push(op);
    }

    pub fn take_calls(&self) -> Vec<&'static str> {
        std::mem::take(&mut *self.calls.lock().unwrap())
    }
}

#[async_trait]
impl GraphStore for RecordingGraph {
    async fn upsert_entities(&self, entities: Vec<Entity>) -> Result<()> {
        self.record("upsert_entities");
        self.inner.upsert_entities(entities).await
    }

    async fn upsert_relations(&self, relations: Vec<Relation>) -> Result<()> {
        self.record("upsert_relations");
        self.inner.upsert_relations(relations).await
    }

    async fn get_entities(&self, keys: Vec<String>) -> Result<Vec<Entity>> {
        self.record("get_entities");
        self.inner.get_entities(keys).await
    }

    async fn match_entities(&self, text: &str, limit: usize) -> Result<Vec<Entity>> {
        self.record("match_entities");
        self.inner.match_entities(text, limit).await
    }

    async fn neighborhood(&self, keys: Vec<String>, depth: usize) -> Result<Subgraph> {
        self.record("neighborhood");
        self.inner.neighborhood(keys, depth).await
    }

    async fn relations_between(&self, keys: Vec<String>) -> Result<Vec<Relation>> {
        self.record("relations_between");
        self.inner.relations_between(keys).await
    }

    async fn top_entities(&self, limit: usize) -> Result<Vec<(Entity, usize)>> {
        self.record("top_entities");
        self.inner.top_entities(limit).await
    }

    async fn counts(&self) -> Result<GraphCounts> {
        self.record("counts");
        self.inner.counts().await
    }
}

/// Vector store wrapper recording searched namespaces, with switchable write failure
pub struct RecordingVector {
    inner: SqliteVectorStore,
    pub searches: Mutex<Vec<Namespace>>,
    pub fail_upserts: AtomicBool,
}

impl RecordingVector {
    pub fn take_searches(&self) -> Vec<Namespace> {
        std::mem::take(&mut *self.searches.lock().unwrap())
    }
}

#[async_trait]
impl VectorStore for RecordingVector {
    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    async fn upsert(&self, records: Vec<VectorRecord>) -> Result<()> {
        if self.fail_upserts.load(Ordering::SeqCst) {
            return Err(RagError::Storage("vector store connection reset".to_string()));
        }
        self.inner.upsert(records).await
    }

    async fn search(&self, namespace: Namespace, query: Vec<f32>, k: usize, min_score: f32) -> Result<Vec<VectorHit>> {
        self.searches.lock().unwrap().push(namespace);
        self.inner.search(namespace, query, k, min_score).await
    }

    async fn has_document(&self, doc_id: &str) -> Result<bool> {
        self.inner.has_document(doc_id).await
    }

    async fn count(&self, namespace: Namespace) -> Result<usize> {
        self.inner.count(namespace).await
    }
}

/// Handles kept by tests to inspect what the service did
pub struct Harness {
    pub completion: Arc<StubCompletion>,
    pub embedder: Arc<HashEmbedder>,
    pub graph: Arc<RecordingGraph>,
    pub vector: Arc<RecordingVector>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_embedder(HashEmbedder::new(DIM)).await
    }

    pub async fn with_embedder(embedder: HashEmbedder) -> Self {
        let graph_db = Db::open(StoreLocation::Memory).await.unwrap();
        let vector_db = Db::open(StoreLocation::Memory).await.unwrap();
        Self {
            completion: Arc::new(StubCompletion::default()),
            embedder: Arc::new(embedder),
            graph: Arc::new(RecordingGraph {
                inner: SqliteGraphStore::connect(graph_db).await.unwrap(),
                calls: Mutex::new(Vec::new()),
            }),
            vector: Arc::new(RecordingVector {
                inner: SqliteVectorStore::connect(vector_db, DIM).await.unwrap(),
                searches: Mutex::new(Vec::new()),
                fail_upserts: AtomicBool::new(false),
            }),
        }
    }

    pub fn backends(&self) -> Backends {
        Backends {
            completion: self.completion.clone(),
            embedder: self.embedder.clone(),
            graph: self.graph.clone(),
            vector: self.vector.clone(),
            parser: Arc::new(ParserRegistry::new().with_vision(self.completion.clone())),
        }
    }

    pub fn clear_calls(&self) {
        self.graph.take_calls();
        self.vector.take_searches();
    }
}

/// A configuration that passes validation, rooted in `working_dir`
pub fn test_config(working_dir: &Path) -> Config {
    let mut config = Config::default();
    config.rag.working_dir = working_dir.to_path_buf();
    config.rag.api_key = "test-key".to_string();
    config.rag.embedding_dim = DIM;
    config.graph.uri = "sqlite::memory:".to_string();
    config.graph.password = "secret".to_string();
    config.vector.uri = "sqlite::memory:".to_string();
    config.query.min_score = 0.1;
    config
}
