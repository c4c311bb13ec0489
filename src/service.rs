//! Service facade: initialization lifecycle plus the insert/query/upload operations.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::config::Config;
use crate::db::{Db, StoreLocation};
use crate::error::{RagError, Result};
use crate::graph::{GraphStore, SqliteGraphStore};
use crate::parser::{DocumentParser, ParserRegistry};
use crate::pipeline::{Document, IngestReport, IngestionPipeline, QueryEngine, QueryOptions, RetrievalMode};
use crate::providers::{CompletionProvider, EmbeddingCache, EmbeddingProvider, OpenAICompletion, OpenAIEmbedder};
use crate::vector::{SqliteVectorStore, VectorStore};

/// Externally visible lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemState {
    Uninitialized,
    Initializing,
    Ready,
}

/// Collaborators the pipeline runs against
#[derive(Clone)]
pub struct Backends {
    pub completion: Arc<dyn CompletionProvider>,
    pub embedder: Arc<dyn EmbeddingProvider>,
    pub graph: Arc<dyn GraphStore>,
    pub vector: Arc<dyn VectorStore>,
    pub parser: Arc<dyn DocumentParser>,
}

impl Backends {
    /// Build the HTTP providers and open both stores
    pub async fn connect(config: &Config) -> Result<Self> {
        let timeout = Duration::from_secs(config.query.request_timeout_secs);
        let rag = &config.rag;

        let completion: Arc<dyn CompletionProvider> = Arc::new(OpenAICompletion::new(
            rag.api_key.clone(),
            &rag.base_url,
            rag.llm_model.clone(),
            rag.vision_model.clone(),
            timeout,
        )?);

        let mut embedder = OpenAIEmbedder::new(
            rag.api_key.clone(),
            &rag.base_url,
            rag.embedding_model.clone(),
            rag.embedding_dim,
            rag.embedding_batch_size,
            timeout,
        )?
        .with_max_tokens(rag.max_token_size);
        if config.ingest.query_cache_capacity > 0 {
            embedder = embedder.with_cache(Arc::new(EmbeddingCache::new(config.ingest.query_cache_capacity)));
        }

        log::info!("Graph store: {}", config.graph.uri);
        let graph_db = Db::open(StoreLocation::from_uri(&config.graph.uri, &rag.working_dir)?).await?;
        let graph = SqliteGraphStore::connect(graph_db).await?;

        log::info!("Vector store: {}", config.vector_uri_for_log());
        let vector_db = Db::open(StoreLocation::from_uri(&config.vector.uri, &rag.working_dir)?).await?;
        let vector = SqliteVectorStore::connect(vector_db, rag.embedding_dim).await?;

        let parser = ParserRegistry::new().with_vision(Arc::clone(&completion));

        Ok(Self {
            completion,
            embedder: Arc::new(embedder),
            graph: Arc::new(graph),
            vector: Arc::new(vector),
            parser: Arc::new(parser),
        })
    }
}

/// Result of `insert`/`upload`
#[derive(Debug, Clone, Serialize)]
pub struct IngestReceipt {
    /// Length of the submitted content in characters
    pub content_length: usize,
    #[serde(flatten)]
    pub report: IngestReport,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadReceipt {
    pub filename: String,
    /// Uploaded size in bytes
    pub size: usize,
    #[serde(flatten)]
    pub receipt: IngestReceipt,
}

#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub answer: String,
    pub mode: RetrievalMode,
}

struct Engines {
    pipeline: IngestionPipeline,
    engine: QueryEngine,
    parser: Arc<dyn DocumentParser>,
    upload_dir: PathBuf,
}

enum Lifecycle {
    Uninitialized,
    Initializing,
    Ready(Arc<Engines>),
    /// Initialization failed; stays here until the process restarts
    Failed(String),
}

/// Application context shared by every request handler
pub struct RagService {
    config: Config,
    lifecycle: RwLock<Lifecycle>,
}

impl RagService {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            lifecycle: RwLock::new(Lifecycle::Uninitialized),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn graph_uri(&self) -> &str {
        &self.config.graph.uri
    }

    pub async fn state(&self) -> SystemState {
        match &*self.lifecycle.read().await {
            Lifecycle::Ready(_) => SystemState::Ready,
            Lifecycle::Initializing => SystemState::Initializing,
            Lifecycle::Uninitialized | Lifecycle::Failed(_) => SystemState::Uninitialized,
        }
    }

    /// Why initialization failed, if it did
    pub async fn failure(&self) -> Option<String> {
        match &*self.lifecycle.read().await {
            Lifecycle::Failed(reason) => Some(reason.clone()),
            _ => None,
        }
    }

    /// Validate configuration, connect the default backends and become ready
    pub async fn initialize(&self) -> Result<SystemState> {
        self.run_initialization(|config| async move { Backends::connect(&config).await })
            .await
    }

    /// Same lifecycle as `initialize`, with caller-supplied backends
    pub async fn initialize_with_backends(&self, backends: Backends) -> Result<SystemState> {
        self.run_initialization(|_| async move { Ok(backends) }).await
    }

    async fn run_initialization<F, Fut>(&self, connect: F) -> Result<SystemState>
    where
        F: FnOnce(Config) -> Fut,
        Fut: std::future::Future<Output = Result<Backends>>,
    {
        {
            let mut lifecycle = self.lifecycle.write().await;
            match &*lifecycle {
                Lifecycle::Ready(_) => return Ok(SystemState::Ready),
                Lifecycle::Initializing => {
                    return Err(RagError::Configuration("Initialization already in progress".to_string()))
                }
                Lifecycle::Failed(reason) => {
                    return Err(RagError::Configuration(format!(
                        "Initialization failed earlier ({}); restart the service",
                        reason
                    )))
                }
                Lifecycle::Uninitialized => {}
            }
            *lifecycle = Lifecycle::Initializing;
        }

        log::info!("Initializing RAG system");
        match self.build(connect).await {
            Ok(engines) => {
                *self.lifecycle.write().await = Lifecycle::Ready(Arc::new(engines));
                log::info!("RAG system initialized successfully");
                Ok(SystemState::Ready)
            }
            Err(e) => {
                log::error!("Failed to initialize RAG system: {}", e);
                *self.lifecycle.write().await = Lifecycle::Failed(e.to_string());
                Err(e)
            }
        }
    }

    async fn build<F, Fut>(&self, connect: F) -> Result<Engines>
    where
        F: FnOnce(Config) -> Fut,
        Fut: std::future::Future<Output = Result<Backends>>,
    {
        // Created even when the rest of the configuration turns out invalid
        let working_dir = &self.config.rag.working_dir;
        if !working_dir.as_os_str().is_empty() {
            tokio::fs::create_dir_all(working_dir).await?;
            log::info!("Working directory: {}", working_dir.display());
        }

        self.config.validate()?;

        let backends = connect(self.config.clone()).await?;
        if backends.embedder.dimension() != backends.vector.dimension() {
            return Err(RagError::Configuration(format!(
                "Embedding provider produces {}-dimensional vectors but the vector store expects {}",
                backends.embedder.dimension(),
                backends.vector.dimension()
            )));
        }

        let timeout = Duration::from_secs(self.config.query.request_timeout_secs);
        let pipeline = IngestionPipeline::new(
            Arc::clone(&backends.completion),
            Arc::clone(&backends.embedder),
            Arc::clone(&backends.graph),
            Arc::clone(&backends.vector),
            self.config.ingest.clone(),
            timeout,
        );
        let engine = QueryEngine::new(
            backends.completion,
            backends.embedder,
            backends.graph,
            backends.vector,
            self.config.query.clone(),
            timeout,
        );

        Ok(Engines {
            pipeline,
            engine,
            parser: backends.parser,
            upload_dir: self.config.upload_dir(),
        })
    }

    async fn ready(&self) -> Result<Arc<Engines>> {
        match &*self.lifecycle.read().await {
            Lifecycle::Ready(engines) => Ok(Arc::clone(engines)),
            _ => Err(RagError::NotReady),
        }
    }

    /// Ingest raw text
    pub async fn insert(&self, content: &str, description: Option<String>) -> Result<IngestReceipt> {
        let engines = self.ready().await?;
        let document = Document::new(content).with_description(description);

        match engines.pipeline.ingest(document).await {
            Ok(report) => {
                log::info!("Inserted content: {}", preview(content));
                Ok(IngestReceipt {
                    content_length: content.chars().count(),
                    report,
                })
            }
            Err(e) => {
                log::error!("Insert failed: {}", e);
                Err(e)
            }
        }
    }

    /// Answer `text` using the retrieval mode named by `mode`
    pub async fn query(&self, text: &str, mode: &str, options: QueryOptions) -> Result<Answer> {
        let engines = self.ready().await?;
        let mode: RetrievalMode = mode.parse()?;

        match engines.engine.answer(text, mode, &options).await {
            Ok(answer) => {
                log::info!("Query processed ({}): {}", mode, preview(text));
                Ok(Answer { answer, mode })
            }
            Err(e) => {
                log::error!("Query failed ({}): {}", mode, e);
                Err(e)
            }
        }
    }

    /// Persist an uploaded file under the working directory, parse it and ingest it.
    ///
    /// The file is written completely before parsing starts. It is removed
    /// after a successful ingestion and left in place on failure.
    pub async fn upload(&self, filename: &str, bytes: &[u8]) -> Result<UploadReceipt> {
        let engines = self.ready().await?;
        if bytes.is_empty() {
            return Err(RagError::InvalidInput(format!("{} is empty", filename)));
        }

        let safe_name = sanitize_filename(filename);
        tokio::fs::create_dir_all(&engines.upload_dir).await?;
        let path = engines.upload_dir.join(format!("{}-{}", Uuid::new_v4(), safe_name));
        tokio::fs::write(&path, bytes).await?;
        log::info!("Processing uploaded file {} ({} bytes)", filename, bytes.len());

        match ingest_path(&engines, &path, filename).await {
            Ok(receipt) => {
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    log::warn!("Could not remove upload {}: {}", path.display(), e);
                }
                Ok(UploadReceipt {
                    filename: filename.to_string(),
                    size: bytes.len(),
                    receipt,
                })
            }
            Err(e) => {
                log::error!("Upload of {} failed (kept at {}): {}", filename, path.display(), e);
                Err(e)
            }
        }
    }

    /// Parse and ingest a file in place
    pub async fn ingest_file(&self, path: &Path) -> Result<IngestReceipt> {
        let engines = self.ready().await?;
        let source = path.display().to_string();
        ingest_path(&engines, path, &source).await
    }
}

async fn ingest_path(engines: &Engines, path: &Path, source: &str) -> Result<IngestReceipt> {
    let parsed = engines.parser.parse(path).await?;
    let text = parsed.to_ingest_text();
    let document = Document::new(text.clone()).with_source(source);
    let report = engines.pipeline.ingest(document).await?;
    Ok(IngestReceipt {
        content_length: text.chars().count(),
        report,
    })
}

/// First 100 characters, for logs
fn preview(text: &str) -> String {
    let mut out: String = text.chars().take(100).collect();
    if text.chars().nth(100).is_some() {
        out.push_str("...");
    }
    out
}

/// Reduce a client-supplied name to a safe single path component
fn sanitize_filename(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or("");
    let cleaned: String = base
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') { c } else { '_' })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "upload".to_string()
    } else {
        cleaned.to_string()
    }
}
