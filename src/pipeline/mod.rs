//! Ingestion and query orchestration over the graph and vector stores.

pub mod chunker;
mod ingest;
mod query;

pub use chunker::{chunk_document, estimate_tokens, Chunk};
pub use ingest::{Document, IngestReport, IngestionPipeline};
pub use query::{ContextEntry, QueryContext, QueryEngine, QueryOptions, RetrievalMode, MAX_TOP_K};
