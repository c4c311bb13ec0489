use thiserror::Error;

/// Main error type for RAGServe
#[derive(Error, Debug)]
pub enum RagError {
    /// Missing or invalid required setting (fatal to initialization)
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Operation attempted before the system reached the ready state
    #[error("RAG system not initialized")]
    NotReady,

    /// Malformed request payload
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Retrieval mode outside naive/local/global/hybrid
    #[error("Invalid query mode '{0}': expected one of naive, local, global, hybrid")]
    InvalidMode(String),

    /// Completion provider output could not be turned into entities/relations
    #[error("Extraction error: {0}")]
    Extraction(String),

    /// Embedding API errors and dimension mismatches
    #[error("Embedding error: {0}")]
    Embedding(String),

    /// Graph or vector store write/read failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Graph write committed but the vector write failed; re-ingest to repair
    #[error("Partial write for document {doc_id}: graph updated but vector store failed: {message}")]
    PartialWrite { doc_id: String, message: String },

    /// Nothing retrievable for the query
    #[error("Retrieval error: {0}")]
    Retrieval(String),

    /// Completion provider call failed or timed out
    #[error("Completion error: {0}")]
    Completion(String),

    /// Uploaded document could not be parsed
    #[error("Parse error: {0}")]
    Parse(String),

    /// File system I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// SQLite errors surfaced by the bundled stores
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
}

impl RagError {
    /// Whether the caller may retry the same request later and expect success.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RagError::NotReady | RagError::PartialWrite { .. })
    }
}

/// Convenient Result type using RagError
pub type Result<T> = std::result::Result<T, RagError>;
