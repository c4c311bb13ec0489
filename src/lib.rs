pub mod config;
pub mod error;
pub mod db;
pub mod providers;
pub mod graph;
pub mod vector;
pub mod parser;
pub mod pipeline;
pub mod service;
pub mod http;

pub use config::Config;
pub use error::{RagError, Result};
pub use pipeline::{Document, QueryOptions, RetrievalMode};
pub use service::{Answer, Backends, IngestReceipt, RagService, SystemState, UploadReceipt};
