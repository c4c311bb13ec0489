//! Document parsing for uploads.
//!
//! Text formats are parsed locally into sections; images are handed to the
//! completion provider's vision model for a textual description.

mod formats;

pub use formats::{JsonParser, MarkdownParser, PlainTextParser, YamlParser};

use crate::error::{RagError, Result};
use crate::providers::CompletionProvider;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

const IMAGE_PROMPT: &str = "Describe this image in detail for a search index. \
    Transcribe any visible text, list the entities shown and explain how they relate.";

/// A parsed document with sections
#[derive(Debug, Clone)]
pub struct ParsedDocument {
    pub content: String,
    pub sections: Vec<Section>,
    pub doc_type: String,
}

impl ParsedDocument {
    /// Flatten sections into the text handed to ingestion
    pub fn to_ingest_text(&self) -> String {
        if self.sections.is_empty() {
            return self.content.clone();
        }
        self.sections
            .iter()
            .map(|s| {
                if s.header.is_empty() || s.header == "content" {
                    s.content.clone()
                } else {
                    format!("{}\n{}", s.header, s.content)
                }
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// A section within a document
#[derive(Debug, Clone)]
pub struct Section {
    pub header: String,
    pub content: String,
}

/// Synchronous parser for one family of text formats
pub trait TextParser: Send + Sync {
    fn can_parse(&self, extension: &str) -> bool;
    fn parse(&self, content: &str, path: &str) -> Result<ParsedDocument>;
}

/// Turns a file on disk into structured text
#[async_trait]
pub trait DocumentParser: Send + Sync {
    async fn parse(&self, path: &Path) -> Result<ParsedDocument>;
}

/// Selects a parser by file extension; falls back to plain text
pub struct ParserRegistry {
    parsers: Vec<Box<dyn TextParser>>,
    vision: Option<Arc<dyn CompletionProvider>>,
}

impl ParserRegistry {
    pub fn new() -> Self {
        Self {
            parsers: vec![
                Box::new(MarkdownParser),
                Box::new(JsonParser),
                Box::new(YamlParser),
            ],
            vision: None,
        }
    }

    /// Enable image uploads through the provider's vision model
    pub fn with_vision(mut self, provider: Arc<dyn CompletionProvider>) -> Self {
        self.vision = Some(provider);
        self
    }

    /// Parse text content; a failing structured parser degrades to plain text
    pub fn parse_text(&self, content: &str, path: &str, extension: &str) -> Result<ParsedDocument> {
        let Some(parser) = self.parsers.iter().find(|p| p.can_parse(extension)) else {
            return PlainTextParser.parse(content, path);
        };
        match parser.parse(content, path) {
            Ok(doc) => Ok(doc),
            Err(e) => {
                log::warn!("Parser failed for {} ({}), falling back to plain text: {}", path, extension, e);
                PlainTextParser.parse(content, path)
            }
        }
    }

    async fn describe_image(&self, bytes: &[u8], extension: &str, path: &str) -> Result<ParsedDocument> {
        let vision = self.vision.as_ref().ok_or_else(|| {
            RagError::Parse(format!("Image uploads need a vision model: {}", path))
        })?;
        let description = vision.describe_image(IMAGE_PROMPT, image_mime(extension), bytes).await?;
        Ok(ParsedDocument {
            content: description.clone(),
            sections: vec![Section {
                header: format!("Image: {}", path),
                content: description,
            }],
            doc_type: "image".to_string(),
        })
    }
}

impl Default for ParserRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn is_image(extension: &str) -> bool {
    matches!(extension, "png" | "jpg" | "jpeg" | "gif" | "webp")
}

fn image_mime(extension: &str) -> &'static str {
    match extension {
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        _ => "image/png",
    }
}

#[async_trait]
impl DocumentParser for ParserRegistry {
    async fn parse(&self, path: &Path) -> Result<ParsedDocument> {
        let bytes = tokio::fs::read(path).await?;
        let extension = path
            .extension()
            .and_then(|s| s.to_str())
            .unwrap_or("")
            .to_lowercase();
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("upload");

        if is_image(&extension) {
            return self.describe_image(&bytes, &extension, name).await;
        }

        let content = String::from_utf8(bytes).map_err(|_| {
            RagError::Parse(format!("{} is neither UTF-8 text nor a supported image", name))
        })?;
        if content.trim().is_empty() {
            return Err(RagError::Parse(format!("{} has no text content", name)));
        }
        self.parse_text(&content, name, &extension)
    }
}
