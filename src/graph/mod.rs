//! Knowledge graph: entity/relation types, merge policy and the store interface.
//!
//! Entities are keyed by their normalised name, so the same entity extracted
//! from different chunks or documents collapses into one node whose
//! descriptions and source ids are unioned.

mod extraction;
mod sqlite;

pub use extraction::{build_extraction_prompt, parse_extraction, Extraction, EXTRACTION_SYSTEM_PROMPT};
pub use sqlite::SqliteGraphStore;

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A node in the knowledge graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Normalised name, unique per graph.
    pub key: String,
    /// Display name as first extracted.
    pub name: String,
    pub entity_type: String,
    pub descriptions: Vec<String>,
    /// Chunk ids the entity was extracted from.
    pub source_ids: Vec<String>,
}

impl Entity {
    pub fn new(name: &str, entity_type: &str, description: &str, source_id: &str) -> Self {
        let mut entity = Self {
            key: entity_key(name),
            name: name.trim().to_string(),
            entity_type: normalise_type(entity_type),
            descriptions: Vec::new(),
            source_ids: Vec::new(),
        };
        push_unique(&mut entity.descriptions, description);
        push_unique(&mut entity.source_ids, source_id);
        entity
    }

    /// Union attributes of another extraction of the same entity into this one.
    pub fn merge(&mut self, other: &Entity) {
        // Placeholders created from relation endpoints carry the key as name
        if self.entity_type == "unknown" && self.name == self.key {
            self.name = other.name.clone();
        }
        if self.entity_type == "unknown" && other.entity_type != "unknown" {
            self.entity_type = other.entity_type.clone();
        }
        for d in &other.descriptions {
            push_unique(&mut self.descriptions, d);
        }
        for s in &other.source_ids {
            push_unique(&mut self.source_ids, s);
        }
    }

    pub fn description(&self) -> String {
        self.descriptions.join(" ")
    }

    /// Text used for the entity's vector in the `entities` namespace
    pub fn embedding_text(&self) -> String {
        format!("{}\n{}", self.name, self.description())
    }
}

/// A directed edge `source --description--> target`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relation {
    /// Deterministic id derived from the endpoint keys.
    pub relation_id: String,
    pub source_key: String,
    pub target_key: String,
    pub descriptions: Vec<String>,
    pub keywords: Vec<String>,
    pub weight: f32,
    pub source_ids: Vec<String>,
}

impl Relation {
    pub fn new(
        source: &str,
        target: &str,
        description: &str,
        keywords: &[String],
        weight: f32,
        source_id: &str,
    ) -> Self {
        let source_key = entity_key(source);
        let target_key = entity_key(target);
        let mut relation = Self {
            relation_id: relation_id(&source_key, &target_key),
            source_key,
            target_key,
            descriptions: Vec::new(),
            keywords: Vec::new(),
            weight: if weight.is_finite() && weight > 0.0 { weight } else { 1.0 },
            source_ids: Vec::new(),
        };
        push_unique(&mut relation.descriptions, description);
        for k in keywords {
            push_unique(&mut relation.keywords, k);
        }
        push_unique(&mut relation.source_ids, source_id);
        relation
    }

    /// Union attributes; weight keeps the maximum so re-ingestion is stable.
    pub fn merge(&mut self, other: &Relation) {
        for d in &other.descriptions {
            push_unique(&mut self.descriptions, d);
        }
        for k in &other.keywords {
            push_unique(&mut self.keywords, k);
        }
        for s in &other.source_ids {
            push_unique(&mut self.source_ids, s);
        }
        self.weight = self.weight.max(other.weight);
    }

    pub fn description(&self) -> String {
        self.descriptions.join(" ")
    }

    /// Text used for the relation's vector in the `relations` namespace
    pub fn embedding_text(&self) -> String {
        format!(
            "{} -> {}\n{}\n{}",
            self.source_key,
            self.target_key,
            self.keywords.join(", "),
            self.description()
        )
    }
}

/// Entities and the relations connecting them
#[derive(Debug, Clone, Default)]
pub struct Subgraph {
    pub entities: Vec<Entity>,
    pub relations: Vec<Relation>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GraphCounts {
    pub entities: usize,
    pub relations: usize,
}

/// Persistent entity/relation graph.
///
/// Implementations must be safe for concurrent use and merge upserts by key
/// (entity name, relation endpoints) rather than duplicating them.
#[async_trait]
pub trait GraphStore: Send + Sync {
    async fn upsert_entities(&self, entities: Vec<Entity>) -> Result<()>;

    /// Upsert relations; missing endpoint entities are created as placeholders.
    async fn upsert_relations(&self, relations: Vec<Relation>) -> Result<()>;

    async fn get_entities(&self, keys: Vec<String>) -> Result<Vec<Entity>>;

    /// Entities whose names are mentioned in `text`
    async fn match_entities(&self, text: &str, limit: usize) -> Result<Vec<Entity>>;

    /// Entities within `depth` hops of `keys` (edges followed in both directions)
    async fn neighborhood(&self, keys: Vec<String>, depth: usize) -> Result<Subgraph>;

    /// Relations whose endpoints are both among `keys`, heaviest first
    async fn relations_between(&self, keys: Vec<String>) -> Result<Vec<Relation>>;

    /// Most connected entities with their degree
    async fn top_entities(&self, limit: usize) -> Result<Vec<(Entity, usize)>>;

    async fn counts(&self) -> Result<GraphCounts>;
}

/// Normalise an entity name into its graph key
pub fn entity_key(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .trim_matches(|c: char| c == '"' || c == '\'')
        .to_lowercase()
}

fn relation_id(source_key: &str, target_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source_key.as_bytes());
    hasher.update([0u8]);
    hasher.update(target_key.as_bytes());
    format!("rel-{:x}", hasher.finalize())
}

fn normalise_type(entity_type: &str) -> String {
    let t = entity_type.trim().to_lowercase();
    if t.is_empty() { "unknown".to_string() } else { t }
}

fn push_unique(values: &mut Vec<String>, value: &str) {
    let value = value.trim();
    if !value.is_empty() && !values.iter().any(|v| v == value) {
        values.push(value.to_string());
    }
}
