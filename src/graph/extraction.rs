//! Entity/relation extraction via the completion provider.

use regex::Regex;
use serde::Deserialize;
use std::sync::OnceLock;

use super::{entity_key, Entity, Relation};
use crate::error::{RagError, Result};

pub const EXTRACTION_SYSTEM_PROMPT: &str =
    "You extract knowledge graphs from text. Reply with a single JSON object and nothing else.";

const ENTITY_TYPES: &str = "organization, person, location, event, concept, technology, product, date";

/// Entities and relations extracted from one chunk
#[derive(Debug, Clone, Default)]
pub struct Extraction {
    pub entities: Vec<Entity>,
    pub relations: Vec<Relation>,
}

#[derive(Deserialize)]
struct RawExtraction {
    #[serde(default)]
    entities: Vec<RawEntity>,
    #[serde(default, alias = "relationships")]
    relations: Vec<RawRelation>,
}

#[derive(Deserialize)]
struct RawEntity {
    #[serde(alias = "entity_name")]
    name: String,
    #[serde(default, rename = "type", alias = "entity_type")]
    entity_type: String,
    #[serde(default)]
    description: String,
}

#[derive(Deserialize)]
struct RawRelation {
    #[serde(alias = "src_id")]
    source: String,
    #[serde(alias = "tgt_id")]
    target: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    keywords: Keywords,
    #[serde(default)]
    weight: Option<f32>,
}

/// Models return keywords either as a list or a comma-separated string
#[derive(Deserialize, Default)]
#[serde(untagged)]
enum Keywords {
    List(Vec<String>),
    Text(String),
    #[default]
    Missing,
}

impl Keywords {
    fn into_vec(self) -> Vec<String> {
        match self {
            Keywords::List(list) => list,
            Keywords::Text(text) => text.split(',').map(|s| s.trim().to_string()).collect(),
            Keywords::Missing => Vec::new(),
        }
    }
}

/// Build the extraction prompt for one chunk
pub fn build_extraction_prompt(chunk: &str, description: Option<&str>) -> String {
    let context = match description {
        Some(d) if !d.trim().is_empty() => format!("Document description: {}\n\n", d.trim()),
        _ => String::new(),
    };
    format!(
        "Identify every named entity in the text and the relationships between them.\n\
         Entity types: {types}.\n\
         Respond with JSON only, shaped as:\n\
         {{\"entities\": [{{\"name\": \"...\", \"type\": \"...\", \"description\": \"...\"}}],\n \
         \"relations\": [{{\"source\": \"...\", \"target\": \"...\", \"description\": \"...\", \"keywords\": [\"...\"], \"weight\": 1.0}}]}}\n\
         Relation endpoints must be entity names from the entities list.\n\n\
         {context}Text:\n{chunk}",
        types = ENTITY_TYPES,
        context = context,
        chunk = chunk
    )
}

fn fenced_json() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```(?:json)?\s*(\{.*\})\s*```").expect("valid fence regex"))
}

/// Pull the JSON object out of a model reply (code fences and chatter tolerated)
fn json_body(response: &str) -> Option<&str> {
    if let Some(caps) = fenced_json().captures(response) {
        return caps.get(1).map(|m| m.as_str());
    }
    let start = response.find('{')?;
    let end = response.rfind('}')?;
    (end > start).then(|| &response[start..=end])
}

/// Parse a completion reply into entities and relations tagged with `source_id`.
///
/// Entries with empty names and self-loops are dropped. Relation endpoints
/// that were not listed as entities are kept; the store creates placeholders.
pub fn parse_extraction(response: &str, source_id: &str) -> Result<Extraction> {
    let body = json_body(response).ok_or_else(|| {
        RagError::Extraction(format!("No JSON object in extraction reply for {}", source_id))
    })?;
    let raw: RawExtraction = serde_json::from_str(body).map_err(|e| {
        RagError::Extraction(format!("Malformed extraction reply for {}: {}", source_id, e))
    })?;

    let mut extraction = Extraction::default();

    for e in raw.entities {
        if entity_key(&e.name).is_empty() {
            continue;
        }
        let entity = Entity::new(&e.name, &e.entity_type, &e.description, source_id);
        match extraction.entities.iter_mut().find(|x| x.key == entity.key) {
            Some(existing) => existing.merge(&entity),
            None => extraction.entities.push(entity),
        }
    }

    for r in raw.relations {
        let (src, tgt) = (entity_key(&r.source), entity_key(&r.target));
        if src.is_empty() || tgt.is_empty() || src == tgt {
            continue;
        }
        let keywords = r.keywords.into_vec();
        let relation = Relation::new(
            &r.source,
            &r.target,
            &r.description,
            &keywords,
            r.weight.unwrap_or(1.0),
            source_id,
        );
        match extraction.relations.iter_mut().find(|x| x.relation_id == relation.relation_id) {
            Some(existing) => existing.merge(&relation),
            None => extraction.relations.push(relation),
        }
    }

    Ok(extraction)
}
