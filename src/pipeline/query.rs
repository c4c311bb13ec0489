use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::chunker::{estimate_tokens, truncate_to_tokens};
use crate::config::QueryConfig;
use crate::error::{RagError, Result};
use crate::graph::{Entity, GraphStore, Relation};
use crate::providers::{CompletionProvider, CompletionPurpose, CompletionRequest, EmbeddingProvider};
use crate::vector::{Namespace, VectorHit, VectorStore};

/// Largest `top_k` a caller may request
pub const MAX_TOP_K: usize = 1000;

/// How context is gathered for a query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetrievalMode {
    /// Chunk similarity only
    Naive,
    /// Neighbourhood of entities the query mentions, plus chunks
    Local,
    /// Relation similarity and the most connected entities
    Global,
    /// Local and global combined
    #[default]
    Hybrid,
}

impl RetrievalMode {
    pub const ALL: [RetrievalMode; 4] = [
        RetrievalMode::Naive,
        RetrievalMode::Local,
        RetrievalMode::Global,
        RetrievalMode::Hybrid,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RetrievalMode::Naive => "naive",
            RetrievalMode::Local => "local",
            RetrievalMode::Global => "global",
            RetrievalMode::Hybrid => "hybrid",
        }
    }
}

impl fmt::Display for RetrievalMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RetrievalMode {
    type Err = RagError;

    fn from_str(s: &str) -> Result<Self> {
        RetrievalMode::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| RagError::InvalidMode(s.to_string()))
    }
}

/// Per-request tuning
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueryOptions {
    /// Overrides the configured number of results per retrieval step
    pub top_k: Option<usize>,
    /// Return the assembled context instead of asking for an answer
    #[serde(default)]
    pub only_need_context: bool,
}

/// One line of retrieved context
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextEntry {
    pub id: String,
    pub text: String,
    pub score: f32,
}

/// Context gathered for a query, deduplicated by id within each section
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueryContext {
    pub entities: Vec<ContextEntry>,
    pub relations: Vec<ContextEntry>,
    pub chunks: Vec<ContextEntry>,
}

impl QueryContext {
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.relations.is_empty() && self.chunks.is_empty()
    }

    /// Append `other`, skipping entries whose id is already present
    pub fn merge(&mut self, other: QueryContext) {
        extend_unique(&mut self.entities, other.entities);
        extend_unique(&mut self.relations, other.relations);
        extend_unique(&mut self.chunks, other.chunks);
    }

    fn push_entity(&mut self, entity: &Entity, score: f32) {
        let text = format!("{} ({}): {}", entity.name, entity.entity_type, entity.description());
        extend_unique(&mut self.entities, vec![ContextEntry { id: entity.key.clone(), text, score }]);
    }

    fn push_relation(&mut self, relation: &Relation) {
        let keywords = if relation.keywords.is_empty() {
            String::new()
        } else {
            format!(" [{}]", relation.keywords.join(", "))
        };
        let text = format!(
            "{} -> {}{}: {}",
            relation.source_key,
            relation.target_key,
            keywords,
            relation.description()
        );
        extend_unique(
            &mut self.relations,
            vec![ContextEntry { id: relation.relation_id.clone(), text, score: relation.weight }],
        );
    }

    fn push_hits(section: &mut Vec<ContextEntry>, hits: Vec<VectorHit>) {
        extend_unique(
            section,
            hits.into_iter()
                .map(|h| ContextEntry { id: h.id, text: h.content, score: h.score })
                .collect(),
        );
    }

    /// Render as prompt text within `token_budget` estimated tokens.
    ///
    /// Sections are filled in order (entities, relations, chunks); an entry
    /// that does not fit is dropped, except the very first which is cut short.
    pub fn render(&self, token_budget: usize) -> String {
        let mut out = String::new();
        let mut used = 0;

        for (title, entries) in [
            ("Entities", &self.entities),
            ("Relationships", &self.relations),
            ("Sources", &self.chunks),
        ] {
            if entries.is_empty() {
                continue;
            }
            let header = format!("-----{}-----\n", title);
            if used + estimate_tokens(&header) > token_budget {
                break;
            }
            let mut section = String::new();
            let mut section_tokens = estimate_tokens(&header);
            for entry in entries {
                let line = format!("- {}\n", entry.text.trim().replace('\n', " "));
                let cost = estimate_tokens(&line);
                if used + section_tokens + cost <= token_budget {
                    section.push_str(&line);
                    section_tokens += cost;
                } else if out.is_empty() && section.is_empty() {
                    let room = token_budget.saturating_sub(used + section_tokens);
                    section.push_str(truncate_to_tokens(&line, room));
                    section_tokens = token_budget - used;
                }
            }
            if !section.is_empty() {
                out.push_str(&header);
                out.push_str(&section);
                used += section_tokens;
            }
        }
        out
    }
}

fn extend_unique(section: &mut Vec<ContextEntry>, entries: Vec<ContextEntry>) {
    let mut seen: HashSet<String> = section.iter().map(|e| e.id.clone()).collect();
    for entry in entries {
        if seen.insert(entry.id.clone()) {
            section.push(entry);
        }
    }
}

/// Store failures during retrieval read as `Retrieval`
fn store_unavailable(e: RagError) -> RagError {
    match e {
        RagError::Retrieval(_) => e,
        other => RagError::Retrieval(format!("Store unavailable: {}", other)),
    }
}

/// Mode dispatch, context assembly and answer synthesis
pub struct QueryEngine {
    completion: Arc<dyn CompletionProvider>,
    embedder: Arc<dyn EmbeddingProvider>,
    graph: Arc<dyn GraphStore>,
    vector: Arc<dyn VectorStore>,
    config: QueryConfig,
    timeout: Duration,
}

impl QueryEngine {
    pub fn new(
        completion: Arc<dyn CompletionProvider>,
        embedder: Arc<dyn EmbeddingProvider>,
        graph: Arc<dyn GraphStore>,
        vector: Arc<dyn VectorStore>,
        config: QueryConfig,
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

    /// Gather context for `query` using `mode`.
    ///
    /// Fails with `Retrieval` when both stores are empty or unreachable, or
    /// when nothing relevant is found.
    pub async fn retrieve(&self, query: &str, mode: RetrievalMode, top_k: usize) -> Result<QueryContext> {
        if query.trim().is_empty() {
            return Err(RagError::InvalidInput("query must not be empty".to_string()));
        }
        if top_k > MAX_TOP_K {
            return Err(RagError::InvalidInput(format!(
                "top_k must be at most {}, got {}",
                MAX_TOP_K, top_k
            )));
        }
        let top_k = top_k.max(1);

        let graph_counts = self.graph.counts().await.map_err(store_unavailable)?;
        let chunk_count = self.vector.count(Namespace::Chunks).await.map_err(store_unavailable)?;
        if graph_counts.entities == 0 && chunk_count == 0 {
            return Err(RagError::Retrieval(
                "Knowledge base is empty; insert content before querying".to_string(),
            ));
        }

        let embedding = tokio::time::timeout(self.timeout, self.embedder.embed_query(query))
            .await
            .map_err(|_| RagError::Embedding("Query embedding timed out".to_string()))??;

        let context = match mode {
            RetrievalMode::Naive => self.naive(&embedding, top_k).await?,
            RetrievalMode::Local => self.local(query, &embedding, top_k).await?,
            RetrievalMode::Global => self.global(&embedding, top_k).await?,
            RetrievalMode::Hybrid => {
                let mut context = self.local(query, &embedding, top_k).await?;
                context.merge(self.global(&embedding, top_k).await?);
                context
            }
        };

        log::debug!(
            "{} retrieval: {} entities, {} relations, {} chunks",
            mode,
            context.entities.len(),
            context.relations.len(),
            context.chunks.len()
        );

        if context.is_empty() {
            return Err(RagError::Retrieval(format!(
                "No relevant context found for query in {} mode",
                mode
            )));
        }
        Ok(context)
    }

    /// Retrieve context and synthesise an answer (or return the rendered context)
    pub async fn answer(&self, query: &str, mode: RetrievalMode, options: &QueryOptions) -> Result<String> {
        let top_k = options.top_k.unwrap_or(self.config.top_k);
        let context = self.retrieve(query, mode, top_k).await?;
        let rendered = context.render(self.config.max_context_tokens);

        if options.only_need_context {
            return Ok(rendered);
        }

        let system = format!(
            "You are a helpful assistant answering questions about the knowledge base below.\n\
             Use only the provided context. If the answer is not in the context, say you do not know.\n\n\
             ---Target response length and format---\n{}\n\n\
             ---Knowledge Base---\n{}",
            self.config.response_type, rendered
        );
        let request = CompletionRequest::new(CompletionPurpose::Answer, query).with_system(system);

        tokio::time::timeout(self.timeout, self.completion.complete(request))
            .await
            .map_err(|_| {
                RagError::Completion(format!("Completion timed out after {}s", self.timeout.as_secs()))
            })?
            .map_err(|e| match e {
                RagError::Completion(_) => e,
                other => RagError::Completion(other.to_string()),
            })
    }

    async fn naive(&self, embedding: &[f32], top_k: usize) -> Result<QueryContext> {
        let mut context = QueryContext::default();
        let hits = self.search(Namespace::Chunks, embedding, top_k).await?;
        QueryContext::push_hits(&mut context.chunks, hits);
        Ok(context)
    }

    async fn local(&self, query: &str, embedding: &[f32], top_k: usize) -> Result<QueryContext> {
        let mut keys: Vec<String> = self
            .graph
            .match_entities(query, top_k)
            .await
            .map_err(store_unavailable)?
            .into_iter()
            .map(|e| e.key)
            .collect();
        for hit in self.search(Namespace::Entities, embedding, top_k).await? {
            if !keys.contains(&hit.id) {
                keys.push(hit.id);
            }
        }

        let mut context = QueryContext::default();
        if !keys.is_empty() {
            let subgraph = self
                .graph
                .neighborhood(keys, self.config.graph_depth)
                .await
                .map_err(store_unavailable)?;
            for entity in subgraph.entities.iter().take(top_k.saturating_mul(2)) {
                context.push_entity(entity, 1.0);
            }
            for relation in subgraph.relations.iter().take(top_k.saturating_mul(2)) {
                context.push_relation(relation);
            }
        }

        let hits = self.search(Namespace::Chunks, embedding, top_k).await?;
        QueryContext::push_hits(&mut context.chunks, hits);
        Ok(context)
    }

    async fn global(&self, embedding: &[f32], top_k: usize) -> Result<QueryContext> {
        let mut context = QueryContext::default();

        let hits = self.search(Namespace::Relations, embedding, top_k).await?;
        QueryContext::push_hits(&mut context.relations, hits);

        let top = self.graph.top_entities(top_k).await.map_err(store_unavailable)?;
        let keys: Vec<String> = top.iter().filter(|(_, degree)| *degree > 0).map(|(e, _)| e.key.clone()).collect();
        for (entity, degree) in &top {
            if *degree > 0 {
                context.push_entity(entity, *degree as f32);
            }
        }
        for relation in self.graph.relations_between(keys).await.map_err(store_unavailable)? {
            context.push_relation(&relation);
        }
        Ok(context)
    }

    async fn search(&self, namespace: Namespace, embedding: &[f32], top_k: usize) -> Result<Vec<VectorHit>> {
        self.vector
            .search(namespace, embedding.to_vec(), top_k, self.config.min_score)
            .await
            .map_err(store_unavailable)
    }
}
