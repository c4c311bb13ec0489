//! SQLite-backed graph store with BFS neighbourhood traversal.

use std::collections::{HashSet, VecDeque};

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{Entity, GraphCounts, GraphStore, Relation, Subgraph};
use crate::db::migrate::{self, Migration};
use crate::db::Db;
use crate::error::{RagError, Result};

const GRAPH_MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    name: "graph_001_graph_tables",
    sql: include_str!("../../migrations/graph/001_graph_tables.sql"),
}];

const ENTITY_COLUMNS: &str = "entity_key, name, entity_type, descriptions, source_ids";
const RELATION_COLUMNS: &str =
    "relation_id, source_key, target_key, descriptions, keywords, weight, source_ids";

/// Graph store persisted in SQLite.
///
/// Merges happen inside one transaction per upsert call; the shared
/// connection serialises concurrent writers.
#[derive(Clone)]
pub struct SqliteGraphStore {
    db: Db,
}

impl SqliteGraphStore {
    /// Bind to an open database and apply pending graph migrations
    pub async fn connect(db: Db) -> Result<Self> {
        db.with_connection(|conn| migrate::run_migrations(conn, GRAPH_MIGRATIONS))
            .await?;
        Ok(Self { db })
    }
}

fn json_list(raw: String) -> Vec<String> {
    serde_json::from_str(&raw).unwrap_or_default()
}

fn to_json(values: &[String]) -> String {
    serde_json::to_string(values).unwrap_or_else(|_| "[]".to_string())
}

fn entity_from_row(row: &Row) -> rusqlite::Result<Entity> {
    Ok(Entity {
        key: row.get(0)?,
        name: row.get(1)?,
        entity_type: row.get(2)?,
        descriptions: json_list(row.get(3)?),
        source_ids: json_list(row.get(4)?),
    })
}

fn relation_from_row(row: &Row) -> rusqlite::Result<Relation> {
    Ok(Relation {
        relation_id: row.get(0)?,
        source_key: row.get(1)?,
        target_key: row.get(2)?,
        descriptions: json_list(row.get(3)?),
        keywords: json_list(row.get(4)?),
        weight: row.get::<_, f64>(5)? as f32,
        source_ids: json_list(row.get(6)?),
    })
}

fn load_entity(conn: &Connection, key: &str) -> Result<Option<Entity>> {
    let sql = format!("SELECT {} FROM graph_entities WHERE entity_key = ?1", ENTITY_COLUMNS);
    Ok(conn.query_row(&sql, params![key], entity_from_row).optional()?)
}

fn load_relation(conn: &Connection, relation_id: &str) -> Result<Option<Relation>> {
    let sql = format!("SELECT {} FROM graph_relations WHERE relation_id = ?1", RELATION_COLUMNS);
    Ok(conn.query_row(&sql, params![relation_id], relation_from_row).optional()?)
}

fn upsert_entity(conn: &Connection, entity: &Entity, now: &str) -> Result<()> {
    let merged = match load_entity(conn, &entity.key)? {
        Some(mut existing) => {
            existing.merge(entity);
            existing
        }
        None => entity.clone(),
    };

    conn.execute(
        r#"
        INSERT INTO graph_entities (entity_key, name, entity_type, descriptions, source_ids, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        ON CONFLICT(entity_key) DO UPDATE SET
            name = excluded.name,
            entity_type = excluded.entity_type,
            descriptions = excluded.descriptions,
            source_ids = excluded.source_ids,
            updated_at = excluded.updated_at
        "#,
        params![
            merged.key,
            merged.name,
            merged.entity_type,
            to_json(&merged.descriptions),
            to_json(&merged.source_ids),
            now,
        ],
    )?;
    Ok(())
}

fn upsert_relation(conn: &Connection, relation: &Relation, now: &str) -> Result<()> {
    for key in [&relation.source_key, &relation.target_key] {
        conn.execute(
            "INSERT OR IGNORE INTO graph_entities (entity_key, name, entity_type, updated_at) \
             VALUES (?1, ?1, 'unknown', ?2)",
            params![key, now],
        )?;
    }

    let merged = match load_relation(conn, &relation.relation_id)? {
        Some(mut existing) => {
            existing.merge(relation);
            existing
        }
        None => relation.clone(),
    };

    conn.execute(
        r#"
        INSERT INTO graph_relations (
            relation_id, source_key, target_key, descriptions, keywords, weight, source_ids, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        ON CONFLICT(relation_id) DO UPDATE SET
            descriptions = excluded.descriptions,
            keywords = excluded.keywords,
            weight = excluded.weight,
            source_ids = excluded.source_ids,
            updated_at = excluded.updated_at
        "#,
        params![
            merged.relation_id,
            merged.source_key,
            merged.target_key,
            to_json(&merged.descriptions),
            to_json(&merged.keywords),
            merged.weight as f64,
            to_json(&merged.source_ids),
            now,
        ],
    )?;
    Ok(())
}

fn relations_touching(conn: &Connection, key: &str) -> Result<Vec<Relation>> {
    let sql = format!(
        "SELECT {} FROM graph_relations WHERE source_key = ?1 OR target_key = ?1 ORDER BY weight DESC",
        RELATION_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![key], relation_from_row)?
        .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()?;
    Ok(rows)
}

/// Whether `key` occurs in `text` as whole words
fn mentions(text: &str, key: &str) -> bool {
    text.match_indices(key).any(|(start, m)| {
        let before = text[..start].chars().next_back();
        let after = text[start + m.len()..].chars().next();
        !before.is_some_and(char::is_alphanumeric) && !after.is_some_and(char::is_alphanumeric)
    })
}

#[async_trait]
impl GraphStore for SqliteGraphStore {
    async fn upsert_entities(&self, entities: Vec<Entity>) -> Result<()> {
        if entities.is_empty() {
            return Ok(());
        }
        self.db
            .with_connection(move |conn| {
                let now = Utc::now().to_rfc3339();
                let tx = conn.transaction()?;
                for entity in &entities {
                    upsert_entity(&tx, entity, &now)?;
                }
                tx.commit()?;
                Ok(())
            })
            .await
    }

    async fn upsert_relations(&self, relations: Vec<Relation>) -> Result<()> {
        if relations.is_empty() {
            return Ok(());
        }
        self.db
            .with_connection(move |conn| {
                let now = Utc::now().to_rfc3339();
                let tx = conn.transaction()?;
                for relation in &relations {
                    upsert_relation(&tx, relation, &now)?;
                }
                tx.commit()?;
                Ok(())
            })
            .await
    }

    async fn get_entities(&self, keys: Vec<String>) -> Result<Vec<Entity>> {
        self.db
            .with_connection(move |conn| {
                let mut found = Vec::with_capacity(keys.len());
                for key in &keys {
                    if let Some(entity) = load_entity(conn, key)? {
                        found.push(entity);
                    }
                }
                Ok(found)
            })
            .await
    }

    async fn match_entities(&self, text: &str, limit: usize) -> Result<Vec<Entity>> {
        let lowered = text.to_lowercase();
        self.db
            .with_connection(move |conn| {
                let sql = format!(
                    "SELECT {} FROM graph_entities \
                     WHERE length(entity_key) >= 2 AND instr(?1, entity_key) > 0 \
                     ORDER BY length(entity_key) DESC, entity_key",
                    ENTITY_COLUMNS
                );
                let mut stmt = conn.prepare(&sql)?;
                let candidates = stmt
                    .query_map(params![lowered], entity_from_row)?
                    .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()?;
                Ok(candidates
                    .into_iter()
                    .filter(|e| mentions(&lowered, &e.key))
                    .take(limit)
                    .collect())
            })
            .await
    }

    async fn neighborhood(&self, keys: Vec<String>, depth: usize) -> Result<Subgraph> {
        self.db
            .with_connection(move |conn| {
                let mut visited = HashSet::new();
                let mut order = Vec::new();
                let mut queue = VecDeque::new();
                let mut seen_relations = HashSet::new();
                let mut relations = Vec::new();

                for key in keys {
                    if load_entity(conn, &key)?.is_some() && visited.insert(key.clone()) {
                        order.push(key.clone());
                        queue.push_back((key, 0));
                    }
                }

                while let Some((key, hops)) = queue.pop_front() {
                    if hops >= depth {
                        continue;
                    }
                    for rel in relations_touching(conn, &key)? {
                        let other = if rel.source_key == key {
                            rel.target_key.clone()
                        } else {
                            rel.source_key.clone()
                        };
                        if visited.insert(other.clone()) {
                            order.push(other.clone());
                            queue.push_back((other, hops + 1));
                        }
                        if seen_relations.insert(rel.relation_id.clone()) {
                            relations.push(rel);
                        }
                    }
                }

                let mut entities = Vec::with_capacity(order.len());
                for key in &order {
                    if let Some(entity) = load_entity(conn, key)? {
                        entities.push(entity);
                    }
                }
                Ok(Subgraph { entities, relations })
            })
            .await
    }

    async fn relations_between(&self, keys: Vec<String>) -> Result<Vec<Relation>> {
        self.db
            .with_connection(move |conn| {
                let wanted: HashSet<&str> = keys.iter().map(String::as_str).collect();
                let mut seen = HashSet::new();
                let mut out = Vec::new();
                for key in &keys {
                    for rel in relations_touching(conn, key)? {
                        if wanted.contains(rel.source_key.as_str())
                            && wanted.contains(rel.target_key.as_str())
                            && seen.insert(rel.relation_id.clone())
                        {
                            out.push(rel);
                        }
                    }
                }
                out.sort_by(|a, b| b.weight.partial_cmp(&a.weight).unwrap_or(std::cmp::Ordering::Equal));
                Ok(out)
            })
            .await
    }

    async fn top_entities(&self, limit: usize) -> Result<Vec<(Entity, usize)>> {
        self.db
            .with_connection(move |conn| {
                let sql = format!(
                    "SELECT {}, \
                       (SELECT COUNT(*) FROM graph_relations r \
                        WHERE r.source_key = e.entity_key OR r.target_key = e.entity_key) AS degree \
                     FROM graph_entities e \
                     ORDER BY degree DESC, e.entity_key \
                     LIMIT ?1",
                    ENTITY_COLUMNS
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(params![i64::try_from(limit).unwrap_or(i64::MAX)], |row| {
                        Ok((entity_from_row(row)?, row.get::<_, i64>(5)? as usize))
                    })?
                    .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()?;
                Ok(rows)
            })
            .await
    }

    async fn counts(&self) -> Result<GraphCounts> {
        self.db
            .with_connection(|conn| {
                let entities: i64 = conn.query_row("SELECT COUNT(*) FROM graph_entities", [], |r| r.get(0))?;
                let relations: i64 = conn.query_row("SELECT COUNT(*) FROM graph_relations", [], |r| r.get(0))?;
                Ok(GraphCounts {
                    entities: entities as usize,
                    relations: relations as usize,
                })
            })
            .await
            .map_err(|e| match e {
                RagError::Database(err) => RagError::Storage(format!("Graph store unavailable: {}", err)),
                other => other,
            })
    }
}
