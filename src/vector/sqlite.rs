//! SQLite-backed vector store (full-scan cosine similarity).

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::params;

use super::{cosine_similarity, Namespace, VectorHit, VectorRecord, VectorStore};
use crate::db::migrate::{self, Migration};
use crate::db::Db;
use crate::error::{RagError, Result};

const VECTOR_MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    name: "vector_001_vector_tables",
    sql: include_str!("../../migrations/vector/001_vector_tables.sql"),
}];

/// Vector store persisted in SQLite as little-endian f32 BLOBs
#[derive(Clone)]
pub struct SqliteVectorStore {
    db: Db,
    dimension: usize,
}

impl SqliteVectorStore {
    /// Bind to an open database and apply pending vector migrations
    pub async fn connect(db: Db, dimension: usize) -> Result<Self> {
        db.with_connection(|conn| migrate::run_migrations(conn, VECTOR_MIGRATIONS))
            .await?;

        // A store written with another dimension cannot serve this configuration
        let stored: Option<i64> = db
            .with_connection(|conn| {
                Ok(conn
                    .query_row("SELECT dimension FROM vector_records LIMIT 1", [], |r| r.get(0))
                    .ok())
            })
            .await?;
        if let Some(stored) = stored {
            if stored as usize != dimension {
                return Err(RagError::Configuration(format!(
                    "Vector store holds {}-dimensional embeddings but EMBEDDING_DIM is {}",
                    stored, dimension
                )));
            }
        }

        Ok(Self { db, dimension })
    }
}

fn encode_embedding(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

/// Parse embedding BLOB (little-endian f32 array); None if the length is not a multiple of 4
fn decode_embedding(blob: &[u8]) -> Option<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return None;
    }
    blob.chunks(4)
        .map(|bytes| {
            let arr: [u8; 4] = bytes.try_into().ok()?;
            Some(f32::from_le_bytes(arr))
        })
        .collect()
}

#[async_trait]
impl VectorStore for SqliteVectorStore {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn upsert(&self, records: Vec<VectorRecord>) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        if let Some(bad) = records.iter().find(|r| r.embedding.len() != self.dimension) {
            return Err(RagError::Embedding(format!(
                "Refusing to store {} '{}': dimension {} != {}",
                bad.namespace.as_str(),
                bad.id,
                bad.embedding.len(),
                self.dimension
            )));
        }

        self.db
            .with_connection(move |conn| {
                let now = Utc::now().to_rfc3339();
                let tx = conn.transaction()?;
                {
                    let mut stmt = tx.prepare(
                        r#"
                        INSERT INTO vector_records (
                            namespace, record_id, doc_id, content, embedding, dimension, metadata, updated_at
                        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                        ON CONFLICT(namespace, record_id) DO UPDATE SET
                            doc_id = excluded.doc_id,
                            content = excluded.content,
                            embedding = excluded.embedding,
                            dimension = excluded.dimension,
                            metadata = excluded.metadata,
                            updated_at = excluded.updated_at
                        "#,
                    )?;
                    for record in &records {
                        stmt.execute(params![
                            record.namespace.as_str(),
                            record.id,
                            record.doc_id,
                            record.content,
                            encode_embedding(&record.embedding),
                            record.embedding.len() as i64,
                            record.metadata.to_string(),
                            now,
                        ])?;
                    }
                }
                tx.commit()?;
                Ok(())
            })
            .await
    }

    async fn search(
        &self,
        namespace: Namespace,
        query: Vec<f32>,
        k: usize,
        min_score: f32,
    ) -> Result<Vec<VectorHit>> {
        if query.len() != self.dimension {
            return Err(RagError::Embedding(format!(
                "Query embedding has dimension {}, expected {}",
                query.len(),
                self.dimension
            )));
        }

        let rows = self
            .db
            .with_connection(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT record_id, doc_id, content, embedding, metadata \
                     FROM vector_records WHERE namespace = ?1",
                )?;
                let mut rows = stmt.query(params![namespace.as_str()])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Vec<u8>>(3)?,
                        row.get::<_, String>(4)?,
                    ));
                }
                Ok(out)
            })
            .await?;

        let mut hits: Vec<VectorHit> = rows
            .into_iter()
            .filter_map(|(id, doc_id, content, blob, metadata)| {
                let embedding = decode_embedding(&blob)?;
                let score = cosine_similarity(&query, &embedding);
                (score >= min_score).then(|| VectorHit {
                    id,
                    doc_id,
                    content,
                    metadata: serde_json::from_str(&metadata).unwrap_or_default(),
                    score,
                })
            })
            .collect();

        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(k);
        Ok(hits)
    }

    async fn has_document(&self, doc_id: &str) -> Result<bool> {
        let doc_id = doc_id.to_string();
        self.db
            .with_connection(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT 1 FROM vector_records WHERE namespace = 'chunks' AND doc_id = ?1 LIMIT 1",
                )?;
                Ok(stmt.exists(params![doc_id])?)
            })
            .await
    }

    async fn count(&self, namespace: Namespace) -> Result<usize> {
        self.db
            .with_connection(move |conn| {
                let n: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM vector_records WHERE namespace = ?1",
                    params![namespace.as_str()],
                    |r| r.get(0),
                )?;
                Ok(n as usize)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::StoreLocation;
    use serde_json::json;
    use tempfile::TempDir;

    async fn store(dimension: usize) -> SqliteVectorStore {
        let db = Db::open(StoreLocation::Memory).await.unwrap();
        SqliteVectorStore::connect(db, dimension).await.unwrap()
    }

    fn record(id: &str, doc: &str, embedding: Vec<f32>) -> VectorRecord {
        VectorRecord {
            namespace: Namespace::Chunks,
            id: id.to_string(),
            doc_id: Some(doc.to_string()),
            content: format!("content of {}", id),
            embedding,
            metadata: json!({"chunk_index": 0}),
        }
    }

    #[tokio::test]
    async fn test_upsert_and_search_ranked() {
        let store = store(3).await;
        store
            .upsert(vec![
                record("c1", "d1", vec![1.0, 0.0, 0.0]),
                record("c2", "d1", vec![0.7, 0.7, 0.0]),
                record("c3", "d2", vec![0.0, 0.0, 1.0]),
            ])
            .await
            .unwrap();

        let hits = store.search(Namespace::Chunks, vec![1.0, 0.0, 0.0], 2, 0.1).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, "c1");
        assert_eq!(hits[1].id, "c2");
        assert_eq!(hits[0].metadata["chunk_index"], 0);

        let none = store.search(Namespace::Entities, vec![1.0, 0.0, 0.0], 5, 0.0).await.unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let store = store(2).await;
        store.upsert(vec![record("c1", "d1", vec![1.0, 0.0])]).await.unwrap();
        store.upsert(vec![record("c1", "d1", vec![0.0, 1.0])]).await.unwrap();
        assert_eq!(store.count(Namespace::Chunks).await.unwrap(), 1);
        assert!(store.has_document("d1").await.unwrap());
        assert!(!store.has_document("d2").await.unwrap());
    }

    #[tokio::test]
    async fn test_dimension_mismatch_rejected_without_partial_write() {
        let store = store(3).await;
        let err = store
            .upsert(vec![record("ok", "d1", vec![1.0, 0.0, 0.0]), record("bad", "d1", vec![1.0])])
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::Embedding(_)));
        assert!(err.to_string().contains("bad"));
        assert_eq!(store.count(Namespace::Chunks).await.unwrap(), 0);

        let err = store.search(Namespace::Chunks, vec![1.0], 1, 0.0).await.unwrap_err();
        assert!(matches!(err, RagError::Embedding(_)));
    }

    #[tokio::test]
    async fn test_reopen_with_other_dimension_fails() {
        let temp_dir = TempDir::new().unwrap();
        let location = StoreLocation::File(temp_dir.path().join("vectors.db"));
        {
            let db = Db::open(location.clone()).await.unwrap();
            let store = SqliteVectorStore::connect(db, 2).await.unwrap();
            store.upsert(vec![record("c1", "d1", vec![1.0, 0.0])]).await.unwrap();
        }
        let db = Db::open(location).await.unwrap();
        let err = SqliteVectorStore::connect(db, 4).await.err().unwrap();
        assert!(matches!(err, RagError::Configuration(_)));
    }

    #[test]
    fn test_embedding_blob_roundtrip() {
        let floats: Vec<f32> = (0..1536).map(|i| i as f32 * 0.001).collect();
        let parsed = decode_embedding(&encode_embedding(&floats)).unwrap();
        assert_eq!(parsed, floats);
        assert!(decode_embedding(&[0u8, 1, 2, 3, 4]).is_none());
    }
}
