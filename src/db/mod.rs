use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::task;
use crate::error::{Result, RagError};

pub mod migrate;

/// Where a SQLite-backed store lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    Memory,
    File(PathBuf),
}

impl StoreLocation {
    /// Resolve a store URI.
    ///
    /// Accepts `sqlite://<path>`, `sqlite::memory:` or a bare path. Relative
    /// paths are resolved against `base_dir`. Other schemes (e.g. `bolt://`)
    /// are rejected so a misconfigured deployment fails at initialization.
    pub fn from_uri(uri: &str, base_dir: &Path) -> Result<Self> {
        let uri = uri.trim();
        if uri.is_empty() {
            return Err(RagError::Configuration("store URI is empty".to_string()));
        }
        if uri == "sqlite::memory:" || uri == ":memory:" {
            return Ok(StoreLocation::Memory);
        }

        let raw_path = if let Some(rest) = uri.strip_prefix("sqlite://") {
            rest.to_string()
        } else if let Some(rest) = uri.strip_prefix("sqlite:") {
            rest.to_string()
        } else {
            match url::Url::parse(uri) {
                // Single-letter schemes are Windows drive letters, not URLs
                Ok(parsed) if parsed.scheme().len() > 1 => {
                    if parsed.scheme() == "file" {
                        parsed
                            .to_file_path()
                            .map_err(|_| RagError::Configuration(format!("Invalid file URI: {}", uri)))?
                            .to_string_lossy()
                            .to_string()
                    } else {
                        return Err(RagError::Configuration(format!(
                            "Unsupported store scheme '{}' in {} (expected sqlite:// or a file path)",
                            parsed.scheme(),
                            uri
                        )));
                    }
                }
                _ => uri.to_string(),
            }
        };

        let path = PathBuf::from(raw_path);
        if path.as_os_str().is_empty() {
            return Err(RagError::Configuration(format!("Store URI has no path: {}", uri)));
        }
        let path = if path.is_absolute() { path } else { base_dir.join(path) };
        Ok(StoreLocation::File(path))
    }
}

/// Shared, long-lived SQLite connection.
///
/// Opened once at initialization and reused by every request; closures run on
/// the blocking pool so the async scheduler is never stalled by SQLite I/O.
#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

impl Db {
    /// Open (or create) the database and apply connection pragmas
    pub async fn open(location: StoreLocation) -> Result<Self> {
        let conn = task::spawn_blocking(move || open_connection(&location))
            .await
            .map_err(|e| RagError::Storage(format!("Failed to open store: {}", e)))??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Execute a closure with the connection in a blocking task
    pub async fn with_connection<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| RagError::Storage("Store connection lock poisoned".to_string()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| RagError::Storage(format!("Store task failed: {}", e)))?
    }
}

fn open_connection(location: &StoreLocation) -> Result<Connection> {
    let conn = match location {
        StoreLocation::Memory => Connection::open_in_memory()?,
        StoreLocation::File(path) => {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            Connection::open(path)?
        }
    };

    // WAL for concurrent readers, NORMAL sync for speed, foreign keys for integrity
    conn.execute_batch(
        "PRAGMA journal_mode = WAL; \
         PRAGMA synchronous = NORMAL; \
         PRAGMA foreign_keys = ON; \
         PRAGMA temp_store = MEMORY; \
         PRAGMA cache_size = -65536;"
    )?;

    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_location_from_uri() {
        let base = Path::new("/srv/rag");
        assert_eq!(
            StoreLocation::from_uri("sqlite://graph.db", base).unwrap(),
            StoreLocation::File(PathBuf::from("/srv/rag/graph.db"))
        );
        assert_eq!(
            StoreLocation::from_uri("sqlite:///var/lib/vectors.db", base).unwrap(),
            StoreLocation::File(PathBuf::from("/var/lib/vectors.db"))
        );
        assert_eq!(
            StoreLocation::from_uri("stores/v.db", base).unwrap(),
            StoreLocation::File(PathBuf::from("/srv/rag/stores/v.db"))
        );
        assert_eq!(
            StoreLocation::from_uri("sqlite::memory:", base).unwrap(),
            StoreLocation::Memory
        );
    }

    #[test]
    fn test_location_rejects_foreign_scheme() {
        let err = StoreLocation::from_uri("bolt://neo4j:7687", Path::new(".")).unwrap_err();
        assert!(matches!(err, RagError::Configuration(_)));
        assert!(err.to_string().contains("bolt"));
    }

    #[tokio::test]
    async fn test_db_connection() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("nested").join("test.db");
        let db = Db::open(StoreLocation::File(db_path.clone())).await.unwrap();

        let result = db.with_connection(|conn| {
            conn.execute("CREATE TABLE test (id INTEGER PRIMARY KEY)", [])?;
            Ok(())
        }).await;

        assert!(result.is_ok());
        assert!(db_path.exists());
    }

    #[tokio::test]
    async fn test_memory_store_persists_across_calls() {
        let db = Db::open(StoreLocation::Memory).await.unwrap();
        db.with_connection(|conn| {
            conn.execute("CREATE TABLE t (v TEXT)", [])?;
            conn.execute("INSERT INTO t (v) VALUES ('x')", [])?;
            Ok(())
        }).await.unwrap();

        let count: i64 = db
            .with_connection(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM t", [], |r| r.get(0))?))
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_pragmas_set() {
        let temp_dir = TempDir::new().unwrap();
        let db = Db::open(StoreLocation::File(temp_dir.path().join("test.db"))).await.unwrap();

        db.with_connection(|conn| {
            let journal_mode: String = conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
            assert_eq!(journal_mode.to_uppercase(), "WAL");

            let foreign_keys: i32 = conn.query_row("PRAGMA foreign_keys", [], |row| row.get(0))?;
            assert_eq!(foreign_keys, 1);

            Ok::<(), RagError>(())
        }).await.unwrap();
    }
}
