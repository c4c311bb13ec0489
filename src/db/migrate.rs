use rusqlite::{Connection, params};
use crate::error::{Result, RagError};

/// An embedded schema migration.
///
/// Names are global across stores so a graph and vector store may share one file.
pub struct Migration {
    pub version: u32,
    pub name: &'static str,
    pub sql: &'static str,
}

/// Create schema_migrations table if it doesn't exist
fn ensure_migrations_table(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            name TEXT PRIMARY KEY,
            version INTEGER NOT NULL,
            applied_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;
    Ok(())
}

/// Get list of applied migrations
pub fn get_applied_migrations(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT name FROM schema_migrations ORDER BY version, name")?;
    let names: Vec<String> = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()
        .map_err(RagError::Database)?;
    Ok(names)
}

/// Run all pending migrations of one store, in version order
pub fn run_migrations(conn: &mut Connection, migrations: &[Migration]) -> Result<()> {
    ensure_migrations_table(conn)?;

    let applied = get_applied_migrations(conn)?;
    let mut pending: Vec<&Migration> = migrations
        .iter()
        .filter(|m| !applied.iter().any(|a| a == m.name))
        .collect();
    pending.sort_by_key(|m| m.version);

    for migration in pending {
        log::info!("Applying migration: {} (version {})", migration.name, migration.version);

        let tx = conn.transaction()?;
        tx.execute_batch(migration.sql).map_err(|e| {
            RagError::Storage(format!("Failed to execute migration {}: {}", migration.name, e))
        })?;
        tx.execute(
            "INSERT INTO schema_migrations (name, version) VALUES (?1, ?2)",
            params![migration.name, migration.version],
        )?;
        tx.commit()?;

        log::debug!("Migration {} applied", migration.name);
    }

    Ok(())
}
