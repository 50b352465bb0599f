//! Catalog migration system.
//!
//! Tracks applied migrations in a `_migrations` table and applies
//! pending ones in order, each inside its own transaction.

use rusqlite::Connection;

use super::error::DatabaseError;

/// A single migration definition.
struct Migration {
    version: u32,
    description: &'static str,
    sql: &'static str,
}

/// All migrations in order. Each is applied at most once.
const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "create_scenes_table",
        sql: include_str!("sql/001_create_scenes.sql"),
    },
    Migration {
        version: 2,
        description: "create_analysis_jobs_tables",
        sql: include_str!("sql/002_create_analysis_jobs.sql"),
    },
    Migration {
        version: 3,
        description: "create_vector_features_table",
        sql: include_str!("sql/003_create_vector_features.sql"),
    },
];

/// Brings the catalog schema up to date. Returns how many migrations were
/// applied.
pub fn apply_pending(conn: &Connection) -> Result<usize, DatabaseError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )?;

    let schema_version: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM _migrations",
        [],
        |r| r.get(0),
    )?;
    let pending: Vec<&Migration> = MIGRATIONS
        .iter()
        .filter(|m| m.version > schema_version)
        .collect();

    for migration in &pending {
        log::info!(
            "Applying catalog migration {:03} ({})",
            migration.version,
            migration.description
        );

        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(migration.sql)
            .map_err(|e| DatabaseError::Migration {
                version: migration.version,
                reason: e.to_string(),
            })?;
        tx.execute(
            "INSERT INTO _migrations (version, description) VALUES (?1, ?2)",
            rusqlite::params![migration.version, migration.description],
        )?;
        tx.commit()?;
    }

    if pending.is_empty() {
        log::debug!("Catalog schema is at version {}", schema_version);
    }
    Ok(pending.len())
}
