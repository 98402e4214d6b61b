//! Schema migrations.
//!
//! The SQL files under `migrations/` are compiled in and applied in order.
//! Applied names are recorded in `_studysync_migrations`, so re-running is a
//! no-op.

use rusqlite::Connection;
use std::collections::HashSet;
use thiserror::Error;

struct Migration {
    name: &'static str,
    sql: &'static str,
}

/// Append only; names are the bookkeeping keys.
const MIGRATIONS: &[Migration] = &[
    Migration {
        name: "000_conversations",
        sql: include_str!("migrations/000_conversations.sql"),
    },
    Migration {
        name: "001_messages",
        sql: include_str!("migrations/001_messages.sql"),
    },
    Migration {
        name: "002_collab_sessions",
        sql: include_str!("migrations/002_collab_sessions.sql"),
    },
    Migration {
        name: "003_annotations",
        sql: include_str!("migrations/003_annotations.sql"),
    },
];

/// Errors raised while bringing the schema up to date.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// A migration, or the bookkeeping around it, failed and was rolled back.
    #[error("migration '{name}' failed: {source}")]
    ExecutionFailed {
        name: String,
        source: rusqlite::Error,
    },

    /// The bookkeeping table could not be read.
    #[error("failed to check migration state: {0}")]
    StateQuery(rusqlite::Error),
}

const BOOKKEEPING: &str = "_studysync_migrations";

/// Applies every migration not yet recorded and returns how many ran.
///
/// # Errors
///
/// Returns `MigrationError` on the first migration that fails; earlier ones
/// stay applied.
pub fn run_migrations(conn: &Connection) -> Result<usize, MigrationError> {
    run_migrations_from_list(conn, MIGRATIONS)
}

fn run_migrations_from_list(
    conn: &Connection,
    migrations: &[Migration],
) -> Result<usize, MigrationError> {
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {BOOKKEEPING} (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );"
    ))
    .map_err(|source| MigrationError::ExecutionFailed {
        name: BOOKKEEPING.to_string(),
        source,
    })?;

    let done = applied_names(conn).map_err(MigrationError::StateQuery)?;
    let pending: Vec<&Migration> = migrations
        .iter()
        .filter(|m| !done.contains(m.name))
        .collect();
    tracing::debug!(
        recorded = done.len(),
        pending = pending.len(),
        "checked schema migrations"
    );

    for migration in &pending {
        tracing::info!(migration = migration.name, "applying migration");
        apply(conn, migration).map_err(|source| MigrationError::ExecutionFailed {
            name: migration.name.to_string(),
            source,
        })?;
    }
    Ok(pending.len())
}

fn applied_names(conn: &Connection) -> rusqlite::Result<HashSet<String>> {
    let mut stmt = conn.prepare(&format!("SELECT name FROM {BOOKKEEPING}"))?;
    let names = stmt.query_map([], |row| row.get(0))?;
    names.collect()
}

/// Runs one migration and records it in the same transaction.
fn apply(conn: &Connection, migration: &Migration) -> rusqlite::Result<()> {
    let tx = conn.unchecked_transaction()?;
    tx.execute_batch(migration.sql)?;
    tx.execute(
        &format!("INSERT INTO {BOOKKEEPING} (name) VALUES (?1)"),
        [migration.name],
    )?;
    tx.commit()
}
