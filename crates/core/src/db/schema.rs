//! Database schema definitions and migration runner.
//!
//! Migrations are simple SQL strings applied in order. The `schema_version`
//! user-version pragma tracks which migrations have already been applied.

use rusqlite::Connection;
use tracing::{debug, info};

use crate::errors::DatabaseError;

/// All migrations, in order. Each entry is `(version, description, sql)`.
/// Versions start at 1. The current schema version is stored in the SQLite
/// `user_version` pragma.
static MIGRATIONS: &[(u32, &str, &str)] = &[
    (
        1,
        "initial schema",
        r#"
        CREATE TABLE IF NOT EXISTS workspaces (
            work_unit_id   TEXT    PRIMARY KEY,
            repo_path      TEXT    NOT NULL,
            branch_name    TEXT    NOT NULL,
            worktree_path  TEXT    NOT NULL,
            base_branch    TEXT    NOT NULL,
            create_branch  INTEGER NOT NULL DEFAULT 1,
            base_commit    TEXT,
            created_at     TEXT    NOT NULL,
            updated_at     TEXT    NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_workspaces_repo_path ON workspaces (repo_path);

        CREATE TABLE IF NOT EXISTS sync_history (
            id                   INTEGER PRIMARY KEY AUTOINCREMENT,
            work_unit_id         TEXT    NOT NULL,
            strategy             TEXT    NOT NULL CHECK (strategy IN ('squash', 'preserve', 'stage')),
            state                TEXT    NOT NULL CHECK (state IN ('succeeded', 'failed_with_conflicts', 'failed', 'rolled_back')),
            success              INTEGER NOT NULL,
            final_commit         TEXT,
            files_changed        INTEGER NOT NULL DEFAULT 0,
            has_conflicts        INTEGER NOT NULL DEFAULT 0,
            files_with_conflicts TEXT    NOT NULL DEFAULT '[]',
            error                TEXT,
            snapshot             TEXT,
            result_json          TEXT    NOT NULL,
            recorded_at          TEXT    NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_sync_history_work_unit ON sync_history (work_unit_id);
        CREATE INDEX IF NOT EXISTS idx_sync_history_state ON sync_history (state);
        "#,
    ),
];

/// Run all pending migrations against `conn`.
pub fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    let current_version = get_schema_version(conn)?;
    info!(
        current_version,
        target_version = MIGRATIONS.last().map(|m| m.0).unwrap_or(0),
        "checking database migrations"
    );

    for &(version, description, sql) in MIGRATIONS {
        if version > current_version {
            info!(version, description, "applying migration");
            conn.execute_batch(sql)
                .map_err(|e| DatabaseError::MigrationFailed {
                    version,
                    detail: e.to_string(),
                })?;
            set_schema_version(conn, version)?;
            debug!(version, "migration applied successfully");
        }
    }

    Ok(())
}

/// Read the current schema version from the SQLite `user_version` pragma.
fn get_schema_version(conn: &Connection) -> Result<u32, DatabaseError> {
    let version: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    Ok(version)
}

/// Set the schema version via the SQLite `user_version` pragma.
fn set_schema_version(conn: &Connection, version: u32) -> Result<(), DatabaseError> {
    conn.pragma_update(None, "user_version", version)?;
    Ok(())
}
