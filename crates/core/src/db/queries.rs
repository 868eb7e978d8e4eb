//! Typed query helpers for the `workspaces` and `sync_history` tables.

use std::path::PathBuf;

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use tracing::debug;

use super::Database;
use crate::errors::DatabaseError;
use crate::models::{
    AttemptState, SyncHistoryEntry, SyncResult, SyncStrategy, WorkspaceDescriptor,
};
use crate::sync::DescriptorStore;

// ---------------------------------------------------------------------------
// Domain structs returned by queries
// ---------------------------------------------------------------------------

/// A row from the `workspaces` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceEntry {
    pub work_unit_id: String,
    pub descriptor: WorkspaceDescriptor,
    pub created_at: String,
    pub updated_at: String,
}

/// Raw `sync_history` columns before decoding.
struct HistoryRow {
    work_unit_id: String,
    strategy: String,
    state: String,
    result_json: String,
    recorded_at: String,
}

const WORKSPACE_COLUMNS: &str = "work_unit_id, repo_path, branch_name, worktree_path, \
     base_branch, create_branch, base_commit, created_at, updated_at";

fn workspace_from_row(row: &Row<'_>) -> rusqlite::Result<WorkspaceEntry> {
    let repo_path: String = row.get(1)?;
    let worktree_path: String = row.get(3)?;
    Ok(WorkspaceEntry {
        work_unit_id: row.get(0)?,
        descriptor: WorkspaceDescriptor {
            repo_path: PathBuf::from(repo_path),
            branch_name: row.get(2)?,
            worktree_path: PathBuf::from(worktree_path),
            base_branch: row.get(4)?,
            create_branch: row.get::<_, i64>(5)? != 0,
            base_commit: row.get(6)?,
        },
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

fn corrupt(detail: impl std::fmt::Display) -> DatabaseError {
    DatabaseError::Corrupt {
        entity: "sync_history".into(),
        detail: detail.to_string(),
    }
}

impl HistoryRow {
    fn decode(self) -> Result<SyncHistoryEntry, DatabaseError> {
        let strategy: SyncStrategy = self.strategy.parse().map_err(corrupt)?;
        let state: AttemptState = self.state.parse().map_err(corrupt)?;
        let result: SyncResult = serde_json::from_str(&self.result_json).map_err(corrupt)?;
        Ok(SyncHistoryEntry {
            work_unit_id: self.work_unit_id,
            strategy,
            state,
            result,
            recorded_at: self.recorded_at,
        })
    }
}

// ---------------------------------------------------------------------------
// Query implementations
// ---------------------------------------------------------------------------

impl Database {
    // -- workspaces ---------------------------------------------------------

    /// Insert or replace the descriptor for a work unit. `created_at` is
    /// preserved across updates.
    pub fn upsert_workspace(
        &self,
        work_unit_id: &str,
        descriptor: &WorkspaceDescriptor,
    ) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO workspaces (work_unit_id, repo_path, branch_name, worktree_path,
                 base_branch, create_branch, base_commit, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
             ON CONFLICT(work_unit_id) DO UPDATE SET
                 repo_path = excluded.repo_path,
                 branch_name = excluded.branch_name,
                 worktree_path = excluded.worktree_path,
                 base_branch = excluded.base_branch,
                 create_branch = excluded.create_branch,
                 base_commit = excluded.base_commit,
                 updated_at = excluded.updated_at",
            params![
                work_unit_id,
                descriptor.repo_path.to_string_lossy(),
                descriptor.branch_name,
                descriptor.worktree_path.to_string_lossy(),
                descriptor.base_branch,
                descriptor.create_branch as i64,
                descriptor.base_commit,
                now,
            ],
        )?;
        debug!(work_unit_id, branch = %descriptor.branch_name, "upserted workspace");
        Ok(())
    }

    /// Get the stored workspace for a work unit.
    pub fn get_workspace(&self, work_unit_id: &str) -> Result<Option<WorkspaceEntry>, DatabaseError> {
        let conn = self.conn();
        let entry = conn
            .query_row(
                &format!("SELECT {WORKSPACE_COLUMNS} FROM workspaces WHERE work_unit_id = ?1"),
                params![work_unit_id],
                workspace_from_row,
            )
            .optional()?;
        Ok(entry)
    }

    /// Like [`get_workspace`](Self::get_workspace) but a missing row is an error.
    pub fn require_workspace(&self, work_unit_id: &str) -> Result<WorkspaceEntry, DatabaseError> {
        self.get_workspace(work_unit_id)?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "workspace".into(),
                id: work_unit_id.to_string(),
            })
    }

    /// All stored workspaces, ordered by work unit.
    pub fn list_workspaces(&self) -> Result<Vec<WorkspaceEntry>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {WORKSPACE_COLUMNS} FROM workspaces ORDER BY work_unit_id"
        ))?;
        let entries = stmt
            .query_map([], workspace_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Forget a work unit. Returns whether a row was removed. History rows
    /// are kept.
    pub fn delete_workspace(&self, work_unit_id: &str) -> Result<bool, DatabaseError> {
        let conn = self.conn();
        let removed = conn.execute(
            "DELETE FROM workspaces WHERE work_unit_id = ?1",
            params![work_unit_id],
        )?;
        debug!(work_unit_id, removed, "deleted workspace");
        Ok(removed > 0)
    }

    // -- sync_history -------------------------------------------------------

    /// Append one reconciliation attempt.
    pub fn insert_sync_history(
        &self,
        work_unit_id: &str,
        strategy: SyncStrategy,
        state: AttemptState,
        result: &SyncResult,
    ) -> Result<i64, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let result_json = serde_json::to_string(result).map_err(corrupt)?;
        let conflicts_json =
            serde_json::to_string(&result.files_with_conflicts).map_err(corrupt)?;
        let conn = self.conn();
        conn.execute(
            "INSERT INTO sync_history (work_unit_id, strategy, state, success, final_commit,
                 files_changed, has_conflicts, files_with_conflicts, error, snapshot,
                 result_json, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                work_unit_id,
                strategy.to_string(),
                state.to_string(),
                result.success as i64,
                result.final_commit,
                result.files_changed as i64,
                result.has_conflicts as i64,
                conflicts_json,
                result.error,
                result.snapshot,
                result_json,
                now,
            ],
        )?;
        let id = conn.last_insert_rowid();
        debug!(id, work_unit_id, %strategy, %state, "inserted sync_history entry");
        Ok(id)
    }

    /// Recorded attempts, newest first, optionally for one work unit.
    pub fn list_sync_history(
        &self,
        work_unit_id: Option<&str>,
        limit: u32,
    ) -> Result<Vec<SyncHistoryEntry>, DatabaseError> {
        let rows: Vec<HistoryRow> = {
            let conn = self.conn();
            let map_row = |row: &Row<'_>| {
                Ok(HistoryRow {
                    work_unit_id: row.get(0)?,
                    strategy: row.get(1)?,
                    state: row.get(2)?,
                    result_json: row.get(3)?,
                    recorded_at: row.get(4)?,
                })
            };
            match work_unit_id {
                Some(id) => {
                    let mut stmt = conn.prepare(
                        "SELECT work_unit_id, strategy, state, result_json, recorded_at
                         FROM sync_history WHERE work_unit_id = ?1
                         ORDER BY id DESC LIMIT ?2",
                    )?;
                    let rows = stmt
                        .query_map(params![id, limit], map_row)?
                        .collect::<Result<Vec<_>, _>>()?;
                    rows
                }
                None => {
                    let mut stmt = conn.prepare(
                        "SELECT work_unit_id, strategy, state, result_json, recorded_at
                         FROM sync_history ORDER BY id DESC LIMIT ?1",
                    )?;
                    let rows = stmt
                        .query_map(params![limit], map_row)?
                        .collect::<Result<Vec<_>, _>>()?;
                    rows
                }
            }
        };
        rows.into_iter().map(HistoryRow::decode).collect()
    }

    /// Number of recorded attempts in a given state.
    pub fn count_sync_history_by_state(&self, state: AttemptState) -> Result<i64, DatabaseError> {
        let conn = self.conn();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sync_history WHERE state = ?1",
            params![state.to_string()],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

impl DescriptorStore for Database {
    fn load_descriptor(
        &self,
        work_unit_id: &str,
    ) -> Result<Option<WorkspaceDescriptor>, DatabaseError> {
        Ok(self.get_workspace(work_unit_id)?.map(|entry| entry.descriptor))
    }

    fn record_result(
        &self,
        work_unit_id: &str,
        strategy: SyncStrategy,
        state: AttemptState,
        result: &SyncResult,
    ) -> Result<(), DatabaseError> {
        self.insert_sync_history(work_unit_id, strategy, state, result)?;
        Ok(())
    }
}
