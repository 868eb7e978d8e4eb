//! Error types for the wtsync core library.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`CoreError`] enum unifies them all for callers that want a
//! single error type.

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    Worktree(#[from] WorktreeError),

    #[error(transparent)]
    Merge(#[from] MergeError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

// ---------------------------------------------------------------------------
// Git errors
// ---------------------------------------------------------------------------

/// Errors from the version-control command interface (git2 and the `git` CLI).
#[derive(Debug, Error)]
pub enum GitError {
    /// The path does not exist or is not a git repository.
    #[error("git repository not found at '{0}'")]
    RepositoryNotFound(String),

    /// A `git2` library error.
    #[error("git2 error: {0}")]
    Git2Error(#[from] git2::Error),

    /// A ref (branch, tag, SHA) could not be resolved.
    #[error("git ref not found: {0}")]
    RefNotFound(String),

    /// The `git` binary was not found on `$PATH`.
    #[error("git binary not found: {0}")]
    BinaryNotFound(String),

    /// A `git` command exited with a non-zero status.
    #[error("git {command} failed (exit {exit_code}): {stderr}")]
    CommandFailed {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    /// A `git` command ran past the configured timeout and was killed.
    #[error("git {command} timed out after {secs}s")]
    Timeout { command: String, secs: u64 },

    /// Generic I/O wrapper.
    #[error("git I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Worktree errors
// ---------------------------------------------------------------------------

/// Machine-readable classification of a [`WorktreeError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorktreeErrorCode {
    GitError,
    PathExists,
    PathNotFound,
    InvalidPath,
    BranchNotFound,
    RepositoryError,
    ConfigError,
    LockError,
    CleanupFailed,
}

impl std::fmt::Display for WorktreeErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::GitError => "GIT_ERROR",
            Self::PathExists => "PATH_EXISTS",
            Self::PathNotFound => "PATH_NOT_FOUND",
            Self::InvalidPath => "INVALID_PATH",
            Self::BranchNotFound => "BRANCH_NOT_FOUND",
            Self::RepositoryError => "REPOSITORY_ERROR",
            Self::ConfigError => "CONFIG_ERROR",
            Self::LockError => "LOCK_ERROR",
            Self::CleanupFailed => "CLEANUP_FAILED",
        };
        f.write_str(s)
    }
}

/// Errors from the workspace (worktree) lifecycle manager.
#[derive(Debug, Error)]
pub enum WorktreeError {
    /// An underlying version-control operation failed.
    #[error("git operation failed: {0}")]
    Git(#[from] GitError),

    /// The target worktree path is already occupied.
    #[error("worktree path already exists: {0}")]
    PathExists(String),

    /// The worktree path is missing where it was expected to exist.
    #[error("worktree path not found: {0}")]
    PathNotFound(String),

    /// The path cannot be used as a worktree location.
    #[error("invalid worktree path '{path}': {detail}")]
    InvalidPath { path: String, detail: String },

    /// The requested branch does not exist and was not to be created.
    #[error("branch not found: {0}")]
    BranchNotFound(String),

    /// The repository is unusable or worktree creation kept failing.
    #[error("repository error at '{path}': {detail}")]
    Repository { path: String, detail: String },

    /// The worktree configuration is inconsistent.
    #[error("invalid worktree configuration: {0}")]
    Config(String),

    /// The per-path lock could not be acquired in time.
    #[error("timed out waiting for worktree lock on '{0}'")]
    Lock(String),

    /// Every cleanup step failed.
    #[error("cleanup failed for '{path}': {detail}")]
    CleanupFailed { path: String, detail: String },
}

impl WorktreeError {
    /// The machine-readable code for this error.
    pub fn code(&self) -> WorktreeErrorCode {
        match self {
            Self::Git(_) => WorktreeErrorCode::GitError,
            Self::PathExists(_) => WorktreeErrorCode::PathExists,
            Self::PathNotFound(_) => WorktreeErrorCode::PathNotFound,
            Self::InvalidPath { .. } => WorktreeErrorCode::InvalidPath,
            Self::BranchNotFound(_) => WorktreeErrorCode::BranchNotFound,
            Self::Repository { .. } => WorktreeErrorCode::RepositoryError,
            Self::Config(_) => WorktreeErrorCode::ConfigError,
            Self::Lock(_) => WorktreeErrorCode::LockError,
            Self::CleanupFailed { .. } => WorktreeErrorCode::CleanupFailed,
        }
    }
}

// ---------------------------------------------------------------------------
// Merge errors
// ---------------------------------------------------------------------------

/// Errors from the textual and record merge primitives.
#[derive(Debug, Error)]
pub enum MergeError {
    /// A record line is not valid JSON.
    #[error("invalid record on line {line}: {detail}")]
    InvalidRecord { line: usize, detail: String },

    /// A record line has no usable identifier field.
    #[error("record on line {line} has no '{field}' identifier")]
    MissingIdentifier { line: usize, field: String },
}

// ---------------------------------------------------------------------------
// Sync errors
// ---------------------------------------------------------------------------

/// Errors from the synchronization orchestrator.
#[derive(Debug, Error)]
pub enum SyncError {
    /// No descriptor is recorded for the work unit.
    #[error("no workspace recorded for work unit '{0}'")]
    WorkspaceNotFound(String),

    /// A hard precondition for reconciliation does not hold.
    #[error("sync precondition failed: {0}")]
    Precondition(String),

    /// The attempt failed unexpectedly and the shared repository was reset
    /// to the safety snapshot.
    #[error("sync failed and was rolled back to snapshot '{snapshot}': {source}")]
    RolledBack {
        snapshot: String,
        rollback_error: Option<String>,
        #[source]
        source: Box<SyncError>,
    },

    /// Underlying Git error during sync.
    #[error("sync git error: {0}")]
    Git(#[from] GitError),

    /// Record or textual merge error during sync.
    #[error("sync merge error: {0}")]
    Merge(#[from] MergeError),

    /// Descriptor store error during sync.
    #[error("sync database error: {0}")]
    Database(#[from] DatabaseError),

    /// File I/O in the shared working copy failed.
    #[error("sync I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// Name of the safety snapshot when this error came out of a rollback.
    pub fn snapshot(&self) -> Option<&str> {
        match self {
            Self::RolledBack { snapshot, .. } => Some(snapshot),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue { field: String, detail: String },

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Database errors
// ---------------------------------------------------------------------------

/// Errors from the SQLite persistence layer.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Underlying rusqlite error.
    #[error("database error: {0}")]
    SqliteError(#[from] rusqlite::Error),

    /// A migration failed.
    #[error("database migration failed (version {version}): {detail}")]
    MigrationFailed { version: u32, detail: String },

    /// A record was not found.
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// A stored column could not be decoded.
    #[error("corrupt {entity} row: {detail}")]
    Corrupt { entity: String, detail: String },

    /// Generic I/O error (e.g. file permissions).
    #[error("database I/O error: {0}")]
    IoError(#[from] std::io::Error),
}
