//! TOML-based configuration for wtsync.
//!
//! Every section has serde defaults, so an empty file (or no file at all)
//! yields a usable configuration. Defaults are applied once, at load time.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::ConfigError;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level application configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Logging and data directory.
    #[serde(default)]
    pub general: GeneralConfig,

    /// Settings for the external `git` process boundary.
    #[serde(default)]
    pub git: GitConfig,

    /// Worktree lifecycle settings.
    #[serde(default)]
    pub worktree: WorktreeConfig,

    /// Which files are structured record files and how records are keyed.
    #[serde(default)]
    pub records: RecordConfig,

    /// Reconciliation behaviour.
    #[serde(default)]
    pub sync: SyncConfig,
}

// ---------------------------------------------------------------------------
// General
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Minimum tracing level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Directory for persistent data (the descriptor database).
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_log_level() -> String {
    "info".into()
}
fn default_data_dir() -> PathBuf {
    PathBuf::from(".wtsync")
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            data_dir: default_data_dir(),
        }
    }
}

// ---------------------------------------------------------------------------
// Git process boundary
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitConfig {
    /// Name or path of the `git` executable.
    #[serde(default = "default_git_binary")]
    pub binary: String,

    /// Kill any `git` invocation that runs longer than this. Zero disables
    /// the timeout.
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
}

fn default_git_binary() -> String {
    "git".into()
}
fn default_command_timeout() -> u64 {
    120
}

impl GitConfig {
    pub fn command_timeout(&self) -> Option<Duration> {
        (self.command_timeout_secs > 0).then(|| Duration::from_secs(self.command_timeout_secs))
    }
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            binary: default_git_binary(),
            command_timeout_secs: default_command_timeout(),
        }
    }
}

// ---------------------------------------------------------------------------
// Worktrees
// ---------------------------------------------------------------------------

/// Worktree lifecycle configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorktreeConfig {
    /// Where worktrees are placed. Relative paths are resolved against the
    /// repository root.
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// Prefix for generated branch names (`<prefix>/<work-unit>`).
    #[serde(default = "default_branch_prefix")]
    pub branch_prefix: String,

    /// Create the branch when `ensure_exists` finds it missing.
    #[serde(default = "default_true")]
    pub auto_create_branches: bool,

    /// Delete the worktree's branch during cleanup.
    #[serde(default)]
    pub auto_delete_branches: bool,

    /// Sparse-checkout patterns applied after creation (empty = full checkout).
    #[serde(default)]
    pub sparse_checkout: Vec<String>,

    /// Extra creation attempts made by a recreate after the first failure.
    #[serde(default = "default_create_retries")]
    pub create_retries: u32,

    /// How long an operation waits for the per-path lock.
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout_secs: u64,
}

fn default_storage_dir() -> PathBuf {
    PathBuf::from(".worktrees")
}
fn default_branch_prefix() -> String {
    "wtsync".into()
}
fn default_create_retries() -> u32 {
    1
}
fn default_lock_timeout() -> u64 {
    300
}
fn default_true() -> bool {
    true
}

impl WorktreeConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    /// Resolve the storage directory for a given repository.
    pub fn storage_dir_for(&self, repo_path: &Path) -> PathBuf {
        if self.storage_dir.is_absolute() {
            self.storage_dir.clone()
        } else {
            repo_path.join(&self.storage_dir)
        }
    }

    /// Default branch name for a work unit.
    pub fn branch_name_for(&self, work_unit_id: &str) -> String {
        if self.branch_prefix.is_empty() {
            work_unit_id.to_string()
        } else {
            format!("{}/{}", self.branch_prefix, work_unit_id)
        }
    }
}

impl Default for WorktreeConfig {
    fn default() -> Self {
        Self {
            storage_dir: default_storage_dir(),
            branch_prefix: default_branch_prefix(),
            auto_create_branches: true,
            auto_delete_branches: false,
            sparse_checkout: Vec::new(),
            create_retries: default_create_retries(),
            lock_timeout_secs: default_lock_timeout(),
        }
    }
}

// ---------------------------------------------------------------------------
// Record files
// ---------------------------------------------------------------------------

/// Identifies structured line-record files and how their records are keyed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordConfig {
    /// Glob patterns (repository-relative) matching record files.
    #[serde(default = "default_record_patterns")]
    pub patterns: Vec<String>,

    /// JSON field holding the stable record identifier.
    #[serde(default = "default_id_field")]
    pub id_field: String,

    /// JSON field holding the last-modified timestamp.
    #[serde(default = "default_timestamp_field")]
    pub timestamp_field: String,
}

fn default_record_patterns() -> Vec<String> {
    vec![".tracker/*.jsonl".into()]
}
fn default_id_field() -> String {
    "uuid".into()
}
fn default_timestamp_field() -> String {
    "updated_at".into()
}

impl RecordConfig {
    /// Whether a repository-relative path is a record file.
    pub fn is_record_file(&self, path: &str) -> bool {
        let normalized = path.replace('\\', "/");
        let normalized = normalized.trim_start_matches("./");
        self.patterns
            .iter()
            .any(|p| glob_match::glob_match(p, normalized))
    }
}

impl Default for RecordConfig {
    fn default() -> Self {
        Self {
            patterns: default_record_patterns(),
            id_field: default_id_field(),
            timestamp_field: default_timestamp_field(),
        }
    }
}

// ---------------------------------------------------------------------------
// Sync behaviour
// ---------------------------------------------------------------------------

/// Rule applied when both sides modified the same record.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    /// The side with the later timestamp wins; without comparable
    /// timestamps theirs is kept and the record is flagged.
    #[default]
    LatestTimestamp,
    /// Always keep ours.
    Ours,
    /// Always keep theirs.
    Theirs,
}

impl std::fmt::Display for TieBreak {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LatestTimestamp => write!(f, "latest_timestamp"),
            Self::Ours => write!(f, "ours"),
            Self::Theirs => write!(f, "theirs"),
        }
    }
}

/// Reconciliation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Tie-break rule for records modified on both sides.
    #[serde(default)]
    pub tie_break: TieBreak,

    /// Prefix of safety-snapshot tag names.
    #[serde(default = "default_snapshot_prefix")]
    pub snapshot_prefix: String,

    /// Keep the safety tag after a successful attempt.
    #[serde(default = "default_true")]
    pub retain_snapshots: bool,

    /// Hold a process-wide lock per (repository, target branch) while a
    /// strategy mutates the shared repository.
    #[serde(default = "default_true")]
    pub serialize_reconciliation: bool,
}

fn default_snapshot_prefix() -> String {
    "wtsync-snapshot".into()
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            tie_break: TieBreak::default(),
            snapshot_prefix: default_snapshot_prefix(),
            retain_snapshots: true,
            serialize_reconciliation: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Loading & validation
// ---------------------------------------------------------------------------

impl AppConfig {
    /// Load an [`AppConfig`] from a TOML file at the given path.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: AppConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        debug!("configuration parsed successfully");
        Ok(config)
    }

    /// Load the file if it exists, otherwise fall back to defaults.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if path.exists() {
            Self::load_from_file(path)
        } else {
            debug!(path = %path.display(), "no configuration file, using defaults");
            Ok(Self::default())
        }
    }

    /// Validate that all values are present and sane.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.git.binary.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "git.binary".into(),
                detail: "git binary must not be empty".into(),
            });
        }
        if self.worktree.storage_dir.as_os_str().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "worktree.storage_dir".into(),
                detail: "storage directory must not be empty".into(),
            });
        }
        if self.worktree.branch_prefix.contains(char::is_whitespace) {
            return Err(ConfigError::InvalidValue {
                field: "worktree.branch_prefix".into(),
                detail: "branch prefix must not contain whitespace".into(),
            });
        }
        if self.records.id_field.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "records.id_field".into(),
                detail: "identifier field must not be empty".into(),
            });
        }
        if self.records.patterns.iter().any(|p| p.trim().is_empty()) {
            return Err(ConfigError::InvalidValue {
                field: "records.patterns".into(),
                detail: "record patterns must not be empty strings".into(),
            });
        }
        if self.sync.snapshot_prefix.is_empty()
            || !git2::Reference::is_valid_name(&format!(
                "refs/tags/{}/x",
                self.sync.snapshot_prefix
            ))
        {
            return Err(ConfigError::InvalidValue {
                field: "sync.snapshot_prefix".into(),
                detail: "snapshot prefix must form a valid tag name".into(),
            });
        }
        Ok(())
    }

    /// Convenience: load and validate in one call.
    pub fn load_and_validate<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::load_from_file(path)?;
        config.validate()?;
        Ok(config)
    }
}
