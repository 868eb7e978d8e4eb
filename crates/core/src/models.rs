//! Domain model types shared by the worktree manager, the conflict
//! subsystem, and the sync orchestrator.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Workspaces
// ---------------------------------------------------------------------------

/// Identifies one isolated workspace: a branch checked out at a private path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceDescriptor {
    pub repo_path: PathBuf,
    pub branch_name: String,
    pub worktree_path: PathBuf,
    /// Branch the workspace was forked from and is reconciled back into.
    pub base_branch: String,
    pub create_branch: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_commit: Option<String>,
}

/// A read-only snapshot of one registered worktree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceInfo {
    pub path: PathBuf,
    /// Short branch name, or empty for a detached HEAD.
    pub branch: String,
    pub commit: String,
    pub is_main: bool,
    pub is_locked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_reason: Option<String>,
}

// ---------------------------------------------------------------------------
// Commits and diffs
// ---------------------------------------------------------------------------

/// Information about a single commit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitInfo {
    pub sha: String,
    pub message: String,
    pub author_name: String,
    pub author_email: String,
    pub author_time: i64,
}

/// Kind of change to a file between two revisions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
    Renamed { from: String },
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Added => write!(f, "A"),
            Self::Modified => write!(f, "M"),
            Self::Deleted => write!(f, "D"),
            Self::Renamed { .. } => write!(f, "R"),
        }
    }
}

/// One changed file in a diff.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileDiff {
    pub path: String,
    pub change: ChangeKind,
    pub additions: usize,
    pub deletions: usize,
    pub is_binary: bool,
}

/// File-level diff summary between two revisions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiffSummary {
    pub files: Vec<FileDiff>,
    pub additions: usize,
    pub deletions: usize,
}

impl DiffSummary {
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.files.iter().map(|f| f.path.as_str())
    }
}

/// Uncommitted state of a working copy, split by record/non-record files.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkingTreeStatus {
    pub is_clean: bool,
    pub has_only_record_changes: bool,
    pub uncommitted_record_files: Vec<String>,
    pub uncommitted_other_files: Vec<String>,
}

/// One uncommitted file in a working copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UncommittedFile {
    pub path: String,
    pub deleted: bool,
    pub untracked: bool,
}

// ---------------------------------------------------------------------------
// Conflicts
// ---------------------------------------------------------------------------

/// A record file changed on both sides; needs a record-level merge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordConflict {
    pub file_path: String,
}

/// Advisory classification of what would conflict in a merge.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConflictReport {
    pub has_conflicts: bool,
    pub code_conflicts: Vec<String>,
    pub record_conflicts: Vec<RecordConflict>,
    pub total_files: usize,
    pub summary: String,
}

// ---------------------------------------------------------------------------
// Sync preview / results
// ---------------------------------------------------------------------------

/// Uncommitted changes sitting in the workspace itself.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UncommittedSummary {
    pub files: Vec<String>,
    pub count: usize,
}

/// Uncommitted files in the shared repository overlapping the workspace's
/// changes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LocalConflictSummary {
    pub files: Vec<String>,
    pub count: usize,
}

/// Read-only answer to "can this workspace be reconciled right now".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncPreview {
    pub can_sync: bool,
    pub conflicts: ConflictReport,
    pub diff: DiffSummary,
    pub commits: Vec<CommitInfo>,
    pub merge_base: Option<String>,
    pub uncommitted_changes: UncommittedSummary,
    pub potential_local_conflicts: LocalConflictSummary,
    pub warnings: Vec<String>,
}

impl SyncPreview {
    /// A preview for a failed hard precondition.
    pub fn blocked(message: impl Into<String>) -> Self {
        Self {
            can_sync: false,
            warnings: vec![message.into()],
            ..Default::default()
        }
    }
}

/// Reconciliation strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStrategy {
    Squash,
    Preserve,
    Stage,
}

impl std::fmt::Display for SyncStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Squash => write!(f, "squash"),
            Self::Preserve => write!(f, "preserve"),
            Self::Stage => write!(f, "stage"),
        }
    }
}

impl std::str::FromStr for SyncStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "squash" => Ok(Self::Squash),
            "preserve" => Ok(Self::Preserve),
            "stage" => Ok(Self::Stage),
            other => Err(format!("unknown sync strategy '{other}'")),
        }
    }
}

/// Options for a stage sync.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct StageOptions {
    /// Also bring over the workspace's uncommitted files.
    pub include_uncommitted: bool,
    /// Copy workspace files over local modifications instead of merging.
    pub override_local_changes: bool,
}

/// Terminal outcome of one reconciliation attempt.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_commit: Option<String>,
    pub files_changed: usize,
    #[serde(default)]
    pub has_conflicts: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files_with_conflicts: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uncommitted_files_included: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Safety tag taken before the attempt mutated anything.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<String>,
}

impl SyncResult {
    /// A definitive, non-exceptional failure.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// Terminal state of one reconciliation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptState {
    Succeeded,
    /// Stopped with unresolved conflicts left in the shared working copy.
    FailedWithConflicts,
    /// Refused or found nothing to do; the repository was not changed.
    Failed,
    /// Failed unexpectedly and was reset to the safety snapshot.
    RolledBack,
}

impl AttemptState {
    /// Classify a result returned to the caller.
    pub fn of(result: &SyncResult) -> Self {
        if result.success {
            Self::Succeeded
        } else if result.has_conflicts {
            Self::FailedWithConflicts
        } else {
            Self::Failed
        }
    }
}

impl std::fmt::Display for AttemptState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Succeeded => write!(f, "succeeded"),
            Self::FailedWithConflicts => write!(f, "failed_with_conflicts"),
            Self::Failed => write!(f, "failed"),
            Self::RolledBack => write!(f, "rolled_back"),
        }
    }
}

impl std::str::FromStr for AttemptState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "succeeded" => Ok(Self::Succeeded),
            "failed_with_conflicts" => Ok(Self::FailedWithConflicts),
            "failed" => Ok(Self::Failed),
            "rolled_back" => Ok(Self::RolledBack),
            other => Err(format!("unknown attempt state '{other}'")),
        }
    }
}

/// One recorded reconciliation attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncHistoryEntry {
    pub work_unit_id: String,
    pub strategy: SyncStrategy,
    pub state: AttemptState,
    pub result: SyncResult,
    pub recorded_at: String,
}
