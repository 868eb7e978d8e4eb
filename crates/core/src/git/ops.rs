//! The version-control primitives the worktree manager depends on.
//!
//! [`GitClient`](super::GitClient) is the production implementation; tests
//! substitute instrumented fakes.

use std::path::{Path, PathBuf};

use crate::errors::GitError;
use crate::models::WorkspaceInfo;

pub trait WorktreeOps: Send + Sync {
    /// SHA of the commit `HEAD` points at.
    fn current_commit(&self, repo_path: &Path) -> Result<String, GitError>;

    fn branch_exists(&self, repo_path: &Path, name: &str) -> Result<bool, GitError>;

    /// Create a local branch at `from_commit` (any revision git can resolve).
    fn create_branch(&self, repo_path: &Path, name: &str, from_commit: &str)
        -> Result<(), GitError>;

    fn delete_branch(&self, repo_path: &Path, name: &str, force: bool) -> Result<(), GitError>;

    fn list_branches(&self, repo_path: &Path) -> Result<Vec<String>, GitError>;

    fn worktree_add(
        &self,
        repo_path: &Path,
        worktree_path: &Path,
        branch: &str,
    ) -> Result<(), GitError>;

    fn worktree_remove(
        &self,
        repo_path: &Path,
        worktree_path: &Path,
        force: bool,
    ) -> Result<(), GitError>;

    fn worktree_prune(&self, repo_path: &Path) -> Result<(), GitError>;

    fn worktree_list(&self, repo_path: &Path) -> Result<Vec<WorkspaceInfo>, GitError>;

    fn configure_sparse_checkout(
        &self,
        worktree_path: &Path,
        patterns: &[String],
    ) -> Result<(), GitError>;

    fn is_valid_repo(&self, path: &Path) -> bool;

    /// The shared git directory (`.git` of the main checkout) for any
    /// repository or worktree path.
    fn common_dir(&self, path: &Path) -> Result<PathBuf, GitError>;
}
