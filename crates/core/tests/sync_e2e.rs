//! End-to-end tests for workspace creation and reconciliation.
//!
//! These tests exercise the real `WorkspaceManager` and `SyncOrchestrator`
//! with:
//! - Local git repositories created in temp directories
//! - Worktrees created through the `git` CLI
//! - A real SQLite database as the descriptor store
//!
//! Tests skip gracefully if `git` is not installed.

use std::path::Path;
use std::process::Command;
use std::sync::Arc;

use tempfile::TempDir;

use wtsync_core::config::AppConfig;
use wtsync_core::db::Database;
use wtsync_core::errors::SyncError;
use wtsync_core::git::GitClient;
use wtsync_core::lock::PathLockRegistry;
use wtsync_core::models::{AttemptState, WorkspaceDescriptor};
use wtsync_core::sync::SyncOrchestrator;
use wtsync_core::worktree::{CreateWorktreeParams, WorkspaceManager};

// ===========================================================================
// Helpers
// ===========================================================================

fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("failed to run git");
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

fn commit_file(dir: &Path, path: &str, content: &str, message: &str) {
    let full = dir.join(path);
    if let Some(parent) = full.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(full, content).unwrap();
    git(dir, &["add", path]);
    git(dir, &["commit", "-q", "-m", message]);
}

/// A shared repository on `main` with one commit of `README.md`.
fn init_shared_repo(dir: &Path) {
    std::fs::create_dir_all(dir).unwrap();
    git(dir, &["init", "-q"]);
    git(dir, &["symbolic-ref", "HEAD", "refs/heads/main"]);
    git(dir, &["config", "user.name", "Test"]);
    git(dir, &["config", "user.email", "test@example.com"]);
    git(dir, &["config", "commit.gpgsign", "false"]);
    commit_file(dir, "README.md", "line one\nline two\n", "initial commit");
}

struct Harness {
    _tmp: TempDir,
    repo: std::path::PathBuf,
    db: Arc<Database>,
    manager: WorkspaceManager,
    orchestrator: SyncOrchestrator<Arc<Database>>,
}

impl Harness {
    fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let repo = tmp.path().join("repo");
        init_shared_repo(&repo);

        let mut config = AppConfig::default();
        config.general.data_dir = tmp.path().join("data");
        config.sync.retain_snapshots = false;

        let db = Arc::new(Database::open_in_dir(&config.general.data_dir).unwrap());
        let locks = Arc::new(PathLockRegistry::new());
        let manager = WorkspaceManager::new(
            GitClient::new(&config.git),
            locks.clone(),
            config.worktree.clone(),
        );
        let orchestrator = SyncOrchestrator::from_config(&config, db.clone(), locks);

        Self {
            _tmp: tmp,
            repo,
            db,
            manager,
            orchestrator,
        }
    }

    /// Create and record a workspace branched from `main`.
    fn workspace(&self, id: &str) -> WorkspaceDescriptor {
        let desc = self.manager.descriptor_for(&self.repo, id, "main");
        self.manager
            .create(&CreateWorktreeParams::from(&desc))
            .unwrap();
        self.db.upsert_workspace(id, &desc).unwrap();
        desc
    }

    fn head(&self) -> String {
        git(&self.repo, &["rev-parse", "HEAD"])
    }
}

// ===========================================================================
// Test 1: Squash sync of a clean two-commit workspace
// ===========================================================================

#[test]
fn test_squash_sync_brings_work_over_as_one_commit() {
    if !git_available() {
        eprintln!("SKIP: git not installed");
        return;
    }
    let h = Harness::new();
    let desc = h.workspace("feature-x");
    assert!(desc.worktree_path.starts_with(&h.repo));

    commit_file(&desc.worktree_path, "a.txt", "alpha\n", "add a");
    commit_file(&desc.worktree_path, "b.txt", "beta\n", "add b");
    commit_file(&h.repo, "notes.txt", "unrelated\n", "unrelated work on main");

    // The worktree lives inside the repository but must not dirty it.
    assert_eq!(git(&h.repo, &["status", "--porcelain"]), "");

    let preview = h.orchestrator.preview("feature-x").unwrap();
    assert!(preview.can_sync, "warnings: {:?}", preview.warnings);
    assert_eq!(preview.commits.len(), 2);
    assert_eq!(preview.diff.files.len(), 2);
    assert!(!preview.conflicts.has_conflicts);

    let result = h
        .orchestrator
        .squash_sync("feature-x", Some("Add a and b"))
        .unwrap();
    assert!(result.success, "error: {:?}", result.error);
    assert_eq!(result.files_changed, 2);
    assert_eq!(result.final_commit.as_deref(), Some(h.head().as_str()));
    // Snapshots are discarded after success when not retained.
    assert!(result.snapshot.is_none());
    assert_eq!(git(&h.repo, &["tag", "--list"]), "");

    assert_eq!(git(&h.repo, &["rev-list", "--count", "HEAD"]), "3");
    let parents = git(&h.repo, &["rev-list", "--parents", "-n", "1", "HEAD"]);
    assert_eq!(parents.split_whitespace().count(), 2, "squash must not create a merge commit");
    let files = git(&h.repo, &["show", "--name-only", "--format=", "HEAD"]);
    assert!(files.contains("a.txt") && files.contains("b.txt"));
    assert_eq!(git(&h.repo, &["log", "-1", "--format=%s"]), "Add a and b");

    let history = h.db.list_sync_history(Some("feature-x"), 10).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].state, AttemptState::Succeeded);
}

// ===========================================================================
// Test 2: A textual conflict is surfaced and left in place
// ===========================================================================

#[test]
fn test_text_conflict_leaves_repository_conflicted() {
    if !git_available() {
        eprintln!("SKIP: git not installed");
        return;
    }
    let h = Harness::new();
    let desc = h.workspace("feature-y");

    commit_file(&desc.worktree_path, "README.md", "line one\nfrom workspace\n", "edit readme");
    commit_file(&h.repo, "README.md", "line one\nfrom main\n", "edit readme on main");
    let head_before = h.head();

    let preview = h.orchestrator.preview("feature-y").unwrap();
    assert!(preview.conflicts.has_conflicts);
    assert_eq!(preview.conflicts.code_conflicts, vec!["README.md"]);

    let result = h.orchestrator.squash_sync("feature-y", None).unwrap();
    assert!(!result.success);
    assert!(result.has_conflicts);
    assert_eq!(result.files_with_conflicts, vec!["README.md"]);
    assert!(result.final_commit.is_none());

    // Nothing was committed and nothing was rolled back.
    assert_eq!(h.head(), head_before);
    assert_eq!(
        git(&h.repo, &["diff", "--name-only", "--diff-filter=U"]),
        "README.md"
    );
    let content = std::fs::read_to_string(h.repo.join("README.md")).unwrap();
    assert!(content.contains("<<<<<<<"));

    // The snapshot survives a conflicted attempt.
    let snapshot = result.snapshot.expect("snapshot kept for conflicted attempt");
    assert_eq!(
        git(&h.repo, &["rev-parse", &format!("refs/tags/{snapshot}")]),
        head_before
    );

    let history = h.db.list_sync_history(Some("feature-y"), 10).unwrap();
    assert_eq!(history[0].state, AttemptState::FailedWithConflicts);
}

// ===========================================================================
// Test 3: A failing commit hook triggers a rollback
// ===========================================================================

#[cfg(unix)]
#[test]
fn test_failed_commit_rolls_back_to_snapshot() {
    use std::os::unix::fs::PermissionsExt;

    if !git_available() {
        eprintln!("SKIP: git not installed");
        return;
    }
    let h = Harness::new();
    let desc = h.workspace("feature-z");
    commit_file(&desc.worktree_path, "c.txt", "gamma\n", "add c");

    // Hooks are shared with the worktree, so install it only now.
    let hook = h.repo.join(".git").join("hooks").join("pre-commit");
    std::fs::create_dir_all(hook.parent().unwrap()).unwrap();
    std::fs::write(&hook, "#!/bin/sh\nexit 1\n").unwrap();
    std::fs::set_permissions(&hook, std::fs::Permissions::from_mode(0o755)).unwrap();

    let head_before = h.head();
    let err = h.orchestrator.squash_sync("feature-z", None).unwrap_err();
    let snapshot = match &err {
        SyncError::RolledBack {
            snapshot,
            rollback_error,
            ..
        } => {
            assert!(rollback_error.is_none(), "{:?}", rollback_error);
            snapshot.clone()
        }
        other => panic!("expected a rollback, got {other:?}"),
    };
    assert_eq!(err.snapshot(), Some(snapshot.as_str()));

    assert_eq!(h.head(), head_before);
    assert_eq!(git(&h.repo, &["status", "--porcelain"]), "");
    assert!(!h.repo.join("c.txt").exists());
    assert_eq!(
        git(&h.repo, &["rev-parse", &format!("refs/tags/{snapshot}")]),
        head_before
    );

    let history = h.db.list_sync_history(Some("feature-z"), 10).unwrap();
    assert_eq!(history[0].state, AttemptState::RolledBack);
    assert_eq!(history[0].result.snapshot.as_deref(), Some(snapshot.as_str()));
}

// ===========================================================================
// Test 4: Preserve sync keeps history
// ===========================================================================

#[test]
fn test_preserve_sync_creates_merge_commit() {
    if !git_available() {
        eprintln!("SKIP: git not installed");
        return;
    }
    let h = Harness::new();
    let desc = h.workspace("feature-p");
    commit_file(&desc.worktree_path, "p1.txt", "1\n", "first");
    commit_file(&desc.worktree_path, "p2.txt", "2\n", "second");
    commit_file(&h.repo, "main.txt", "m\n", "unrelated work on main");

    let result = h.orchestrator.preserve_sync("feature-p").unwrap();
    assert!(result.success, "error: {:?}", result.error);
    assert_eq!(result.files_changed, 2);

    let parents = git(&h.repo, &["rev-list", "--parents", "-n", "1", "HEAD"]);
    assert_eq!(parents.split_whitespace().count(), 3);
    let log = git(&h.repo, &["log", "--format=%s"]);
    assert!(log.contains("first") && log.contains("second"));
}

// ===========================================================================
// Test 5: Cleanup after the directory was deleted by hand
// ===========================================================================

#[test]
fn test_cleanup_after_manual_delete_then_recreate() {
    if !git_available() {
        eprintln!("SKIP: git not installed");
        return;
    }
    let h = Harness::new();
    let desc = h.workspace("scratch");
    std::fs::remove_dir_all(&desc.worktree_path).unwrap();
    assert!(!h
        .manager
        .is_valid(&desc.repo_path, &desc.worktree_path)
        .unwrap());

    let report = h
        .manager
        .cleanup(&desc.worktree_path, Some(&desc.repo_path))
        .unwrap();
    assert!(!report.all_failed());
    let listed = git(&h.repo, &["worktree", "list", "--porcelain"]);
    assert!(!listed.contains("scratch"));

    // The branch survived, so the workspace can be recreated on it.
    h.manager
        .ensure_exists(&desc.repo_path, &desc.branch_name, &desc.worktree_path)
        .unwrap();
    assert!(h
        .manager
        .is_valid(&desc.repo_path, &desc.worktree_path)
        .unwrap());
}
