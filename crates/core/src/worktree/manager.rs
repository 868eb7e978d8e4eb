//! Workspace lifecycle: create, validate, recreate, and tear down worktrees.
//!
//! Every mutating operation holds the [`PathLockRegistry`] entry for its
//! worktree path for its whole duration, so operations on one path are
//! strictly serialized while different paths proceed in parallel.

use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use super::cleanup::{find_metadata_dir, run_steps, step, CleanupReport, Step, StepOutcome};
use crate::config::WorktreeConfig;
use crate::errors::{GitError, WorktreeError};
use crate::git::{GitClient, WorktreeOps};
use crate::lock::{normalize_path, PathLockGuard, PathLockRegistry};
use crate::models::{WorkspaceDescriptor, WorkspaceInfo};

/// Inputs to [`WorkspaceManager::create`].
#[derive(Debug, Clone)]
pub struct CreateWorktreeParams {
    pub repo_path: PathBuf,
    pub branch_name: String,
    pub worktree_path: PathBuf,
    /// Create `branch_name` if it does not exist yet.
    pub create_branch: bool,
    /// Where a new branch starts; the repository's `HEAD` when `None`.
    pub base_commit: Option<String>,
}

impl From<&WorkspaceDescriptor> for CreateWorktreeParams {
    fn from(d: &WorkspaceDescriptor) -> Self {
        Self {
            repo_path: d.repo_path.clone(),
            branch_name: d.branch_name.clone(),
            worktree_path: d.worktree_path.clone(),
            create_branch: d.create_branch,
            base_commit: d.base_commit.clone(),
        }
    }
}

/// What [`WorkspaceManager::ensure_exists`] had to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
    /// The worktree was already present and registered; nothing changed.
    Existing,
    /// The worktree was (re)created.
    Created,
}

pub struct WorkspaceManager<G: WorktreeOps = GitClient> {
    git: G,
    locks: Arc<PathLockRegistry>,
    config: WorktreeConfig,
}

impl<G: WorktreeOps> WorkspaceManager<G> {
    pub fn new(git: G, locks: Arc<PathLockRegistry>, config: WorktreeConfig) -> Self {
        Self { git, locks, config }
    }

    pub fn git(&self) -> &G {
        &self.git
    }

    pub fn locks(&self) -> &Arc<PathLockRegistry> {
        &self.locks
    }

    pub fn config(&self) -> &WorktreeConfig {
        &self.config
    }

    /// Conventional descriptor for a work unit: branch `<prefix>/<id>`
    /// checked out under the configured storage directory.
    pub fn descriptor_for(
        &self,
        repo_path: &Path,
        work_unit_id: &str,
        base_branch: &str,
    ) -> WorkspaceDescriptor {
        WorkspaceDescriptor {
            repo_path: repo_path.to_path_buf(),
            branch_name: self.config.branch_name_for(work_unit_id),
            worktree_path: self.config.storage_dir_for(repo_path).join(work_unit_id),
            base_branch: base_branch.to_string(),
            create_branch: self.config.auto_create_branches,
            base_commit: None,
        }
    }

    fn lock(&self, worktree_path: &Path) -> Result<PathLockGuard, WorktreeError> {
        self.locks
            .try_acquire_for(worktree_path, self.config.lock_timeout())
            .ok_or_else(|| WorktreeError::Lock(worktree_path.display().to_string()))
    }

    // -----------------------------------------------------------------------
    // Public operations
    // -----------------------------------------------------------------------

    /// Make sure a registered worktree for `branch_name` exists at
    /// `worktree_path`, recreating it from scratch if it is missing or
    /// half-present.
    #[instrument(skip(self), fields(repo = %repo_path.display(), path = %worktree_path.display()))]
    pub fn ensure_exists(
        &self,
        repo_path: &Path,
        branch_name: &str,
        worktree_path: &Path,
    ) -> Result<EnsureOutcome, WorktreeError> {
        let _guard = self.lock(worktree_path)?;

        if self.is_valid_unlocked(repo_path, worktree_path)? {
            debug!("worktree already valid");
            return Ok(EnsureOutcome::Existing);
        }

        info!(branch = branch_name, "worktree missing or stale, recreating");
        let params = CreateWorktreeParams {
            repo_path: repo_path.to_path_buf(),
            branch_name: branch_name.to_string(),
            worktree_path: worktree_path.to_path_buf(),
            create_branch: self.config.auto_create_branches,
            base_commit: None,
        };

        let attempts = self.config.create_retries.saturating_add(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            // Clear whatever is left of a previous workspace (or attempt),
            // keeping the branch and its commits.
            self.cleanup_unlocked(worktree_path, Some(repo_path), false);

            match self.create_unlocked(&params) {
                Ok(()) => return Ok(EnsureOutcome::Created),
                Err(e) if !is_retryable(&e) => return Err(e),
                Err(e) => {
                    warn!(attempt, attempts, error = %e, "worktree creation attempt failed");
                    last_error = Some(e);
                }
            }
        }

        Err(WorktreeError::Repository {
            path: repo_path.display().to_string(),
            detail: format!(
                "could not create worktree at '{}' after {} attempt(s): {}",
                worktree_path.display(),
                attempts,
                last_error.map(|e| e.to_string()).unwrap_or_default()
            ),
        })
    }

    /// Create a new worktree. Fails if anything at all goes wrong, leaving
    /// neither a directory nor a registration behind.
    #[instrument(skip(self, params), fields(repo = %params.repo_path.display(), path = %params.worktree_path.display()))]
    pub fn create(&self, params: &CreateWorktreeParams) -> Result<(), WorktreeError> {
        let _guard = self.lock(&params.worktree_path)?;
        self.create_unlocked(params)
    }

    /// Tear down a worktree as completely as possible.
    ///
    /// When `repo_path` is `None` the owning repository is looked up from
    /// the worktree's own git metadata; if that fails only the directory is
    /// removed. Returns an error only if every attempted step failed.
    #[instrument(skip(self), fields(path = %worktree_path.display()))]
    pub fn cleanup(
        &self,
        worktree_path: &Path,
        repo_path: Option<&Path>,
    ) -> Result<CleanupReport, WorktreeError> {
        let _guard = self.lock(worktree_path)?;
        self.guard_main_worktree(worktree_path, repo_path)?;
        let report =
            self.cleanup_unlocked(worktree_path, repo_path, self.config.auto_delete_branches);
        if report.all_failed() {
            return Err(WorktreeError::CleanupFailed {
                path: worktree_path.display().to_string(),
                detail: report.failure_summary(),
            });
        }
        Ok(report)
    }

    /// True only if the directory exists and git lists it as a worktree of
    /// `repo_path`. Paths are compared after resolving symlinks.
    pub fn is_valid(&self, repo_path: &Path, worktree_path: &Path) -> Result<bool, WorktreeError> {
        let _guard = self.lock(worktree_path)?;
        self.is_valid_unlocked(repo_path, worktree_path)
    }

    /// All worktrees registered for a repository. Takes no locks.
    pub fn list(&self, repo_path: &Path) -> Result<Vec<WorkspaceInfo>, WorktreeError> {
        Ok(self.git.worktree_list(repo_path)?)
    }

    pub fn is_valid_repo(&self, path: &Path) -> bool {
        self.git.is_valid_repo(path)
    }

    pub fn list_branches(&self, repo_path: &Path) -> Result<Vec<String>, WorktreeError> {
        Ok(self.git.list_branches(repo_path)?)
    }

    // -----------------------------------------------------------------------
    // Lock-free internals (callers hold the path lock)
    // -----------------------------------------------------------------------

    fn is_valid_unlocked(&self, repo_path: &Path, worktree_path: &Path) -> Result<bool, WorktreeError> {
        if !worktree_path.exists() {
            return Ok(false);
        }
        Ok(self.find_registration(repo_path, worktree_path)?.is_some())
    }

    fn find_registration(
        &self,
        repo_path: &Path,
        worktree_path: &Path,
    ) -> Result<Option<WorkspaceInfo>, WorktreeError> {
        let target = normalize_path(worktree_path);
        Ok(self
            .git
            .worktree_list(repo_path)?
            .into_iter()
            .find(|info| normalize_path(&info.path) == target))
    }

    fn create_unlocked(&self, params: &CreateWorktreeParams) -> Result<(), WorktreeError> {
        let repo = params.repo_path.as_path();
        let path = params.worktree_path.as_path();

        if !self.git.is_valid_repo(repo) {
            return Err(WorktreeError::Repository {
                path: repo.display().to_string(),
                detail: "not a git repository".into(),
            });
        }
        validate_worktree_path(repo, path)?;
        if path.exists() {
            return Err(WorktreeError::PathExists(path.display().to_string()));
        }

        let mut created_branch = false;
        if !self.git.branch_exists(repo, &params.branch_name)? {
            if !params.create_branch {
                return Err(WorktreeError::BranchNotFound(params.branch_name.clone()));
            }
            let from = match &params.base_commit {
                Some(commit) => commit.clone(),
                None => self.git.current_commit(repo)?,
            };
            self.git
                .create_branch(repo, &params.branch_name, &from)
                .map_err(|e| match e {
                    GitError::RefNotFound(r) => WorktreeError::BranchNotFound(r),
                    other => WorktreeError::Git(other),
                })?;
            created_branch = true;
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| WorktreeError::InvalidPath {
                path: path.display().to_string(),
                detail: format!("cannot create parent directory: {e}"),
            })?;
        }
        self.exclude_from_repo(repo, path);

        if let Err(e) = self.git.worktree_add(repo, path, &params.branch_name) {
            if created_branch {
                if let Err(del) = self.git.delete_branch(repo, &params.branch_name, true) {
                    warn!(branch = %params.branch_name, error = %del, "could not delete branch after failed add");
                }
            }
            return Err(e.into());
        }

        if let Err(e) = self.finish_create(path) {
            warn!(error = %e, "post-creation step failed, tearing worktree down");
            self.cleanup_unlocked(path, Some(repo), created_branch);
            return Err(e);
        }

        info!(branch = %params.branch_name, path = %path.display(), "worktree created");
        Ok(())
    }

    fn finish_create(&self, path: &Path) -> Result<(), WorktreeError> {
        if !self.config.sparse_checkout.is_empty() {
            self.git
                .configure_sparse_checkout(path, &self.config.sparse_checkout)?;
        }
        if !path.is_dir() {
            return Err(WorktreeError::PathNotFound(path.display().to_string()));
        }
        Ok(())
    }

    /// Keep worktrees stored inside the checkout out of its `git status`.
    fn exclude_from_repo(&self, repo: &Path, worktree_path: &Path) {
        let repo_root = normalize_path(repo);
        let Ok(relative) = normalize_path(worktree_path)
            .strip_prefix(&repo_root)
            .map(Path::to_path_buf)
        else {
            return;
        };
        let Some(Component::Normal(top)) = relative.components().next() else {
            return;
        };
        let pattern = format!("/{}/", top.to_string_lossy());

        let Ok(common_dir) = self.git.common_dir(repo) else {
            return;
        };
        let info_dir = common_dir.join("info");
        let exclude = info_dir.join("exclude");
        let existing = fs::read_to_string(&exclude).unwrap_or_default();
        if existing.lines().any(|l| l.trim() == pattern) {
            return;
        }

        let result = fs::create_dir_all(&info_dir).and_then(|_| {
            let mut file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&exclude)?;
            if !existing.is_empty() && !existing.ends_with('\n') {
                writeln!(file)?;
            }
            writeln!(file, "{pattern}")
        });
        match result {
            Ok(()) => debug!(pattern = %pattern, "added worktree storage to info/exclude"),
            Err(e) => warn!(error = %e, "could not update info/exclude"),
        }
    }

    /// Refuse to tear down the repository's main checkout.
    fn guard_main_worktree(
        &self,
        worktree_path: &Path,
        repo_path: Option<&Path>,
    ) -> Result<(), WorktreeError> {
        let Some(repo) = repo_path.map(Path::to_path_buf).or_else(|| self.infer_repo(worktree_path))
        else {
            return Ok(());
        };
        if normalize_path(&repo) == normalize_path(worktree_path) {
            return Err(WorktreeError::InvalidPath {
                path: worktree_path.display().to_string(),
                detail: "refusing to remove the main working tree".into(),
            });
        }
        Ok(())
    }

    fn infer_repo(&self, worktree_path: &Path) -> Option<PathBuf> {
        if !worktree_path.exists() {
            return None;
        }
        let common = self.git.common_dir(worktree_path).ok()?;
        if common.file_name().map(|n| n == ".git").unwrap_or(false) {
            common.parent().map(Path::to_path_buf)
        } else {
            Some(common)
        }
    }

    /// The five-step teardown. Never fails; see [`CleanupReport`].
    pub(crate) fn cleanup_unlocked(
        &self,
        worktree_path: &Path,
        repo_path: Option<&Path>,
        delete_branch: bool,
    ) -> CleanupReport {
        let repo = repo_path
            .map(Path::to_path_buf)
            .or_else(|| self.infer_repo(worktree_path));
        let mut report = CleanupReport::new(worktree_path, repo.clone());

        let registration = repo
            .as_deref()
            .and_then(|r| self.find_registration(r, worktree_path).ok().flatten());
        report.branch = registration
            .as_ref()
            .map(|r| r.branch.clone())
            .filter(|b| !b.is_empty());
        let metadata_dir = repo
            .as_deref()
            .and_then(|r| self.git.common_dir(r).ok())
            .and_then(|common| find_metadata_dir(&common, worktree_path));

        let git = &self.git;
        let branch = report.branch.clone();
        let steps: Vec<Step<'_>> = vec![
            step("deregister", || match (&repo, &registration) {
                (Some(r), Some(_)) => {
                    StepOutcome::from_result(git.worktree_remove(r, worktree_path, true))
                }
                (None, _) => StepOutcome::skipped("repository unknown"),
                (_, None) => StepOutcome::skipped("not registered"),
            }),
            step("remove_metadata", || match &metadata_dir {
                Some(dir) if dir.exists() => StepOutcome::from_result(fs::remove_dir_all(dir)),
                _ => StepOutcome::skipped("no worktree metadata"),
            }),
            step("remove_directory", || {
                if worktree_path.exists() {
                    StepOutcome::from_result(fs::remove_dir_all(worktree_path))
                } else {
                    StepOutcome::skipped("directory already gone")
                }
            }),
            step("prune", || match &repo {
                Some(r) => StepOutcome::from_result(git.worktree_prune(r)),
                None => StepOutcome::skipped("repository unknown"),
            }),
            step("delete_branch", || match (&repo, &branch) {
                _ if !delete_branch => StepOutcome::skipped("branch deletion disabled"),
                (Some(r), Some(b)) => StepOutcome::from_result(git.delete_branch(r, b, true)),
                _ => StepOutcome::skipped("branch unknown"),
            }),
        ];
        run_steps(&mut report, steps);
        report
    }
}

/// Precondition failures that a retry cannot fix.
fn is_retryable(err: &WorktreeError) -> bool {
    !matches!(
        err,
        WorktreeError::BranchNotFound(_)
            | WorktreeError::InvalidPath { .. }
            | WorktreeError::Repository { .. }
            | WorktreeError::Config(_)
    )
}

fn validate_worktree_path(repo: &Path, path: &Path) -> Result<(), WorktreeError> {
    if path.as_os_str().is_empty() {
        return Err(WorktreeError::InvalidPath {
            path: String::new(),
            detail: "path is empty".into(),
        });
    }
    if normalize_path(path) == normalize_path(repo) {
        return Err(WorktreeError::InvalidPath {
            path: path.display().to_string(),
            detail: "worktree path is the repository itself".into(),
        });
    }
    if path.components().any(|c| c == Component::ParentDir) {
        return Err(WorktreeError::InvalidPath {
            path: path.display().to_string(),
            detail: "path must not contain '..'".into(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::WorktreeErrorCode;
    use crate::test_support::{commit_file, git, git_available, init_repo};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    /// In-memory worktree registry that records how many `worktree_add`
    /// calls overlap per path.
    #[derive(Default)]
    struct FakeGit {
        registered: Mutex<HashMap<PathBuf, String>>,
        branches: Mutex<Vec<String>>,
        active_adds: Mutex<HashMap<PathBuf, usize>>,
        max_concurrent_adds: AtomicUsize,
        total_adds: AtomicUsize,
        add_delay: Duration,
        fail_adds: AtomicUsize,
    }

    impl FakeGit {
        fn with_delay(delay: Duration) -> Self {
            Self {
                add_delay: delay,
                branches: Mutex::new(vec!["main".into()]),
                ..Default::default()
            }
        }
    }

    impl WorktreeOps for FakeGit {
        fn current_commit(&self, _: &Path) -> Result<String, GitError> {
            Ok("0".repeat(40))
        }
        fn branch_exists(&self, _: &Path, name: &str) -> Result<bool, GitError> {
            Ok(self.branches.lock().unwrap().iter().any(|b| b == name))
        }
        fn create_branch(&self, _: &Path, name: &str, _: &str) -> Result<(), GitError> {
            self.branches.lock().unwrap().push(name.into());
            Ok(())
        }
        fn delete_branch(&self, _: &Path, name: &str, _: bool) -> Result<(), GitError> {
            self.branches.lock().unwrap().retain(|b| b != name);
            Ok(())
        }
        fn list_branches(&self, _: &Path) -> Result<Vec<String>, GitError> {
            Ok(self.branches.lock().unwrap().clone())
        }
        fn worktree_add(&self, _: &Path, path: &Path, branch: &str) -> Result<(), GitError> {
            let key = normalize_path(path);
            {
                let mut active = self.active_adds.lock().unwrap();
                let n = active.entry(key.clone()).or_default();
                *n += 1;
                self.max_concurrent_adds.fetch_max(*n, Ordering::SeqCst);
            }
            std::thread::sleep(self.add_delay);
            *self.active_adds.lock().unwrap().get_mut(&key).unwrap() -= 1;
            self.total_adds.fetch_add(1, Ordering::SeqCst);

            if self.fail_adds.load(Ordering::SeqCst) > 0 {
                self.fail_adds.fetch_sub(1, Ordering::SeqCst);
                return Err(GitError::CommandFailed {
                    command: "worktree add".into(),
                    exit_code: 128,
                    stderr: "simulated".into(),
                });
            }
            fs::create_dir_all(path)?;
            self.registered
                .lock()
                .unwrap()
                .insert(normalize_path(path), branch.into());
            Ok(())
        }
        fn worktree_remove(&self, _: &Path, path: &Path, _: bool) -> Result<(), GitError> {
            self.registered.lock().unwrap().remove(&normalize_path(path));
            Ok(())
        }
        fn worktree_prune(&self, _: &Path) -> Result<(), GitError> {
            Ok(())
        }
        fn worktree_list(&self, _: &Path) -> Result<Vec<WorkspaceInfo>, GitError> {
            Ok(self
                .registered
                .lock()
                .unwrap()
                .iter()
                .map(|(path, branch)| WorkspaceInfo {
                    path: path.clone(),
                    branch: branch.clone(),
                    commit: "0".repeat(40),
                    is_main: false,
                    is_locked: false,
                    lock_reason: None,
                })
                .collect())
        }
        fn configure_sparse_checkout(&self, _: &Path, _: &[String]) -> Result<(), GitError> {
            Ok(())
        }
        fn is_valid_repo(&self, _: &Path) -> bool {
            true
        }
        fn common_dir(&self, path: &Path) -> Result<PathBuf, GitError> {
            Ok(path.join(".git"))
        }
    }

    fn fake_manager(delay: Duration) -> WorkspaceManager<FakeGit> {
        WorkspaceManager::new(
            FakeGit::with_delay(delay),
            Arc::new(PathLockRegistry::new()),
            WorktreeConfig::default(),
        )
    }

    #[test]
    fn test_concurrent_ensure_same_path_creates_once() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("repo");
        fs::create_dir_all(&repo).unwrap();
        let path = dir.path().join("wt/issue-1");
        let manager = fake_manager(Duration::from_millis(20));

        let outcomes: Vec<_> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| s.spawn(|| manager.ensure_exists(&repo, "wtsync/issue-1", &path)))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap().unwrap()).collect()
        });

        assert_eq!(manager.git.max_concurrent_adds.load(Ordering::SeqCst), 1);
        assert_eq!(manager.git.total_adds.load(Ordering::SeqCst), 1);
        assert_eq!(
            outcomes.iter().filter(|o| **o == EnsureOutcome::Created).count(),
            1
        );
    }

    #[test]
    fn test_different_paths_run_in_parallel() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("repo");
        fs::create_dir_all(&repo).unwrap();
        let delay = Duration::from_millis(200);
        let manager = fake_manager(delay);
        let paths: Vec<_> = (0..4).map(|i| dir.path().join(format!("wt/unit-{i}"))).collect();

        let start = Instant::now();
        std::thread::scope(|s| {
            for path in &paths {
                let manager = &manager;
                let repo = &repo;
                s.spawn(move || manager.ensure_exists(repo, "main", path).unwrap());
            }
        });
        let elapsed = start.elapsed();

        // Serialized would take at least 4 * delay.
        assert!(elapsed < delay * 3, "took {elapsed:?}");
        assert_eq!(manager.git.total_adds.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_ensure_retries_once_then_reports_repository_error() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("repo");
        fs::create_dir_all(&repo).unwrap();
        let path = dir.path().join("wt/flaky");

        let manager = fake_manager(Duration::ZERO);
        manager.git.fail_adds.store(1, Ordering::SeqCst);
        assert_eq!(
            manager.ensure_exists(&repo, "main", &path).unwrap(),
            EnsureOutcome::Created
        );
        assert_eq!(manager.git.total_adds.load(Ordering::SeqCst), 2);

        let other = dir.path().join("wt/broken");
        manager.git.fail_adds.store(5, Ordering::SeqCst);
        let err = manager.ensure_exists(&repo, "main", &other).unwrap_err();
        assert_eq!(err.code(), WorktreeErrorCode::RepositoryError);
        assert!(!other.exists());
    }

    #[test]
    fn test_ensure_without_auto_create_reports_missing_branch() {
        let dir = tempfile::tempdir().unwrap();
        let config = WorktreeConfig {
            auto_create_branches: false,
            ..Default::default()
        };
        let manager = WorkspaceManager::new(
            FakeGit::with_delay(Duration::ZERO),
            Arc::new(PathLockRegistry::new()),
            config,
        );
        let err = manager
            .ensure_exists(dir.path(), "nope", &dir.path().join("wt/x"))
            .unwrap_err();
        assert_eq!(err.code(), WorktreeErrorCode::BranchNotFound);
    }

    #[test]
    fn test_lock_timeout_is_lock_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = WorktreeConfig {
            lock_timeout_secs: 0,
            ..Default::default()
        };
        let locks = Arc::new(PathLockRegistry::new());
        let manager = WorkspaceManager::new(
            FakeGit::with_delay(Duration::ZERO),
            Arc::clone(&locks),
            config,
        );
        let path = dir.path().join("wt/busy");
        let _held = locks.acquire(&path);
        let err = manager.ensure_exists(dir.path(), "main", &path).unwrap_err();
        assert_eq!(err.code(), WorktreeErrorCode::LockError);
    }

    #[test]
    fn test_create_rejects_existing_path_and_repo_itself() {
        let dir = tempfile::tempdir().unwrap();
        let manager = fake_manager(Duration::ZERO);
        let occupied = dir.path().join("occupied");
        fs::create_dir_all(&occupied).unwrap();

        let mut params = CreateWorktreeParams {
            repo_path: dir.path().to_path_buf(),
            branch_name: "main".into(),
            worktree_path: occupied,
            create_branch: false,
            base_commit: None,
        };
        assert_eq!(
            manager.create(&params).unwrap_err().code(),
            WorktreeErrorCode::PathExists
        );

        params.worktree_path = dir.path().to_path_buf();
        assert_eq!(
            manager.create(&params).unwrap_err().code(),
            WorktreeErrorCode::InvalidPath
        );
    }

    // -- real git -----------------------------------------------------------

    fn real_manager(config: WorktreeConfig) -> WorkspaceManager<GitClient> {
        WorkspaceManager::new(GitClient::default(), Arc::new(PathLockRegistry::new()), config)
    }

    #[test]
    fn test_ensure_exists_is_idempotent_with_git() {
        if !git_available() {
            eprintln!("SKIP: git not installed");
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("repo");
        init_repo(&repo);
        let manager = real_manager(WorktreeConfig::default());
        let desc = manager.descriptor_for(&repo, "issue-7", "main");

        let first = manager
            .ensure_exists(&repo, &desc.branch_name, &desc.worktree_path)
            .unwrap();
        assert_eq!(first, EnsureOutcome::Created);
        assert!(manager.is_valid(&repo, &desc.worktree_path).unwrap());
        assert!(manager
            .list_branches(&repo)
            .unwrap()
            .contains(&"wtsync/issue-7".to_string()));

        let head_before = git(&desc.worktree_path, &["rev-parse", "HEAD"]);
        let second = manager
            .ensure_exists(&repo, &desc.branch_name, &desc.worktree_path)
            .unwrap();
        assert_eq!(second, EnsureOutcome::Existing);
        assert_eq!(git(&desc.worktree_path, &["rev-parse", "HEAD"]), head_before);

        // Storage directory inside the repo is excluded from status.
        assert_eq!(git(&repo, &["status", "--porcelain"]), "");

        let listed = manager.list(&repo).unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed[0].is_main);
    }

    #[test]
    fn test_ensure_recreates_after_directory_removed() {
        if !git_available() {
            eprintln!("SKIP: git not installed");
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("repo");
        init_repo(&repo);
        let manager = real_manager(WorktreeConfig::default());
        let desc = manager.descriptor_for(&repo, "issue-8", "main");
        manager
            .ensure_exists(&repo, &desc.branch_name, &desc.worktree_path)
            .unwrap();
        commit_file(&desc.worktree_path, "work.txt", "progress\n", "work");

        fs::remove_dir_all(&desc.worktree_path).unwrap();
        assert!(!manager.is_valid(&repo, &desc.worktree_path).unwrap());

        let outcome = manager
            .ensure_exists(&repo, &desc.branch_name, &desc.worktree_path)
            .unwrap();
        assert_eq!(outcome, EnsureOutcome::Created);
        // The branch survived, so committed work is back.
        assert!(desc.worktree_path.join("work.txt").exists());
    }

    #[test]
    fn test_cleanup_after_manual_delete_removes_registration() {
        if !git_available() {
            eprintln!("SKIP: git not installed");
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("repo");
        init_repo(&repo);
        let manager = real_manager(WorktreeConfig::default());
        let path = dir.path().join("outside/wt");
        manager
            .create(&CreateWorktreeParams {
                repo_path: repo.clone(),
                branch_name: "feature".into(),
                worktree_path: path.clone(),
                create_branch: true,
                base_commit: None,
            })
            .unwrap();

        fs::remove_dir_all(&path).unwrap();
        let report = manager.cleanup(&path, Some(&repo)).unwrap();
        assert_eq!(
            report.outcome_of("remove_directory"),
            Some(&StepOutcome::skipped("directory already gone"))
        );
        assert_eq!(manager.list(&repo).unwrap().len(), 1);
        // Branch kept unless auto_delete_branches.
        assert!(manager
            .list_branches(&repo)
            .unwrap()
            .contains(&"feature".to_string()));
    }

    #[test]
    fn test_cleanup_infers_repo_and_deletes_branch() {
        if !git_available() {
            eprintln!("SKIP: git not installed");
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("repo");
        init_repo(&repo);
        let manager = real_manager(WorktreeConfig {
            auto_delete_branches: true,
            ..Default::default()
        });
        let path = dir.path().join("wt");
        manager
            .create(&CreateWorktreeParams {
                repo_path: repo.clone(),
                branch_name: "scratch".into(),
                worktree_path: path.clone(),
                create_branch: true,
                base_commit: None,
            })
            .unwrap();

        let report = manager.cleanup(&path, None).unwrap();
        assert!(report.repo_path.is_some());
        assert_eq!(report.branch.as_deref(), Some("scratch"));
        assert_eq!(report.outcome_of("deregister"), Some(&StepOutcome::Succeeded));
        assert_eq!(report.outcome_of("delete_branch"), Some(&StepOutcome::Succeeded));
        assert!(!path.exists());
        assert!(!manager
            .list_branches(&repo)
            .unwrap()
            .contains(&"scratch".to_string()));
    }

    #[test]
    fn test_cleanup_refuses_main_worktree() {
        if !git_available() {
            eprintln!("SKIP: git not installed");
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("repo");
        init_repo(&repo);
        let manager = real_manager(WorktreeConfig::default());
        let err = manager.cleanup(&repo, None).unwrap_err();
        assert_eq!(err.code(), WorktreeErrorCode::InvalidPath);
        assert!(repo.join("README.md").exists());
    }

    #[test]
    fn test_create_missing_branch_without_create_flag() {
        if !git_available() {
            eprintln!("SKIP: git not installed");
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("repo");
        init_repo(&repo);
        let manager = real_manager(WorktreeConfig::default());
        let err = manager
            .create(&CreateWorktreeParams {
                repo_path: repo.clone(),
                branch_name: "ghost".into(),
                worktree_path: dir.path().join("wt"),
                create_branch: false,
                base_commit: None,
            })
            .unwrap_err();
        assert_eq!(err.code(), WorktreeErrorCode::BranchNotFound);
        assert!(!dir.path().join("wt").exists());
    }
}
