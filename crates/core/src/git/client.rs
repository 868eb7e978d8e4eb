//! Git operations via `git2`, with the `git` CLI for porcelain-only commands.

use std::path::{Path, PathBuf};
use std::time::Duration;

use git2::{
    BranchType, Delta, DiffFindOptions, DiffOptions, ErrorCode, Oid, Repository, Sort, Status,
    StatusOptions,
};
use tracing::{debug, info, instrument, warn};

use super::command::{run_git, run_git_checked, GitOutput};
use super::ops::WorktreeOps;
use crate::config::{GitConfig, RecordConfig};
use crate::errors::GitError;
use crate::lock::normalize_path;
use crate::models::{
    ChangeKind, CommitInfo, DiffSummary, FileDiff, UncommittedFile, WorkingTreeStatus,
    WorkspaceInfo,
};

/// How a branch is merged into the checked-out branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeMode {
    /// `git merge --squash`: changes land in the index, no merge commit.
    Squash,
    /// `git merge --no-ff --no-commit`: a merge commit is pending.
    NoFastForward,
}

/// What a merge left behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Clean,
    /// Paths with unmerged index entries.
    Conflicted(Vec<String>),
}

/// The three index stages of one conflicted path.
#[derive(Debug, Clone, Default)]
pub struct ConflictStages {
    pub path: String,
    pub base: Option<String>,
    pub ours: Option<String>,
    pub theirs: Option<String>,
}

/// Stateless git client. Every method takes the repository (or worktree)
/// path it operates on, so one client serves any number of repositories.
#[derive(Debug, Clone)]
pub struct GitClient {
    binary: String,
    timeout: Option<Duration>,
}

impl Default for GitClient {
    fn default() -> Self {
        Self::new(&GitConfig::default())
    }
}

impl GitClient {
    pub fn new(config: &GitConfig) -> Self {
        Self {
            binary: config.binary.clone(),
            timeout: config.command_timeout(),
        }
    }

    fn open(path: &Path) -> Result<Repository, GitError> {
        Repository::open(path).map_err(|_| GitError::RepositoryNotFound(path.display().to_string()))
    }

    fn git(&self, dir: &Path, args: &[&str]) -> Result<String, GitError> {
        run_git_checked(&self.binary, dir, args, self.timeout)
    }

    fn git_output(&self, dir: &Path, args: &[&str]) -> Result<GitOutput, GitError> {
        run_git(&self.binary, dir, args, self.timeout)
    }

    // -----------------------------------------------------------------------
    // Refs and history
    // -----------------------------------------------------------------------

    /// Resolve any revision to a commit SHA, or `None` if it does not exist.
    pub fn resolve_commit(&self, repo_path: &Path, rev: &str) -> Result<Option<String>, GitError> {
        let repo = Self::open(repo_path)?;
        let result = match repo.revparse_single(rev) {
            Ok(obj) => Ok(Some(obj.peel_to_commit()?.id().to_string())),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        };
        result
    }

    /// Short name of the checked-out branch, `None` when detached.
    pub fn current_branch(&self, repo_path: &Path) -> Result<Option<String>, GitError> {
        let repo = Self::open(repo_path)?;
        let head = repo.head()?;
        if head.is_branch() {
            Ok(head.shorthand().map(str::to_string))
        } else {
            Ok(None)
        }
    }

    /// Most recent common ancestor of two revisions.
    #[instrument(skip(self), fields(repo = %repo_path.display()))]
    pub fn merge_base(&self, repo_path: &Path, a: &str, b: &str) -> Result<Option<String>, GitError> {
        let repo = Self::open(repo_path)?;
        let a = peel_oid(&repo, a)?;
        let b = peel_oid(&repo, b)?;
        match repo.merge_base(a, b) {
            Ok(oid) => Ok(Some(oid.to_string())),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Whether `ancestor` is reachable from `descendant` (or equal to it).
    pub fn is_ancestor(
        &self,
        repo_path: &Path,
        ancestor: &str,
        descendant: &str,
    ) -> Result<bool, GitError> {
        let repo = Self::open(repo_path)?;
        let ancestor = peel_oid(&repo, ancestor)?;
        let descendant = peel_oid(&repo, descendant)?;
        if ancestor == descendant {
            return Ok(true);
        }
        Ok(repo.graph_descendant_of(descendant, ancestor)?)
    }

    /// Commits reachable from `head` but not from `base`, newest first.
    pub fn commit_list(
        &self,
        repo_path: &Path,
        base: &str,
        head: &str,
    ) -> Result<Vec<CommitInfo>, GitError> {
        let repo = Self::open(repo_path)?;
        let mut revwalk = repo.revwalk()?;
        revwalk.push(peel_oid(&repo, head)?)?;
        revwalk.hide(peel_oid(&repo, base)?)?;
        revwalk.set_sorting(Sort::TOPOLOGICAL | Sort::TIME)?;

        let mut commits = Vec::new();
        for oid_result in revwalk {
            let oid = oid_result?;
            let commit = repo.find_commit(oid)?;
            commits.push(CommitInfo {
                sha: oid.to_string(),
                message: commit.message().unwrap_or("").to_string(),
                author_name: commit.author().name().unwrap_or("").to_string(),
                author_email: commit.author().email().unwrap_or("").to_string(),
                author_time: commit.author().when().seconds(),
            });
        }
        debug!(count = commits.len(), "collected commits");
        Ok(commits)
    }

    /// File-level diff between two revisions, with rename detection.
    pub fn diff_summary(
        &self,
        repo_path: &Path,
        base: &str,
        head: &str,
    ) -> Result<DiffSummary, GitError> {
        let repo = Self::open(repo_path)?;
        let base_tree = repo.revparse_single(base)?.peel_to_tree()?;
        let head_tree = repo.revparse_single(head)?.peel_to_tree()?;

        let mut opts = DiffOptions::new();
        let mut diff = repo.diff_tree_to_tree(Some(&base_tree), Some(&head_tree), Some(&mut opts))?;
        diff.find_similar(Some(DiffFindOptions::new().renames(true)))?;

        let mut summary = DiffSummary::default();
        for (idx, delta) in diff.deltas().enumerate() {
            let new_path = delta.new_file().path().map(path_string);
            let old_path = delta.old_file().path().map(path_string);
            let (path, change) = match delta.status() {
                Delta::Added => (new_path, ChangeKind::Added),
                Delta::Deleted => (old_path, ChangeKind::Deleted),
                Delta::Renamed => (
                    new_path,
                    ChangeKind::Renamed {
                        from: old_path.unwrap_or_default(),
                    },
                ),
                _ => (new_path.or(old_path), ChangeKind::Modified),
            };
            let Some(path) = path else { continue };

            let (additions, deletions, is_binary) = match git2::Patch::from_diff(&diff, idx)? {
                Some(patch) => {
                    let (_, adds, dels) = patch.line_stats()?;
                    (adds, dels, delta.flags().is_binary())
                }
                None => (0, 0, true),
            };
            summary.additions += additions;
            summary.deletions += deletions;
            summary.files.push(FileDiff {
                path,
                change,
                additions,
                deletions,
                is_binary,
            });
        }
        Ok(summary)
    }

    /// Content of `path` at revision `rev`, `None` if absent there.
    pub fn show_file(
        &self,
        repo_path: &Path,
        rev: &str,
        path: &str,
    ) -> Result<Option<String>, GitError> {
        let repo = Self::open(repo_path)?;
        let tree = repo.revparse_single(rev)?.peel_to_tree()?;
        let entry = match tree.get_path(Path::new(path)) {
            Ok(entry) => entry,
            Err(e) if e.code() == ErrorCode::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let blob = repo.find_blob(entry.id())?;
        Ok(Some(String::from_utf8_lossy(blob.content()).into_owned()))
    }

    // -----------------------------------------------------------------------
    // Working tree state
    // -----------------------------------------------------------------------

    /// Uncommitted files (staged, unstaged, or untracked) under `path`.
    pub fn uncommitted_files(&self, path: &Path) -> Result<Vec<UncommittedFile>, GitError> {
        let repo = Self::open(path)?;
        let workdir = repo.workdir().map(Path::to_path_buf);
        let mut opts = StatusOptions::new();
        opts.include_untracked(true)
            .recurse_untracked_dirs(true)
            .include_ignored(false);
        let statuses = repo.statuses(Some(&mut opts))?;

        let mut files = Vec::new();
        for entry in statuses.iter() {
            let status = entry.status();
            if status == Status::CURRENT || status.contains(Status::IGNORED) {
                continue;
            }
            let Some(file) = entry.path() else { continue };
            if file.ends_with('/') {
                // Nested repositories (for example worktrees kept inside the
                // checkout) are not part of this working copy.
                if let Some(ref root) = workdir {
                    if root.join(file).join(".git").exists() {
                        continue;
                    }
                }
            }
            files.push(UncommittedFile {
                path: file.trim_end_matches('/').to_string(),
                deleted: status.intersects(Status::WT_DELETED | Status::INDEX_DELETED),
                untracked: status.contains(Status::WT_NEW),
            });
        }
        Ok(files)
    }

    /// Uncommitted changes split into record files and everything else.
    pub fn working_tree_status(
        &self,
        repo_path: &Path,
        records: &RecordConfig,
    ) -> Result<WorkingTreeStatus, GitError> {
        let files = self.uncommitted_files(repo_path)?;
        let (record, other): (Vec<_>, Vec<_>) = files
            .into_iter()
            .map(|f| f.path)
            .partition(|p| records.is_record_file(p));
        Ok(WorkingTreeStatus {
            is_clean: record.is_empty() && other.is_empty(),
            has_only_record_changes: !record.is_empty() && other.is_empty(),
            uncommitted_record_files: record,
            uncommitted_other_files: other,
        })
    }

    /// Paths with unmerged entries in the index.
    pub fn conflicted_paths(&self, repo_path: &Path) -> Result<Vec<String>, GitError> {
        let repo = Self::open(repo_path)?;
        let index = repo.index()?;
        let mut paths = Vec::new();
        for conflict in index.conflicts()? {
            let conflict = conflict?;
            let entry = conflict
                .our
                .as_ref()
                .or(conflict.their.as_ref())
                .or(conflict.ancestor.as_ref());
            if let Some(entry) = entry {
                let path = String::from_utf8_lossy(&entry.path).into_owned();
                if !paths.contains(&path) {
                    paths.push(path);
                }
            }
        }
        paths.sort();
        Ok(paths)
    }

    /// Base/ours/theirs contents of one conflicted path.
    pub fn conflict_stages(&self, repo_path: &Path, path: &str) -> Result<ConflictStages, GitError> {
        let repo = Self::open(repo_path)?;
        let index = repo.index()?;
        let read = |entry: &Option<git2::IndexEntry>| -> Result<Option<String>, GitError> {
            match entry {
                Some(e) => {
                    let blob = repo.find_blob(e.id)?;
                    Ok(Some(String::from_utf8_lossy(blob.content()).into_owned()))
                }
                None => Ok(None),
            }
        };
        for conflict in index.conflicts()? {
            let conflict = conflict?;
            let entry_path = conflict
                .our
                .as_ref()
                .or(conflict.their.as_ref())
                .or(conflict.ancestor.as_ref())
                .map(|e| String::from_utf8_lossy(&e.path).into_owned());
            if entry_path.as_deref() == Some(path) {
                return Ok(ConflictStages {
                    path: path.to_string(),
                    base: read(&conflict.ancestor)?,
                    ours: read(&conflict.our)?,
                    theirs: read(&conflict.their)?,
                });
            }
        }
        Err(GitError::RefNotFound(format!("no conflict entry for '{path}'")))
    }

    /// Paths whose index entry differs from `HEAD`.
    pub fn staged_files(&self, repo_path: &Path) -> Result<Vec<String>, GitError> {
        let repo = Self::open(repo_path)?;
        let head_tree = repo.head()?.peel_to_tree()?;
        let index = repo.index()?;
        let diff = repo.diff_tree_to_index(Some(&head_tree), Some(&index), None)?;
        Ok(diff
            .deltas()
            .filter_map(|d| d.new_file().path().or(d.old_file().path()).map(path_string))
            .collect())
    }

    // -----------------------------------------------------------------------
    // Mutations of the shared working copy
    // -----------------------------------------------------------------------

    /// Merge `branch` into the checked-out branch without committing.
    #[instrument(skip(self), fields(repo = %repo_path.display()))]
    pub fn merge(
        &self,
        repo_path: &Path,
        branch: &str,
        mode: MergeMode,
    ) -> Result<MergeOutcome, GitError> {
        let args: &[&str] = match mode {
            MergeMode::Squash => &["merge", "--squash", branch],
            MergeMode::NoFastForward => &["merge", "--no-ff", "--no-commit", branch],
        };
        let output = self.git_output(repo_path, args)?;
        if output.success() {
            info!(branch, ?mode, "merge applied cleanly");
            return Ok(MergeOutcome::Clean);
        }
        let conflicts = self.conflicted_paths(repo_path)?;
        if conflicts.is_empty() {
            return Err(GitError::CommandFailed {
                command: "merge".into(),
                exit_code: output.exit_code,
                stderr: format!("{}{}", output.stdout.trim(), output.stderr.trim()),
            });
        }
        warn!(branch, count = conflicts.len(), "merge left conflicts");
        Ok(MergeOutcome::Conflicted(conflicts))
    }

    /// Commit the index (hooks run), returning the new `HEAD` SHA.
    #[instrument(skip(self, message), fields(repo = %repo_path.display()))]
    pub fn commit(&self, repo_path: &Path, message: &str) -> Result<String, GitError> {
        self.git(repo_path, &["commit", "-q", "-m", message])?;
        let sha = self.current_commit(repo_path)?;
        info!(sha = %sha, "created commit");
        Ok(sha)
    }

    /// Stage additions, modifications and deletions for `paths`.
    pub fn stage_paths(&self, repo_path: &Path, paths: &[String]) -> Result<(), GitError> {
        if paths.is_empty() {
            return Ok(());
        }
        let mut args = vec!["add", "-A", "--"];
        args.extend(paths.iter().map(String::as_str));
        self.git(repo_path, &args)?;
        Ok(())
    }

    /// Put `path` back to its `HEAD` state in both index and working tree,
    /// removing it entirely if `HEAD` does not have it.
    pub fn restore_from_head(&self, repo_path: &Path, path: &str) -> Result<(), GitError> {
        if self.show_file(repo_path, "HEAD", path)?.is_some() {
            self.git(repo_path, &["checkout", "HEAD", "--", path])?;
        } else {
            self.git(
                repo_path,
                &["rm", "-q", "--cached", "--ignore-unmatch", "--", path],
            )?;
            let full = repo_path.join(path);
            if full.exists() {
                std::fs::remove_file(&full)?;
            }
        }
        debug!(path, "restored file to HEAD");
        Ok(())
    }

    /// Hard-reset the checked-out branch, index and working tree to `commit`.
    /// Also clears any in-progress merge.
    #[instrument(skip(self), fields(repo = %repo_path.display()))]
    pub fn reset_hard(&self, repo_path: &Path, commit: &str) -> Result<(), GitError> {
        self.git(repo_path, &["reset", "-q", "--hard", commit])?;
        info!(commit, "reset working copy");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Tags
    // -----------------------------------------------------------------------

    /// Create a lightweight tag. Fails if the tag already exists.
    #[instrument(skip(self), fields(repo = %repo_path.display()))]
    pub fn create_tag(&self, repo_path: &Path, name: &str, commit: &str) -> Result<(), GitError> {
        let repo = Self::open(repo_path)?;
        let obj = repo.revparse_single(commit)?.peel_to_commit()?.into_object();
        repo.tag_lightweight(name, &obj, false)?;
        info!(name, commit, "created tag");
        Ok(())
    }

    pub fn delete_tag(&self, repo_path: &Path, name: &str) -> Result<(), GitError> {
        let repo = Self::open(repo_path)?;
        repo.tag_delete(name)?;
        debug!(name, "deleted tag");
        Ok(())
    }

    /// Commit a tag points at, `None` if no such tag.
    pub fn tag_target(&self, repo_path: &Path, name: &str) -> Result<Option<String>, GitError> {
        let repo = Self::open(repo_path)?;
        let result = match repo.find_reference(&format!("refs/tags/{name}")) {
            Ok(reference) => Ok(Some(reference.peel_to_commit()?.id().to_string())),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        };
        result
    }
}

// ---------------------------------------------------------------------------
// Worktree primitives
// ---------------------------------------------------------------------------

impl WorktreeOps for GitClient {
    fn current_commit(&self, repo_path: &Path) -> Result<String, GitError> {
        let repo = Self::open(repo_path)?;
        let commit = repo.head()?.peel_to_commit()?;
        Ok(commit.id().to_string())
    }

    fn branch_exists(&self, repo_path: &Path, name: &str) -> Result<bool, GitError> {
        let repo = Self::open(repo_path)?;
        let exists = match repo.find_branch(name, BranchType::Local) {
            Ok(_) => Ok(true),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        };
        exists
    }

    #[instrument(skip(self), fields(repo = %repo_path.display()))]
    fn create_branch(&self, repo_path: &Path, name: &str, from_commit: &str) -> Result<(), GitError> {
        let repo = Self::open(repo_path)?;
        let commit = repo
            .revparse_single(from_commit)
            .map_err(|_| GitError::RefNotFound(from_commit.to_string()))?
            .peel_to_commit()?;
        repo.branch(name, &commit, false)?;
        info!(name, from_commit, "created branch");
        Ok(())
    }

    #[instrument(skip(self), fields(repo = %repo_path.display()))]
    fn delete_branch(&self, repo_path: &Path, name: &str, force: bool) -> Result<(), GitError> {
        let flag = if force { "-D" } else { "-d" };
        self.git(repo_path, &["branch", flag, name])?;
        info!(name, "deleted branch");
        Ok(())
    }

    fn list_branches(&self, repo_path: &Path) -> Result<Vec<String>, GitError> {
        let repo = Self::open(repo_path)?;
        let mut names = Vec::new();
        for branch_result in repo.branches(Some(BranchType::Local))? {
            let (branch, _) = branch_result?;
            if let Some(name) = branch.name()? {
                names.push(name.to_string());
            }
        }
        Ok(names)
    }

    #[instrument(skip(self), fields(repo = %repo_path.display(), path = %worktree_path.display()))]
    fn worktree_add(&self, repo_path: &Path, worktree_path: &Path, branch: &str) -> Result<(), GitError> {
        let path = worktree_path.to_string_lossy();
        self.git(repo_path, &["worktree", "add", &path, branch])?;
        info!(branch, "added worktree");
        Ok(())
    }

    #[instrument(skip(self), fields(repo = %repo_path.display(), path = %worktree_path.display()))]
    fn worktree_remove(&self, repo_path: &Path, worktree_path: &Path, force: bool) -> Result<(), GitError> {
        let path = worktree_path.to_string_lossy();
        let mut args = vec!["worktree", "remove"];
        if force {
            // Twice, so locked worktrees are removed as well.
            args.extend(["--force", "--force"]);
        }
        args.push(&path);
        self.git(repo_path, &args)?;
        info!("removed worktree");
        Ok(())
    }

    fn worktree_prune(&self, repo_path: &Path) -> Result<(), GitError> {
        self.git(repo_path, &["worktree", "prune"])?;
        debug!(repo = %repo_path.display(), "pruned worktrees");
        Ok(())
    }

    fn worktree_list(&self, repo_path: &Path) -> Result<Vec<WorkspaceInfo>, GitError> {
        let output = self.git(repo_path, &["worktree", "list", "--porcelain"])?;
        Ok(parse_worktree_list(&output))
    }

    #[instrument(skip(self, patterns), fields(path = %worktree_path.display()))]
    fn configure_sparse_checkout(&self, worktree_path: &Path, patterns: &[String]) -> Result<(), GitError> {
        let mut args = vec!["sparse-checkout", "set", "--no-cone"];
        args.extend(patterns.iter().map(String::as_str));
        self.git(worktree_path, &args)?;
        info!(count = patterns.len(), "configured sparse checkout");
        Ok(())
    }

    fn is_valid_repo(&self, path: &Path) -> bool {
        Repository::open(path).is_ok()
    }

    fn common_dir(&self, path: &Path) -> Result<PathBuf, GitError> {
        let repo = Self::open(path)?;
        resolve_common_dir(repo.path())
    }
}

/// The shared `.git` directory behind `git_dir`. A linked worktree's admin
/// directory names it in its `commondir` file, relative to itself.
fn resolve_common_dir(git_dir: &Path) -> Result<PathBuf, GitError> {
    let pointer = git_dir.join("commondir");
    let common = match std::fs::read_to_string(&pointer) {
        Ok(contents) => git_dir.join(contents.trim()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => git_dir.to_path_buf(),
        Err(e) => return Err(GitError::IoError(e)),
    };
    Ok(normalize_path(&common))
}

fn peel_oid(repo: &Repository, rev: &str) -> Result<Oid, GitError> {
    let obj = repo
        .revparse_single(rev)
        .map_err(|_| GitError::RefNotFound(rev.to_string()))?;
    Ok(obj.peel_to_commit()?.id())
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

/// Parse `git worktree list --porcelain`.
pub(crate) fn parse_worktree_list(output: &str) -> Vec<WorkspaceInfo> {
    let mut infos = Vec::new();
    let mut current: Option<WorkspaceInfo> = None;

    for line in output.lines() {
        if line.trim().is_empty() {
            if let Some(info) = current.take() {
                infos.push(info);
            }
            continue;
        }
        let (key, value) = line.split_once(' ').unwrap_or((line, ""));
        match key {
            "worktree" => {
                if let Some(info) = current.take() {
                    infos.push(info);
                }
                current = Some(WorkspaceInfo {
                    path: PathBuf::from(value),
                    branch: String::new(),
                    commit: String::new(),
                    is_main: infos.is_empty(),
                    is_locked: false,
                    lock_reason: None,
                });
            }
            "HEAD" => {
                if let Some(ref mut info) = current {
                    info.commit = value.to_string();
                }
            }
            "branch" => {
                if let Some(ref mut info) = current {
                    info.branch = value.trim_start_matches("refs/heads/").to_string();
                }
            }
            "locked" => {
                if let Some(ref mut info) = current {
                    info.is_locked = true;
                    if !value.is_empty() {
                        info.lock_reason = Some(value.to_string());
                    }
                }
            }
            _ => {}
        }
    }
    if let Some(info) = current.take() {
        infos.push(info);
    }
    infos
}
