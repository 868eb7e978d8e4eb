//! Reconciliation of a workspace branch back into its target branch.
//!
//! The [`SyncOrchestrator`] is the only component that mutates the shared
//! repository's working copy. Each strategy runs the same envelope:
//!
//! 1. Check hard preconditions (nothing is touched if they fail).
//! 2. Tag the target's current commit as a [`SafetySnapshot`].
//! 3. Capture and reset uncommitted record-file edits.
//! 4. Merge, auto-resolve record conflicts, commit or stage, and replay the
//!    captured record edits.
//! 5. On an unexpected error, reset to the snapshot and restore the
//!    captured edits before returning [`SyncError::RolledBack`].
//!
//! Merge conflicts in ordinary files are not errors: the repository is left
//! mid-merge for manual resolution and the result lists the paths.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, error, info, instrument, warn};

use super::local::LocalRecordChanges;
use super::snapshot::SafetySnapshot;
use super::store::DescriptorStore;
use crate::config::{AppConfig, RecordConfig, SyncConfig};
use crate::conflict::{has_conflict_markers, ConflictDetector, ConflictResolver, Merger, RecordMerger};
use crate::errors::SyncError;
use crate::git::{GitClient, MergeMode, MergeOutcome, WorktreeOps};
use crate::lock::{lock_key, PathLockGuard, PathLockRegistry};
use crate::models::{
    AttemptState, LocalConflictSummary, StageOptions, SyncPreview, SyncResult, SyncStrategy,
    UncommittedSummary, WorkingTreeStatus, WorkspaceDescriptor,
};

/// Outcome of the hard-precondition check.
enum Precheck {
    Ready { merge_base: String },
    Blocked(String),
}

/// Mutable bookkeeping of one attempt, needed for rollback.
struct Attempt {
    snapshot: SafetySnapshot,
    captured: LocalRecordChanges,
    /// Files the attempt created outside git's knowledge.
    created: Vec<PathBuf>,
}

pub struct SyncOrchestrator<S: DescriptorStore> {
    git: GitClient,
    store: S,
    config: SyncConfig,
    records: RecordConfig,
    locks: Arc<PathLockRegistry>,
    detector: ConflictDetector,
    merger: RecordMerger,
}

impl<S: DescriptorStore> SyncOrchestrator<S> {
    pub fn new(
        git: GitClient,
        store: S,
        config: SyncConfig,
        records: RecordConfig,
        locks: Arc<PathLockRegistry>,
    ) -> Self {
        let detector = ConflictDetector::new(git.clone(), records.clone());
        let merger = RecordMerger::new(&records, config.tie_break);
        Self {
            git,
            store,
            config,
            records,
            locks,
            detector,
            merger,
        }
    }

    pub fn from_config(config: &AppConfig, store: S, locks: Arc<PathLockRegistry>) -> Self {
        Self::new(
            GitClient::new(&config.git),
            store,
            config.sync.clone(),
            config.records.clone(),
            locks,
        )
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn descriptor(&self, work_unit_id: &str) -> Result<WorkspaceDescriptor, SyncError> {
        self.store
            .load_descriptor(work_unit_id)?
            .ok_or_else(|| SyncError::WorkspaceNotFound(work_unit_id.to_string()))
    }

    // -----------------------------------------------------------------------
    // Preview
    // -----------------------------------------------------------------------

    /// Read-only assessment of whether `work_unit_id` can be reconciled.
    #[instrument(skip(self))]
    pub fn preview(&self, work_unit_id: &str) -> Result<SyncPreview, SyncError> {
        let desc = self.descriptor(work_unit_id)?;
        let merge_base = match self.precheck(&desc)? {
            Precheck::Ready { merge_base } => merge_base,
            Precheck::Blocked(message) => {
                info!(work_unit_id, reason = %message, "sync blocked");
                return Ok(SyncPreview::blocked(message));
            }
        };

        let repo = desc.repo_path.as_path();
        let branch = desc.branch_name.as_str();
        let target = desc.base_branch.as_str();

        let commits = self.git.commit_list(repo, &merge_base, branch)?;
        let diff = self.git.diff_summary(repo, &merge_base, branch)?;
        let conflicts = self.detector.detect(repo, branch, target)?;

        let workspace_files: Vec<String> = self
            .git
            .uncommitted_files(&desc.worktree_path)?
            .into_iter()
            .map(|f| f.path)
            .collect();

        let shared = self.git.working_tree_status(repo, &self.records)?;
        let changed: HashSet<&str> = diff.paths().collect();
        let local_overlap: Vec<String> = shared
            .uncommitted_record_files
            .iter()
            .chain(&shared.uncommitted_other_files)
            .filter(|p| changed.contains(p.as_str()))
            .cloned()
            .collect();

        let mut warnings = Vec::new();
        let mut can_sync = true;

        if let Some(message) = self.target_checkout_problem(repo, target)? {
            warnings.push(message);
            can_sync = false;
        }
        if !shared.uncommitted_other_files.is_empty() {
            warnings.push(format!(
                "shared repository has uncommitted changes outside record files: {}",
                shared.uncommitted_other_files.join(", ")
            ));
            can_sync = false;
        }
        if shared.has_only_record_changes {
            warnings.push(format!(
                "{} uncommitted record file(s) in the shared repository will be merged record-by-record",
                shared.uncommitted_record_files.len()
            ));
        }
        if commits.is_empty() {
            warnings.push("workspace branch has no commits beyond the merge base".into());
        } else if self.git.is_ancestor(repo, branch, target)? {
            warnings.push(format!("'{branch}' is already merged into '{target}'"));
        }
        if !conflicts.code_conflicts.is_empty() {
            warnings.push(format!(
                "merge will conflict in: {}",
                conflicts.code_conflicts.join(", ")
            ));
        }
        if !workspace_files.is_empty() {
            warnings.push(format!(
                "workspace has {} uncommitted file(s); only a stage sync with uncommitted files included brings them over",
                workspace_files.len()
            ));
        }

        debug!(work_unit_id, can_sync, commits = commits.len(), "preview computed");
        Ok(SyncPreview {
            can_sync,
            conflicts,
            diff,
            commits,
            merge_base: Some(merge_base),
            uncommitted_changes: UncommittedSummary {
                count: workspace_files.len(),
                files: workspace_files,
            },
            potential_local_conflicts: LocalConflictSummary {
                count: local_overlap.len(),
                files: local_overlap,
            },
            warnings,
        })
    }

    /// Workspace exists, both branches exist, and they share history.
    fn precheck(&self, desc: &WorkspaceDescriptor) -> Result<Precheck, SyncError> {
        let repo = desc.repo_path.as_path();
        if !desc.worktree_path.is_dir() {
            return Ok(Precheck::Blocked(format!(
                "workspace path does not exist: {}",
                desc.worktree_path.display()
            )));
        }
        if !self.git.is_valid_repo(repo) {
            return Ok(Precheck::Blocked(format!(
                "not a git repository: {}",
                repo.display()
            )));
        }
        for branch in [&desc.branch_name, &desc.base_branch] {
            if !self.git.branch_exists(repo, branch)? {
                return Ok(Precheck::Blocked(format!("branch '{branch}' does not exist")));
            }
        }
        match self
            .git
            .merge_base(repo, &desc.branch_name, &desc.base_branch)?
        {
            Some(merge_base) => Ok(Precheck::Ready { merge_base }),
            None => Ok(Precheck::Blocked(format!(
                "'{}' and '{}' share no common history",
                desc.branch_name, desc.base_branch
            ))),
        }
    }

    fn target_checkout_problem(&self, repo: &Path, target: &str) -> Result<Option<String>, SyncError> {
        let current = self.git.current_branch(repo)?;
        if current.as_deref() == Some(target) {
            Ok(None)
        } else {
            Ok(Some(format!(
                "shared repository must have '{}' checked out (currently {})",
                target,
                current.as_deref().unwrap_or("detached HEAD")
            )))
        }
    }

    // -----------------------------------------------------------------------
    // Strategies
    // -----------------------------------------------------------------------

    /// Collapse the workspace's commits into one new commit on the target.
    #[instrument(skip(self, message))]
    pub fn squash_sync(
        &self,
        work_unit_id: &str,
        message: Option<&str>,
    ) -> Result<SyncResult, SyncError> {
        self.reconcile(work_unit_id, SyncStrategy::Squash, |desc, attempt| {
            self.merge_and_commit(desc, attempt, MergeMode::Squash, message)
        })
    }

    /// Merge the workspace branch with a merge commit, keeping its history.
    #[instrument(skip(self))]
    pub fn preserve_sync(&self, work_unit_id: &str) -> Result<SyncResult, SyncError> {
        self.reconcile(work_unit_id, SyncStrategy::Preserve, |desc, attempt| {
            self.merge_and_commit(desc, attempt, MergeMode::NoFastForward, None)
        })
    }

    /// Apply the workspace's changes to the shared working copy, staged but
    /// not committed.
    #[instrument(skip(self))]
    pub fn stage_sync(
        &self,
        work_unit_id: &str,
        options: StageOptions,
    ) -> Result<SyncResult, SyncError> {
        self.reconcile(work_unit_id, SyncStrategy::Stage, |desc, attempt| {
            self.merge_and_stage(desc, attempt, options)
        })
    }

    /// The snapshot/rollback envelope shared by every strategy.
    fn reconcile<F>(
        &self,
        work_unit_id: &str,
        strategy: SyncStrategy,
        body: F,
    ) -> Result<SyncResult, SyncError>
    where
        F: FnOnce(&WorkspaceDescriptor, &mut Attempt) -> Result<SyncResult, SyncError>,
    {
        let desc = self.descriptor(work_unit_id)?;
        let repo = desc.repo_path.as_path();
        let _lock = self.reconciliation_lock(&desc);

        if let Precheck::Blocked(message) = self.precheck(&desc)? {
            return Err(SyncError::Precondition(message));
        }
        if let Some(message) = self.target_checkout_problem(repo, &desc.base_branch)? {
            return Err(SyncError::Precondition(message));
        }
        let status = self.git.working_tree_status(repo, &self.records)?;
        if !status.uncommitted_other_files.is_empty() {
            return Err(SyncError::Precondition(format!(
                "shared repository has uncommitted changes outside record files: {}",
                status.uncommitted_other_files.join(", ")
            )));
        }

        if self
            .git
            .is_ancestor(repo, &desc.branch_name, &desc.base_branch)?
        {
            let result = SyncResult::failed(format!(
                "'{}' is already merged into '{}'; nothing to sync",
                desc.branch_name, desc.base_branch
            ));
            self.record(work_unit_id, strategy, AttemptState::Failed, &result);
            return Ok(result);
        }

        let head_before = self.git.current_commit(repo)?;
        let snapshot = SafetySnapshot::create(
            &self.git,
            repo,
            &self.config.snapshot_prefix,
            work_unit_id,
            &head_before,
        )?;
        let mut attempt = Attempt {
            snapshot,
            captured: LocalRecordChanges::default(),
            created: Vec::new(),
        };

        info!(work_unit_id, %strategy, snapshot = %attempt.snapshot.name, "reconciliation started");
        let outcome = self
            .capture_local_records(repo, &status, &mut attempt)
            .and_then(|()| body(&desc, &mut attempt));

        match outcome {
            Ok(mut result) => {
                result.snapshot = Some(attempt.snapshot.name.clone());
                if !self.config.retain_snapshots && !result.has_conflicts {
                    attempt.snapshot.discard(&self.git, repo);
                    result.snapshot = None;
                }
                let state = AttemptState::of(&result);
                info!(work_unit_id, %strategy, %state, files = result.files_changed, "reconciliation finished");
                self.record(work_unit_id, strategy, state, &result);
                Ok(result)
            }
            Err(cause) => {
                error!(work_unit_id, %strategy, error = %cause, "reconciliation failed, rolling back");
                let rollback_error = self.rollback(repo, &attempt).err().map(|e| {
                    error!(snapshot = %attempt.snapshot.name, error = %e, "rollback failed");
                    e.to_string()
                });
                let mut result = SyncResult::failed(cause.to_string());
                result.snapshot = Some(attempt.snapshot.name.clone());
                self.record(work_unit_id, strategy, AttemptState::RolledBack, &result);
                Err(SyncError::RolledBack {
                    snapshot: attempt.snapshot.name.clone(),
                    rollback_error,
                    source: Box::new(cause),
                })
            }
        }
    }

    fn reconciliation_lock(&self, desc: &WorkspaceDescriptor) -> Option<PathLockGuard> {
        if !self.config.serialize_reconciliation {
            return None;
        }
        let key = format!("sync:{}#{}", lock_key(&desc.repo_path), desc.base_branch);
        Some(self.locks.acquire_key(&key))
    }

    fn capture_local_records(
        &self,
        repo: &Path,
        status: &WorkingTreeStatus,
        attempt: &mut Attempt,
    ) -> Result<(), SyncError> {
        attempt.captured =
            LocalRecordChanges::capture(&self.git, repo, &status.uncommitted_record_files)?;
        attempt.captured.reset(&self.git, repo)
    }

    fn rollback(&self, repo: &Path, attempt: &Attempt) -> Result<(), SyncError> {
        self.git.reset_hard(repo, &attempt.snapshot.commit)?;
        for path in &attempt.created {
            if path.is_file() {
                fs::remove_file(path)?;
            }
        }
        attempt.captured.restore(repo)?;
        warn!(snapshot = %attempt.snapshot.name, "shared repository rolled back to snapshot");
        Ok(())
    }

    fn record(&self, work_unit_id: &str, strategy: SyncStrategy, state: AttemptState, result: &SyncResult) {
        if let Err(e) = self
            .store
            .record_result(work_unit_id, strategy, state, result)
        {
            warn!(work_unit_id, error = %e, "could not record sync result");
        }
    }

    /// Run the merge and settle record conflicts. Returns the conflicted
    /// paths that remain.
    fn merge_resolving_records(
        &self,
        desc: &WorkspaceDescriptor,
        mode: MergeMode,
    ) -> Result<Vec<String>, SyncError> {
        let repo = desc.repo_path.as_path();
        match self.git.merge(repo, &desc.branch_name, mode)? {
            MergeOutcome::Clean => Ok(Vec::new()),
            MergeOutcome::Conflicted(paths) => {
                info!(count = paths.len(), "merge conflicted, resolving record files");
                let summary = ConflictResolver::new(&self.git, &self.records, &self.merger)
                    .resolve_record_conflicts(repo)?;
                for detail in &summary.record_conflicts {
                    warn!(id = %detail.id, kept = ?detail.kept, "record changed on both sides");
                }
                Ok(summary.remaining)
            }
        }
    }

    fn conflicted_result(&self, paths: Vec<String>) -> SyncResult {
        warn!(paths = ?paths, "merge left conflicts for manual resolution");
        SyncResult {
            success: false,
            has_conflicts: true,
            error: Some(format!(
                "merge conflicts in {} file(s) need manual resolution",
                paths.len()
            )),
            files_with_conflicts: paths,
            ..Default::default()
        }
    }

    fn merge_and_commit(
        &self,
        desc: &WorkspaceDescriptor,
        attempt: &mut Attempt,
        mode: MergeMode,
        message: Option<&str>,
    ) -> Result<SyncResult, SyncError> {
        let repo = desc.repo_path.as_path();
        let remaining = self.merge_resolving_records(desc, mode)?;
        if !remaining.is_empty() {
            attempt.captured.reapply(repo, &self.merger)?;
            return Ok(self.conflicted_result(remaining));
        }

        let staged = self.git.staged_files(repo)?;
        if staged.is_empty() && mode == MergeMode::Squash {
            attempt.captured.reapply(repo, &self.merger)?;
            return Ok(SyncResult::failed(format!(
                "merging '{}' produced no changes",
                desc.branch_name
            )));
        }

        let message = match message {
            Some(m) => m.to_string(),
            None => self.default_message(desc, attempt, mode)?,
        };
        let final_commit = self.git.commit(repo, &message)?;
        let tie_broken = attempt.captured.reapply(repo, &self.merger)?;
        if !tie_broken.is_empty() {
            info!(ids = ?tie_broken, "local record edits overlapped merged records");
        }

        let files_changed = self
            .git
            .diff_summary(repo, &attempt.snapshot.commit, &final_commit)?
            .files
            .len();
        Ok(SyncResult {
            success: true,
            final_commit: Some(final_commit),
            files_changed,
            ..Default::default()
        })
    }

    fn default_message(
        &self,
        desc: &WorkspaceDescriptor,
        attempt: &Attempt,
        mode: MergeMode,
    ) -> Result<String, SyncError> {
        let repo = desc.repo_path.as_path();
        match mode {
            MergeMode::NoFastForward => Ok(format!(
                "Merge branch '{}' into {}",
                desc.branch_name, desc.base_branch
            )),
            MergeMode::Squash => {
                let commits =
                    self.git
                        .commit_list(repo, &attempt.snapshot.commit, &desc.branch_name)?;
                let mut message = format!(
                    "Squash merge '{}' into {} ({} commit(s))\n",
                    desc.branch_name,
                    desc.base_branch,
                    commits.len()
                );
                for commit in commits.iter().rev() {
                    let subject = commit.message.lines().next().unwrap_or("");
                    message.push_str(&format!("\n* {subject}"));
                }
                Ok(message)
            }
        }
    }

    fn merge_and_stage(
        &self,
        desc: &WorkspaceDescriptor,
        attempt: &mut Attempt,
        options: StageOptions,
    ) -> Result<SyncResult, SyncError> {
        let repo = desc.repo_path.as_path();
        let remaining = self.merge_resolving_records(desc, MergeMode::Squash)?;
        if !remaining.is_empty() {
            attempt.captured.reapply(repo, &self.merger)?;
            return Ok(self.conflicted_result(remaining));
        }
        attempt.captured.reapply(repo, &self.merger)?;

        let mut conflicts = Vec::new();
        let mut included = None;
        if options.include_uncommitted {
            let local = LocallyModified {
                squashed: self.git.staged_files(repo)?.into_iter().collect(),
                captured: attempt.captured.paths().map(str::to_string).collect(),
                override_captured: options.override_local_changes,
            };
            let (count, file_conflicts) = self.apply_workspace_uncommitted(desc, attempt, &local)?;
            included = Some(count);
            conflicts = file_conflicts;
        }

        let files_changed = self.git.staged_files(repo)?.len();
        info!(
            staged = files_changed,
            conflicts = conflicts.len(),
            "changes staged for manual commit"
        );
        Ok(SyncResult {
            success: conflicts.is_empty(),
            final_commit: None,
            files_changed,
            has_conflicts: !conflicts.is_empty(),
            error: (!conflicts.is_empty()).then(|| {
                format!(
                    "{} uncommitted workspace file(s) could not be merged cleanly",
                    conflicts.len()
                )
            }),
            files_with_conflicts: conflicts,
            uncommitted_files_included: included,
            snapshot: None,
        })
    }

    /// Bring the workspace's uncommitted files into the shared working copy.
    /// Returns how many were applied and which could not be merged cleanly.
    fn apply_workspace_uncommitted(
        &self,
        desc: &WorkspaceDescriptor,
        attempt: &mut Attempt,
        local: &LocallyModified,
    ) -> Result<(usize, Vec<String>), SyncError> {
        let repo = desc.repo_path.as_path();
        let worktree = desc.worktree_path.as_path();
        let files = self.git.uncommitted_files(worktree)?;

        let mut applied = 0;
        let mut conflicts = Vec::new();
        let mut to_stage = Vec::new();

        for file in files {
            let source = worktree.join(&file.path);
            let dest = repo.join(&file.path);
            let needs_merge = local.contains(&file.path) && dest.exists();
            // Base of every merge below: what the workspace last committed.
            let base = if needs_merge {
                self.git.show_file(worktree, "HEAD", &file.path)?
            } else {
                None
            };

            if file.deleted {
                if needs_merge && !same_content(&dest, base.as_deref())? {
                    warn!(path = %file.path, "workspace deleted a locally modified file, leaving it");
                    conflicts.push(file.path);
                    continue;
                }
                if dest.exists() {
                    fs::remove_file(&dest)?;
                }
                to_stage.push(file.path);
                applied += 1;
                continue;
            }

            if source.is_dir() {
                debug!(path = %file.path, "skipping directory entry");
                continue;
            }

            if !needs_merge {
                if !dest.exists() {
                    attempt.created.push(dest.clone());
                }
                copy_file(&source, &dest)?;
                to_stage.push(file.path);
                applied += 1;
                continue;
            }

            let (Some(theirs), Some(ours)) = (read_text(&source)?, read_text(&dest)?) else {
                warn!(path = %file.path, "binary file changed on both sides, keeping the shared copy");
                conflicts.push(file.path);
                continue;
            };
            if self.records.is_record_file(&file.path) {
                let (merged, _) = self.merger.merge_contents(base.as_deref(), &ours, &theirs)?;
                write_file(&dest, &merged)?;
                to_stage.push(file.path);
            } else {
                let result = Merger::three_way_merge(base.as_deref().unwrap_or(""), &ours, &theirs);
                write_file(&dest, &result.merged_content)?;
                if result.has_conflicts || has_conflict_markers(&result.merged_content) {
                    // Left unstaged so the markers stay visible.
                    conflicts.push(file.path);
                } else {
                    to_stage.push(file.path);
                }
            }
            applied += 1;
        }

        self.git.stage_paths(repo, &to_stage)?;
        info!(applied, conflicts = conflicts.len(), "workspace uncommitted files applied");
        Ok((applied, conflicts))
    }
}

/// Paths in the shared working copy that hold content a plain copy from
/// the workspace would destroy.
struct LocallyModified {
    /// Staged by the squash merge, so they already carry the target's changes.
    squashed: HashSet<String>,
    /// Local record edits replayed after the merge.
    captured: HashSet<String>,
    /// Overwrite `captured` files instead of merging into them.
    override_captured: bool,
}

impl LocallyModified {
    fn contains(&self, path: &str) -> bool {
        self.squashed.contains(path) || (!self.override_captured && self.captured.contains(path))
    }
}

/// File contents as text, or `None` if they are not UTF-8.
fn read_text(path: &Path) -> Result<Option<String>, SyncError> {
    Ok(String::from_utf8(fs::read(path)?).ok())
}

fn same_content(path: &Path, expected: Option<&str>) -> Result<bool, SyncError> {
    let Some(expected) = expected else {
        return Ok(false);
    };
    Ok(fs::read(path)? == expected.as_bytes())
}

fn copy_file(from: &Path, to: &Path) -> Result<(), SyncError> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(from, to)?;
    Ok(())
}

fn write_file(path: &Path, content: &str) -> Result<(), SyncError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, content)?;
    Ok(())
}
