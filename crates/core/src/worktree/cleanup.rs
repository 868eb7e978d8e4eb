//! Best-effort worktree teardown.
//!
//! Cleanup runs an ordered list of independent steps. A failing step is
//! recorded and logged, and the next step runs anyway: the aim is maximal
//! forward progress even when git's view of the worktree is inconsistent.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::lock::normalize_path;

/// Outcome of one cleanup step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepOutcome {
    Succeeded,
    Skipped { reason: String },
    Failed { error: String },
}

impl StepOutcome {
    pub fn skipped(reason: impl Into<String>) -> Self {
        Self::Skipped {
            reason: reason.into(),
        }
    }

    /// Map any result into an outcome.
    pub fn from_result<E: std::fmt::Display>(result: Result<(), E>) -> Self {
        match result {
            Ok(()) => Self::Succeeded,
            Err(e) => Self::Failed {
                error: e.to_string(),
            },
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupStep {
    pub name: String,
    pub outcome: StepOutcome,
}

/// Per-step record of one cleanup run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CleanupReport {
    pub worktree_path: PathBuf,
    /// Repository the worktree belonged to, if it was given or inferred.
    pub repo_path: Option<PathBuf>,
    /// Branch the worktree had checked out, when it was still registered.
    pub branch: Option<String>,
    pub steps: Vec<CleanupStep>,
}

impl CleanupReport {
    pub fn new(worktree_path: &Path, repo_path: Option<PathBuf>) -> Self {
        Self {
            worktree_path: worktree_path.to_path_buf(),
            repo_path,
            branch: None,
            steps: Vec::new(),
        }
    }

    /// Steps that were attempted (not skipped).
    pub fn attempted(&self) -> impl Iterator<Item = &CleanupStep> {
        self.steps
            .iter()
            .filter(|s| !matches!(s.outcome, StepOutcome::Skipped { .. }))
    }

    pub fn failed(&self) -> impl Iterator<Item = &CleanupStep> {
        self.steps.iter().filter(|s| s.outcome.is_failed())
    }

    /// True when at least one step ran and every step that ran failed.
    pub fn all_failed(&self) -> bool {
        let mut attempted = self.attempted().peekable();
        attempted.peek().is_some() && attempted.all(|s| s.outcome.is_failed())
    }

    pub fn outcome_of(&self, name: &str) -> Option<&StepOutcome> {
        self.steps.iter().find(|s| s.name == name).map(|s| &s.outcome)
    }

    /// One line per failed step, for error messages.
    pub fn failure_summary(&self) -> String {
        self.failed()
            .map(|s| match &s.outcome {
                StepOutcome::Failed { error } => format!("{}: {}", s.name, error),
                _ => s.name.clone(),
            })
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// A named cleanup action.
pub(crate) type Step<'a> = (&'static str, Box<dyn FnOnce() -> StepOutcome + 'a>);

pub(crate) fn step<'a>(name: &'static str, action: impl FnOnce() -> StepOutcome + 'a) -> Step<'a> {
    (name, Box::new(action))
}

/// Run every step in order, recording each outcome.
pub(crate) fn run_steps(report: &mut CleanupReport, steps: Vec<Step<'_>>) {
    for (name, action) in steps {
        let outcome = action();
        match &outcome {
            StepOutcome::Succeeded => {
                debug!(step = name, path = %report.worktree_path.display(), "cleanup step done")
            }
            StepOutcome::Skipped { reason } => {
                debug!(step = name, reason = %reason, "cleanup step skipped")
            }
            StepOutcome::Failed { error } => warn!(
                step = name,
                path = %report.worktree_path.display(),
                error = %error,
                "cleanup step failed, continuing"
            ),
        }
        report.steps.push(CleanupStep {
            name: name.to_string(),
            outcome,
        });
    }
    let failed = report.failed().count();
    info!(
        path = %report.worktree_path.display(),
        steps = report.steps.len(),
        failed,
        "worktree cleanup finished"
    );
}

/// Locate the per-worktree admin directory under `<common_dir>/worktrees`.
///
/// The worktree's `.git` file names it directly; when the checkout is gone
/// each admin directory's `gitdir` file is matched back against the path.
pub(crate) fn find_metadata_dir(common_dir: &Path, worktree_path: &Path) -> Option<PathBuf> {
    let admin_root = normalize_path(&common_dir.join("worktrees"));

    if let Ok(content) = fs::read_to_string(worktree_path.join(".git")) {
        if let Some(dir) = content.trim().strip_prefix("gitdir:") {
            let candidate = normalize_path(Path::new(dir.trim()));
            if candidate.starts_with(&admin_root) && candidate.is_dir() {
                return Some(candidate);
            }
        }
    }

    let target = normalize_path(&worktree_path.join(".git"));
    let entries = fs::read_dir(&admin_root).ok()?;
    for entry in entries.flatten() {
        let Ok(gitdir) = fs::read_to_string(entry.path().join("gitdir")) else {
            continue;
        };
        if normalize_path(Path::new(gitdir.trim())) == target {
            return Some(entry.path());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report_with(outcomes: Vec<StepOutcome>) -> CleanupReport {
        let mut report = CleanupReport::new(Path::new("/w"), None);
        for (i, outcome) in outcomes.into_iter().enumerate() {
            report.steps.push(CleanupStep {
                name: format!("step{i}"),
                outcome,
            });
        }
        report
    }

    #[test]
    fn test_all_failed_ignores_skipped_steps() {
        let report = report_with(vec![
            StepOutcome::Failed { error: "a".into() },
            StepOutcome::skipped("no repo"),
            StepOutcome::Failed { error: "b".into() },
        ]);
        assert!(report.all_failed());
        assert_eq!(report.failure_summary(), "step0: a; step2: b");

        let report = report_with(vec![
            StepOutcome::Failed { error: "a".into() },
            StepOutcome::Succeeded,
        ]);
        assert!(!report.all_failed());

        let report = report_with(vec![StepOutcome::skipped("x")]);
        assert!(!report.all_failed());
    }

    #[test]
    fn test_run_steps_continues_after_failure() {
        let mut report = CleanupReport::new(Path::new("/w"), None);
        let mut ran_last = false;
        run_steps(
            &mut report,
            vec![
                step("first", || StepOutcome::from_result(Err::<(), _>("boom"))),
                step("second", || {
                    ran_last = true;
                    StepOutcome::Succeeded
                }),
            ],
        );
        assert!(ran_last);
        assert!(report.outcome_of("first").unwrap().is_failed());
        assert_eq!(report.outcome_of("second"), Some(&StepOutcome::Succeeded));
    }

    #[test]
    fn test_find_metadata_dir_by_gitdir_backlink() {
        let dir = tempfile::tempdir().unwrap();
        let common = dir.path().join("repo/.git");
        let admin = common.join("worktrees/feature");
        fs::create_dir_all(&admin).unwrap();
        let worktree = dir.path().join("wt");
        // Checkout deleted; only the backlink remains.
        fs::write(admin.join("gitdir"), format!("{}\n", worktree.join(".git").display()))
            .unwrap();

        let found = find_metadata_dir(&common, &worktree).unwrap();
        assert_eq!(found.file_name().unwrap(), "feature");
        assert!(find_metadata_dir(&common, &dir.path().join("other")).is_none());
    }

    #[test]
    fn test_outcome_serializes_with_status_tag() {
        let json = serde_json::to_value(StepOutcome::skipped("no branch")).unwrap();
        assert_eq!(json["status"], "skipped");
        assert_eq!(json["reason"], "no branch");
    }
}
