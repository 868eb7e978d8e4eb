//! Conflict detection logic.
//!
//! Given a source (workspace) branch and a target branch, the detector diffs
//! both against their merge base and classifies every path changed on both
//! sides. Record files go to `record_conflicts` (they get a record-level
//! merge); anything else whose hunks cannot be combined goes to
//! `code_conflicts`. Detection never touches the working copy.

use std::collections::HashMap;
use std::path::Path;

use tracing::{debug, info, instrument};

use super::merger::Merger;
use crate::config::RecordConfig;
use crate::errors::GitError;
use crate::git::GitClient;
use crate::models::{ChangeKind, ConflictReport, DiffSummary, FileDiff, RecordConflict};

pub struct ConflictDetector {
    git: GitClient,
    records: RecordConfig,
}

impl ConflictDetector {
    pub fn new(git: GitClient, records: RecordConfig) -> Self {
        Self { git, records }
    }

    /// Predict what merging `source` into `target` would conflict on.
    #[instrument(skip(self), fields(repo = %repo_path.display()))]
    pub fn detect(
        &self,
        repo_path: &Path,
        source: &str,
        target: &str,
    ) -> Result<ConflictReport, GitError> {
        let base = self
            .git
            .merge_base(repo_path, source, target)?
            .ok_or_else(|| GitError::RefNotFound(format!("merge base of {source} and {target}")))?;

        let source_diff = self.git.diff_summary(repo_path, &base, source)?;
        let target_diff = self.git.diff_summary(repo_path, &base, target)?;
        self.classify(repo_path, &base, source, target, &source_diff, &target_diff)
    }

    fn classify(
        &self,
        repo_path: &Path,
        base: &str,
        source: &str,
        target: &str,
        source_diff: &DiffSummary,
        target_diff: &DiffSummary,
    ) -> Result<ConflictReport, GitError> {
        let target_changes: HashMap<&str, &FileDiff> = target_diff
            .files
            .iter()
            .flat_map(|f| touched_paths(f).into_iter().map(move |p| (p, f)))
            .collect();

        let mut report = ConflictReport {
            total_files: source_diff.files.len(),
            ..Default::default()
        };

        for change in &source_diff.files {
            let Some(theirs) = touched_paths(change)
                .into_iter()
                .find_map(|p| target_changes.get(p).copied())
            else {
                continue;
            };

            if self.records.is_record_file(&change.path) {
                debug!(path = %change.path, "record file changed on both sides");
                report.record_conflicts.push(RecordConflict {
                    file_path: change.path.clone(),
                });
                continue;
            }

            if self.is_code_conflict(repo_path, base, source, target, change, theirs)? {
                debug!(path = %change.path, "code conflict predicted");
                report.code_conflicts.push(change.path.clone());
            }
        }

        report.has_conflicts =
            !report.code_conflicts.is_empty() || !report.record_conflicts.is_empty();
        report.summary = summarize(&report);
        info!(
            total = report.total_files,
            code = report.code_conflicts.len(),
            records = report.record_conflicts.len(),
            "conflict detection complete"
        );
        Ok(report)
    }

    /// Whether the two sides' edits to one path cannot be combined by a
    /// line-based merge.
    fn is_code_conflict(
        &self,
        repo_path: &Path,
        base: &str,
        source: &str,
        target: &str,
        ours: &FileDiff,
        theirs: &FileDiff,
    ) -> Result<bool, GitError> {
        let ours_deleted = ours.change == ChangeKind::Deleted;
        let theirs_deleted = theirs.change == ChangeKind::Deleted;
        if ours_deleted && theirs_deleted {
            return Ok(false);
        }
        if ours_deleted != theirs_deleted {
            // Edit on one side, delete on the other.
            return Ok(true);
        }

        let base_path = match &ours.change {
            ChangeKind::Renamed { from } => from.as_str(),
            _ => ours.path.as_str(),
        };
        let base_content = self.git.show_file(repo_path, base, base_path)?;
        let source_content = self.git.show_file(repo_path, source, &ours.path)?;
        let target_content = self.git.show_file(repo_path, target, &theirs.path)?;

        match (source_content, target_content) {
            (Some(s), Some(t)) if s == t => Ok(false),
            (Some(_), Some(_)) if ours.is_binary || theirs.is_binary => Ok(true),
            (Some(s), Some(t)) => Ok(!Merger::can_auto_merge(
                base_content.as_deref().unwrap_or(""),
                &t,
                &s,
            )),
            _ => Ok(true),
        }
    }
}

fn touched_paths(change: &FileDiff) -> Vec<&str> {
    match &change.change {
        ChangeKind::Renamed { from } => vec![change.path.as_str(), from.as_str()],
        _ => vec![change.path.as_str()],
    }
}

fn summarize(report: &ConflictReport) -> String {
    if !report.has_conflicts {
        return format!("{} file(s) changed, no conflicts", report.total_files);
    }
    let mut parts = vec![format!("{} file(s) changed", report.total_files)];
    if !report.code_conflicts.is_empty() {
        parts.push(format!(
            "{} file(s) with conflicting edits",
            report.code_conflicts.len()
        ));
    }
    if !report.record_conflicts.is_empty() {
        parts.push(format!(
            "{} record file(s) need a record merge",
            report.record_conflicts.len()
        ));
    }
    parts.join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{commit_file, git, git_available, init_repo};

    fn detector() -> ConflictDetector {
        ConflictDetector::new(GitClient::default(), RecordConfig::default())
    }

    #[test]
    fn test_summary_text() {
        let mut report = ConflictReport {
            total_files: 3,
            ..Default::default()
        };
        assert_eq!(summarize(&report), "3 file(s) changed, no conflicts");
        report.has_conflicts = true;
        report.code_conflicts.push("src/lib.rs".into());
        assert_eq!(
            summarize(&report),
            "3 file(s) changed, 1 file(s) with conflicting edits"
        );
    }

    #[test]
    fn test_detect_classifies_paths() {
        if !git_available() {
            eprintln!("SKIP: git not installed");
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path();
        init_repo(repo);
        commit_file(repo, "shared.txt", "one\ntwo\nthree\n", "add shared");
        commit_file(repo, "far.txt", "a\nb\nc\nd\ne\nf\ng\nh\n", "add far");
        commit_file(repo, ".tracker/issues.jsonl", "{\"uuid\":\"1\"}\n", "add records");

        git(repo, &["checkout", "-q", "-b", "feature"]);
        commit_file(repo, "shared.txt", "one\nFEATURE\nthree\n", "feature edit");
        commit_file(repo, "far.txt", "A\nb\nc\nd\ne\nf\ng\nh\n", "feature far");
        commit_file(repo, ".tracker/issues.jsonl", "{\"uuid\":\"1\",\"s\":\"f\"}\n", "feature rec");
        commit_file(repo, "only-feature.txt", "x\n", "feature only");

        git(repo, &["checkout", "-q", "main"]);
        commit_file(repo, "shared.txt", "one\nMAIN\nthree\n", "main edit");
        commit_file(repo, "far.txt", "a\nb\nc\nd\ne\nf\ng\nH\n", "main far");
        commit_file(repo, ".tracker/issues.jsonl", "{\"uuid\":\"1\",\"s\":\"m\"}\n", "main rec");

        let report = detector().detect(repo, "feature", "main").unwrap();
        assert!(report.has_conflicts);
        assert_eq!(report.total_files, 4);
        assert_eq!(report.code_conflicts, vec!["shared.txt".to_string()]);
        assert_eq!(
            report.record_conflicts,
            vec![RecordConflict {
                file_path: ".tracker/issues.jsonl".into()
            }]
        );
    }

    #[test]
    fn test_detect_edit_delete() {
        if !git_available() {
            eprintln!("SKIP: git not installed");
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path();
        init_repo(repo);
        commit_file(repo, "doomed.txt", "keep me\n", "add");
        git(repo, &["checkout", "-q", "-b", "feature"]);
        commit_file(repo, "doomed.txt", "edited\n", "edit");
        git(repo, &["checkout", "-q", "main"]);
        git(repo, &["rm", "-q", "doomed.txt"]);
        git(repo, &["commit", "-q", "-m", "delete"]);

        let report = detector().detect(repo, "feature", "main").unwrap();
        assert_eq!(report.code_conflicts, vec!["doomed.txt".to_string()]);
    }
}
