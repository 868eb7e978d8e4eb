//! Automatic resolution of record-file conflicts left by a git merge.
//!
//! After `git merge` stops with unmerged paths, every conflicted record file
//! is rebuilt from its three index stages with the [`RecordMerger`], written
//! back, and staged. Other paths are left exactly as git left them.

use std::fs;
use std::path::Path;

use tracing::{debug, info, instrument};

use super::records::{RecordConflictDetail, RecordMerger};
use crate::config::RecordConfig;
use crate::errors::SyncError;
use crate::git::GitClient;

/// What [`ConflictResolver::resolve_record_conflicts`] managed to fix.
#[derive(Debug, Clone, Default)]
pub struct ResolutionSummary {
    /// Record files merged and staged.
    pub resolved: Vec<String>,
    /// Conflicted paths that are not record files.
    pub remaining: Vec<String>,
    pub tie_broken: Vec<String>,
    pub record_conflicts: Vec<RecordConflictDetail>,
}

pub struct ConflictResolver<'a> {
    git: &'a GitClient,
    records: &'a RecordConfig,
    merger: &'a RecordMerger,
}

impl<'a> ConflictResolver<'a> {
    pub fn new(git: &'a GitClient, records: &'a RecordConfig, merger: &'a RecordMerger) -> Self {
        Self {
            git,
            records,
            merger,
        }
    }

    #[instrument(skip(self), fields(repo = %repo_path.display()))]
    pub fn resolve_record_conflicts(&self, repo_path: &Path) -> Result<ResolutionSummary, SyncError> {
        let mut summary = ResolutionSummary::default();

        for path in self.git.conflicted_paths(repo_path)? {
            if !self.records.is_record_file(&path) {
                summary.remaining.push(path);
                continue;
            }

            let stages = self.git.conflict_stages(repo_path, &path)?;
            // A side that deleted the file deleted every record in it.
            let (merged, outcome) = self.merger.merge_contents(
                stages.base.as_deref(),
                stages.ours.as_deref().unwrap_or(""),
                stages.theirs.as_deref().unwrap_or(""),
            )?;

            let full = repo_path.join(&path);
            if let Some(parent) = full.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&full, merged)?;
            self.git.stage_paths(repo_path, std::slice::from_ref(&path))?;
            debug!(path = %path, records = outcome.records.len(), "record conflict resolved");

            summary.tie_broken.extend(outcome.tie_broken);
            summary.record_conflicts.extend(outcome.conflicts);
            summary.resolved.push(path);
        }

        info!(
            resolved = summary.resolved.len(),
            remaining = summary.remaining.len(),
            "record conflict resolution finished"
        );
        Ok(summary)
    }
}
