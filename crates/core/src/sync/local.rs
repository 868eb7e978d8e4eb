//! Uncommitted record-file edits in the shared working copy.
//!
//! Before a merge these edits are captured and the files put back to their
//! committed state so git's merge machinery never sees them. Afterwards
//! they are replayed with a record-level three-way merge against whatever
//! the merge produced. On rollback they are restored verbatim.

use std::fs;
use std::path::Path;

use tracing::{debug, info};

use crate::conflict::RecordMerger;
use crate::errors::SyncError;
use crate::git::GitClient;

#[derive(Debug, Clone)]
struct CapturedFile {
    path: String,
    /// Content at `HEAD` before the attempt (`None` if untracked).
    committed: Option<String>,
    /// Working-copy content (`None` if deleted locally).
    local: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct LocalRecordChanges {
    files: Vec<CapturedFile>,
}

impl LocalRecordChanges {
    pub(crate) fn capture(
        git: &GitClient,
        repo_path: &Path,
        paths: &[String],
    ) -> Result<Self, SyncError> {
        let mut files = Vec::with_capacity(paths.len());
        for path in paths {
            let full = repo_path.join(path);
            let local = if full.is_file() {
                Some(fs::read_to_string(&full)?)
            } else {
                None
            };
            files.push(CapturedFile {
                path: path.clone(),
                committed: git.show_file(repo_path, "HEAD", path)?,
                local,
            });
        }
        if !files.is_empty() {
            info!(count = files.len(), "captured local record changes");
        }
        Ok(Self { files })
    }

    pub(crate) fn paths(&self) -> impl Iterator<Item = &str> {
        self.files.iter().map(|f| f.path.as_str())
    }

    /// Put every captured file back to its committed state.
    pub(crate) fn reset(&self, git: &GitClient, repo_path: &Path) -> Result<(), SyncError> {
        for file in &self.files {
            git.restore_from_head(repo_path, &file.path)?;
        }
        Ok(())
    }

    /// Merge the captured edits into the post-merge working copy.
    /// Returns identifiers that needed a tie-break.
    pub(crate) fn reapply(
        &self,
        repo_path: &Path,
        merger: &RecordMerger,
    ) -> Result<Vec<String>, SyncError> {
        let mut tie_broken = Vec::new();
        for file in &self.files {
            let full = repo_path.join(&file.path);
            let merged_side = if full.is_file() {
                Some(fs::read_to_string(&full)?)
            } else {
                None
            };

            let (content, outcome) = merger.merge_contents(
                file.committed.as_deref(),
                file.local.as_deref().unwrap_or(""),
                merged_side.as_deref().unwrap_or(""),
            )?;
            tie_broken.extend(outcome.tie_broken);

            if content.is_empty() && file.local.is_none() {
                if full.exists() {
                    fs::remove_file(&full)?;
                }
            } else {
                if let Some(parent) = full.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(&full, content)?;
            }
            debug!(path = %file.path, "reapplied local record changes");
        }
        Ok(tie_broken)
    }

    /// Write the captured working-copy contents back exactly.
    pub(crate) fn restore(&self, repo_path: &Path) -> Result<(), SyncError> {
        for file in &self.files {
            let full = repo_path.join(&file.path);
            match &file.local {
                Some(content) => {
                    if let Some(parent) = full.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    fs::write(&full, content)?;
                }
                None => {
                    if full.exists() {
                        fs::remove_file(&full)?;
                    }
                }
            }
        }
        Ok(())
    }
}
