//! Safety snapshots: lightweight tags pinned to the target branch's commit
//! before a reconciliation attempt changes anything.

use std::path::Path;

use chrono::Utc;
use tracing::{info, warn};

use crate::errors::GitError;
use crate::git::GitClient;

/// Immutable rollback target for one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafetySnapshot {
    /// Tag name, without `refs/tags/`.
    pub name: String,
    pub commit: String,
}

impl SafetySnapshot {
    /// Tag `commit` under a name unique to this attempt.
    pub fn create(
        git: &GitClient,
        repo_path: &Path,
        prefix: &str,
        work_unit_id: &str,
        commit: &str,
    ) -> Result<Self, GitError> {
        let stem = format!(
            "{}/{}-{}",
            prefix,
            sanitize_ref_component(work_unit_id),
            Utc::now().timestamp_millis()
        );

        let mut name = stem.clone();
        let mut suffix = 1;
        while git.tag_target(repo_path, &name)?.is_some() {
            suffix += 1;
            name = format!("{stem}-{suffix}");
        }

        git.create_tag(repo_path, &name, commit)?;
        info!(snapshot = %name, commit, "created safety snapshot");
        Ok(Self {
            name,
            commit: commit.to_string(),
        })
    }

    /// Remove the tag. Failures are logged only.
    pub fn discard(&self, git: &GitClient, repo_path: &Path) {
        if let Err(e) = git.delete_tag(repo_path, &self.name) {
            warn!(snapshot = %self.name, error = %e, "could not delete safety snapshot");
        }
    }
}

/// Make a work-unit identifier usable inside a ref name.
pub(crate) fn sanitize_ref_component(id: &str) -> String {
    let cleaned: String = id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '-'
            }
        })
        .collect();
    let cleaned = cleaned.trim_matches(|c| c == '.' || c == '-').replace("..", "-");
    if cleaned.is_empty() {
        "unit".to_string()
    } else {
        cleaned
    }
}
