//! Synchronization of isolated workspaces back into the shared repository.

mod local;
pub mod orchestrator;
pub mod snapshot;
pub mod store;

pub use orchestrator::SyncOrchestrator;
pub use snapshot::SafetySnapshot;
pub use store::{DescriptorStore, InMemoryDescriptors};

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;
    use std::sync::Arc;

    use super::*;
    use crate::config::{RecordConfig, SyncConfig};
    use crate::errors::SyncError;
    use crate::git::{GitClient, WorktreeOps};
    use crate::lock::PathLockRegistry;
    use crate::models::{StageOptions, WorkspaceDescriptor};
    use crate::test_support::{commit_file, git, git_available, init_repo};

    /// Shared repo on `main` plus a worktree for branch `feature` outside it.
    fn setup(dir: &Path) -> (WorkspaceDescriptor, SyncOrchestrator<InMemoryDescriptors>) {
        let repo = dir.join("repo");
        init_repo(&repo);
        let worktree = dir.join("wt");
        git(&repo, &["branch", "feature"]);
        git(&repo, &["worktree", "add", "-q", worktree.to_str().unwrap(), "feature"]);

        let desc = WorkspaceDescriptor {
            repo_path: repo,
            branch_name: "feature".into(),
            worktree_path: worktree,
            base_branch: "main".into(),
            create_branch: false,
            base_commit: None,
        };
        let store = InMemoryDescriptors::new();
        store.insert("unit", desc.clone());
        let orchestrator = SyncOrchestrator::new(
            GitClient::default(),
            store,
            SyncConfig::default(),
            RecordConfig::default(),
            Arc::new(PathLockRegistry::new()),
        );
        (desc, orchestrator)
    }

    #[test]
    fn test_preview_blocks_on_missing_workspace() {
        if !git_available() {
            eprintln!("SKIP: git not installed");
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let (desc, orchestrator) = setup(dir.path());
        fs::remove_dir_all(&desc.worktree_path).unwrap();

        let preview = orchestrator.preview("unit").unwrap();
        assert!(!preview.can_sync);
        assert!(preview.warnings[0].contains("does not exist"));
        assert!(preview.merge_base.is_none());

        assert!(matches!(
            orchestrator.preview("nobody"),
            Err(SyncError::WorkspaceNotFound(_))
        ));
    }

    #[test]
    fn test_preview_blocks_on_dirty_shared_repo() {
        if !git_available() {
            eprintln!("SKIP: git not installed");
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let (desc, orchestrator) = setup(dir.path());
        commit_file(&desc.worktree_path, "a.txt", "a\n", "add a");
        fs::write(desc.repo_path.join("README.md"), "local edit\n").unwrap();

        let preview = orchestrator.preview("unit").unwrap();
        assert!(!preview.can_sync);
        assert!(preview.warnings.iter().any(|w| w.contains("README.md")));

        let err = orchestrator.squash_sync("unit", None).unwrap_err();
        assert!(matches!(err, SyncError::Precondition(_)));
    }

    #[test]
    fn test_squash_reapplies_local_record_edits() {
        if !git_available() {
            eprintln!("SKIP: git not installed");
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let (desc, orchestrator) = setup(dir.path());
        let records = ".tracker/issues.jsonl";
        let repo = desc.repo_path.as_path();

        commit_file(repo, records, "{\"uuid\":\"1\"}\n", "records on main");
        git(&desc.worktree_path, &["merge", "-q", "main"]);
        commit_file(
            &desc.worktree_path,
            records,
            "{\"uuid\":\"1\"}\n{\"uuid\":\"agent\"}\n",
            "agent record",
        );
        // Uncommitted local record edit in the shared repo.
        fs::write(repo.join(records), "{\"uuid\":\"1\"}\n{\"uuid\":\"local\"}\n").unwrap();

        let preview = orchestrator.preview("unit").unwrap();
        assert!(preview.can_sync, "{:?}", preview.warnings);
        assert_eq!(preview.potential_local_conflicts.count, 1);

        let result = orchestrator.squash_sync("unit", Some("sync agent work")).unwrap();
        assert!(result.success);
        let committed = git(repo, &["show", &format!("HEAD:{records}")]);
        assert_eq!(committed, "{\"uuid\":\"1\"}\n{\"uuid\":\"agent\"}");
        let working = fs::read_to_string(repo.join(records)).unwrap();
        assert_eq!(working, "{\"uuid\":\"1\"}\n{\"uuid\":\"local\"}\n{\"uuid\":\"agent\"}\n");
        assert_eq!(git(repo, &["log", "-1", "--format=%s"]), "sync agent work");
    }

    #[test]
    fn test_already_merged_is_a_no_op_failure() {
        if !git_available() {
            eprintln!("SKIP: git not installed");
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let (desc, orchestrator) = setup(dir.path());
        commit_file(&desc.worktree_path, "a.txt", "a\n", "add a");

        assert!(orchestrator.preserve_sync("unit").unwrap().success);
        let head = git(&desc.repo_path, &["rev-parse", "HEAD"]);
        // Two parents: history preserved.
        assert_eq!(
            git(&desc.repo_path, &["rev-list", "--parents", "-n", "1", "HEAD"])
                .split_whitespace()
                .count(),
            3
        );

        let again = orchestrator.squash_sync("unit", None).unwrap();
        assert!(!again.success);
        assert!(again.error.unwrap().contains("already merged"));
        assert_eq!(git(&desc.repo_path, &["rev-parse", "HEAD"]), head);
        assert_eq!(orchestrator.store().history().len(), 2);
    }

    #[test]
    fn test_stage_sync_with_uncommitted_files() {
        if !git_available() {
            eprintln!("SKIP: git not installed");
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let (desc, orchestrator) = setup(dir.path());
        let repo = desc.repo_path.as_path();
        commit_file(&desc.worktree_path, "committed.txt", "c\n", "committed work");
        fs::write(desc.worktree_path.join("draft.txt"), "draft\n").unwrap();

        let head_before = orchestrator_head(repo);
        let result = orchestrator
            .stage_sync(
                "unit",
                StageOptions {
                    include_uncommitted: true,
                    override_local_changes: false,
                },
            )
            .unwrap();

        assert!(result.success);
        assert!(result.final_commit.is_none());
        assert_eq!(result.uncommitted_files_included, Some(1));
        assert_eq!(result.files_changed, 2);
        assert_eq!(orchestrator_head(repo), head_before);
        let staged = git(repo, &["diff", "--cached", "--name-only"]);
        assert!(staged.contains("committed.txt") && staged.contains("draft.txt"));
    }

    fn include_uncommitted() -> StageOptions {
        StageOptions {
            include_uncommitted: true,
            override_local_changes: false,
        }
    }

    /// Commit a six-line `f.txt` on `main` and bring it into the workspace.
    fn shared_lines_file(desc: &WorkspaceDescriptor) {
        commit_file(&desc.repo_path, "f.txt", "a\nb\nc\nd\ne\nf\n", "add f");
        git(&desc.worktree_path, &["merge", "-q", "main"]);
    }

    #[test]
    fn test_stage_sync_merges_uncommitted_edit_into_squashed_file() {
        if !git_available() {
            eprintln!("SKIP: git not installed");
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let (desc, orchestrator) = setup(dir.path());
        let repo = desc.repo_path.as_path();
        shared_lines_file(&desc);

        commit_file(repo, "f.txt", "A-main\nb\nc\nd\ne\nf\n", "edit line 1 on main");
        commit_file(&desc.worktree_path, "f.txt", "a\nb\nc\nd\ne\nF-ws\n", "edit line 6");
        fs::write(
            desc.worktree_path.join("f.txt"),
            "a\nb\nc\nd\ne\nF-ws\ng-uncommitted\n",
        )
        .unwrap();

        let result = orchestrator.stage_sync("unit", include_uncommitted()).unwrap();
        assert!(result.success, "{:?}", result.error);
        assert!(result.files_with_conflicts.is_empty());
        assert_eq!(
            fs::read_to_string(repo.join("f.txt")).unwrap(),
            "A-main\nb\nc\nd\ne\nF-ws\ng-uncommitted\n"
        );
        assert_eq!(git(repo, &["diff", "--name-only"]), "");
        assert_eq!(git(repo, &["diff", "--cached", "--name-only"]), "f.txt");
    }

    #[test]
    fn test_stage_sync_leaves_conflicted_uncommitted_file_unstaged() {
        if !git_available() {
            eprintln!("SKIP: git not installed");
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let (desc, orchestrator) = setup(dir.path());
        let repo = desc.repo_path.as_path();
        shared_lines_file(&desc);

        commit_file(repo, "f.txt", "a\nb\nc\nd\ne\nF-main\n", "edit line 6 on main");
        commit_file(&desc.worktree_path, "f.txt", "A-ws\nb\nc\nd\ne\nf\n", "edit line 1");
        fs::write(desc.worktree_path.join("f.txt"), "A-ws\nb\nc\nd\ne\nF-draft\n").unwrap();
        let head_before = orchestrator_head(repo);

        let result = orchestrator.stage_sync("unit", include_uncommitted()).unwrap();
        assert!(!result.success);
        assert!(result.has_conflicts);
        assert_eq!(result.files_with_conflicts, vec!["f.txt"]);
        assert_eq!(orchestrator_head(repo), head_before);

        let working = fs::read_to_string(repo.join("f.txt")).unwrap();
        assert!(working.contains("<<<<<<<"));
        assert!(working.contains("F-main") && working.contains("F-draft"));
        // The index still holds the clean squash result.
        assert_eq!(
            git(repo, &["show", ":f.txt"]),
            "A-ws\nb\nc\nd\ne\nF-main"
        );
        assert_eq!(git(repo, &["diff", "--name-only"]), "f.txt");
    }

    #[test]
    fn test_stage_sync_merges_uncommitted_records_with_local_edits() {
        if !git_available() {
            eprintln!("SKIP: git not installed");
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let (desc, orchestrator) = setup(dir.path());
        let records = ".tracker/issues.jsonl";
        let repo = desc.repo_path.as_path();

        commit_file(repo, records, "{\"uuid\":\"1\"}\n", "records on main");
        git(&desc.worktree_path, &["merge", "-q", "main"]);
        commit_file(&desc.worktree_path, "work.txt", "w\n", "agent work");
        fs::write(
            desc.worktree_path.join(records),
            "{\"uuid\":\"1\"}\n{\"uuid\":\"agent\"}\n",
        )
        .unwrap();
        fs::write(repo.join(records), "{\"uuid\":\"1\"}\n{\"uuid\":\"local\"}\n").unwrap();

        let result = orchestrator.stage_sync("unit", include_uncommitted()).unwrap();
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.uncommitted_files_included, Some(1));
        assert_eq!(
            fs::read_to_string(repo.join(records)).unwrap(),
            "{\"uuid\":\"1\"}\n{\"uuid\":\"local\"}\n{\"uuid\":\"agent\"}\n"
        );
        let staged = git(repo, &["diff", "--cached", "--name-only"]);
        assert!(staged.contains("work.txt") && staged.contains(records));
    }

    #[test]
    fn test_stage_sync_copies_binary_uncommitted_file() {
        if !git_available() {
            eprintln!("SKIP: git not installed");
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let (desc, orchestrator) = setup(dir.path());
        let repo = desc.repo_path.as_path();
        let bytes = [0x89u8, b'P', b'N', b'G', 0x00, 0xff, 0xfe, 0x80];
        commit_file(&desc.worktree_path, "a.txt", "a\n", "add a");
        fs::write(desc.worktree_path.join("logo.png"), bytes).unwrap();

        let result = orchestrator.stage_sync("unit", include_uncommitted()).unwrap();
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.uncommitted_files_included, Some(1));
        assert_eq!(fs::read(repo.join("logo.png")).unwrap(), bytes);
    }

    fn orchestrator_head(repo: &Path) -> String {
        GitClient::default().current_commit(repo).unwrap()
    }
}
