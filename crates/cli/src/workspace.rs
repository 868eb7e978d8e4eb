//! `wtsync workspace ...` subcommands.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Subcommand;
use comfy_table::{presets::UTF8_FULL, Cell, ContentArrangement, Table};

use wtsync_core::git::GitClient;
use wtsync_core::models::WorkspaceDescriptor;
use wtsync_core::worktree::{CreateWorktreeParams, EnsureOutcome, StepOutcome, WorkspaceManager};

use crate::{style, truncate, AppContext};

#[derive(Subcommand, Debug)]
pub enum WorkspaceAction {
    /// Create a worktree for a work unit and remember it.
    Create {
        /// Shared repository.
        repo: PathBuf,
        /// Work unit identifier.
        id: String,
        /// Branch the work is reconciled into.
        #[arg(long, default_value = "main")]
        base: String,
        /// Branch name (default: `<branch_prefix>/<id>`).
        #[arg(long)]
        branch: Option<String>,
        /// Worktree location (default: `<storage_dir>/<id>`).
        #[arg(long)]
        path: Option<PathBuf>,
        /// Use an existing branch instead of creating one.
        #[arg(long)]
        existing_branch: bool,
    },
    /// Recreate a remembered workspace if it is missing or broken.
    Ensure {
        /// Work unit identifier.
        id: String,
    },
    /// Report whether a remembered workspace is valid.
    Check {
        /// Work unit identifier.
        id: String,
    },
    /// Tear down a workspace.
    Cleanup {
        /// Work unit identifier.
        id: String,
        /// Keep the database entry.
        #[arg(long)]
        keep_record: bool,
    },
    /// List remembered workspaces, or the worktrees git knows about in a
    /// repository.
    List {
        /// Repository to ask git about instead of the database.
        #[arg(long)]
        repo: Option<PathBuf>,
    },
    /// List local branches of a repository.
    Branches {
        /// Repository.
        repo: PathBuf,
    },
}

pub fn run(ctx: &AppContext, action: WorkspaceAction) -> Result<()> {
    let manager = WorkspaceManager::new(
        GitClient::new(&ctx.config.git),
        ctx.locks.clone(),
        ctx.config.worktree.clone(),
    );

    match action {
        WorkspaceAction::Create {
            repo,
            id,
            base,
            branch,
            path,
            existing_branch,
        } => cmd_create(ctx, &manager, &repo, &id, base, branch, path, existing_branch),
        WorkspaceAction::Ensure { id } => cmd_ensure(ctx, &manager, &id),
        WorkspaceAction::Check { id } => cmd_check(ctx, &manager, &id),
        WorkspaceAction::Cleanup { id, keep_record } => cmd_cleanup(ctx, &manager, &id, keep_record),
        WorkspaceAction::List { repo } => match repo {
            Some(repo) => cmd_list_git(&manager, &repo),
            None => cmd_list_db(ctx),
        },
        WorkspaceAction::Branches { repo } => {
            let branches = manager
                .list_branches(&absolute(&repo)?)
                .context("failed to list branches")?;
            for b in branches {
                println!("{}", b);
            }
            Ok(())
        }
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    std::path::absolute(path).with_context(|| format!("invalid path '{}'", path.display()))
}

fn descriptor(ctx: &AppContext, id: &str) -> Result<WorkspaceDescriptor> {
    Ok(ctx
        .db
        .require_workspace(id)
        .with_context(|| format!("unknown work unit '{}'", id))?
        .descriptor)
}

#[allow(clippy::too_many_arguments)]
fn cmd_create(
    ctx: &AppContext,
    manager: &WorkspaceManager,
    repo: &Path,
    id: &str,
    base: String,
    branch: Option<String>,
    path: Option<PathBuf>,
    existing_branch: bool,
) -> Result<()> {
    let repo = absolute(repo)?;
    let mut desc = manager.descriptor_for(&repo, id, &base);
    if let Some(branch) = branch {
        desc.branch_name = branch;
    }
    if let Some(path) = path {
        desc.worktree_path = absolute(&path)?;
    }
    desc.create_branch = !existing_branch;
    if desc.create_branch {
        desc.base_commit = manager
            .git()
            .resolve_commit(&repo, &base)
            .context("failed to resolve base branch")?;
        if desc.base_commit.is_none() {
            anyhow::bail!("base branch '{}' not found in {}", base, repo.display());
        }
    }

    manager
        .create(&CreateWorktreeParams::from(&desc))
        .context("failed to create workspace")?;
    ctx.db
        .upsert_workspace(id, &desc)
        .context("failed to record workspace")?;

    println!("{}", style::success(&format!("Workspace '{}' created", id)));
    println!("  Branch : {}", desc.branch_name);
    println!("  Path   : {}", desc.worktree_path.display());
    println!("  Base   : {}", desc.base_branch);
    Ok(())
}

fn cmd_ensure(ctx: &AppContext, manager: &WorkspaceManager, id: &str) -> Result<()> {
    let desc = descriptor(ctx, id)?;
    let outcome = manager
        .ensure_exists(&desc.repo_path, &desc.branch_name, &desc.worktree_path)
        .context("failed to ensure workspace")?;
    match outcome {
        EnsureOutcome::Existing => println!("{}", style::success(&format!("Workspace '{}' is present", id))),
        EnsureOutcome::Created => println!("{}", style::success(&format!("Workspace '{}' recreated", id))),
    }
    Ok(())
}

fn cmd_check(ctx: &AppContext, manager: &WorkspaceManager, id: &str) -> Result<()> {
    let desc = descriptor(ctx, id)?;
    let valid = manager
        .is_valid(&desc.repo_path, &desc.worktree_path)
        .context("failed to check workspace")?;
    if valid {
        println!("{}", style::success(&format!("Workspace '{}' is valid", id)));
        Ok(())
    } else {
        println!("{}", style::warn(&format!("Workspace '{}' is missing or not registered", id)));
        anyhow::bail!("workspace '{}' is not valid", id)
    }
}

fn cmd_cleanup(
    ctx: &AppContext,
    manager: &WorkspaceManager,
    id: &str,
    keep_record: bool,
) -> Result<()> {
    let desc = descriptor(ctx, id)?;
    let report = manager
        .cleanup(&desc.worktree_path, Some(&desc.repo_path))
        .context("cleanup failed")?;

    println!();
    println!("{}", style::header(&format!("Cleanup of '{}'", id)));
    for step in &report.steps {
        let line = match &step.outcome {
            StepOutcome::Succeeded => style::success(&step.name),
            StepOutcome::Skipped { reason } => {
                style::dim(&format!("- {} (skipped: {})", step.name, reason))
            }
            StepOutcome::Failed { error } => style::error(&format!("{}: {}", step.name, error)),
        };
        println!("  {}", line);
    }
    println!();

    if !keep_record {
        ctx.db
            .delete_workspace(id)
            .context("failed to forget workspace")?;
    }
    Ok(())
}

fn cmd_list_db(ctx: &AppContext) -> Result<()> {
    let entries = ctx.db.list_workspaces().context("failed to list workspaces")?;
    if entries.is_empty() {
        println!("No workspaces recorded.");
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Work unit", "Branch", "Base", "Path", "Present"]);
    for e in &entries {
        let present = if e.descriptor.worktree_path.is_dir() {
            "yes"
        } else {
            "no"
        };
        table.add_row(vec![
            Cell::new(&e.work_unit_id),
            Cell::new(&e.descriptor.branch_name),
            Cell::new(&e.descriptor.base_branch),
            Cell::new(truncate(&e.descriptor.worktree_path.display().to_string(), 60)),
            Cell::new(present),
        ]);
    }
    println!("{}", table);
    println!("{} workspace(s)", entries.len());
    Ok(())
}

fn cmd_list_git(manager: &WorkspaceManager, repo: &Path) -> Result<()> {
    let worktrees = manager
        .list(&absolute(repo)?)
        .context("failed to list worktrees")?;

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Path", "Branch", "Commit", "Flags"]);
    for w in &worktrees {
        let mut flags = Vec::new();
        if w.is_main {
            flags.push("main".to_string());
        }
        if w.is_locked {
            flags.push(match &w.lock_reason {
                Some(reason) => format!("locked: {}", reason),
                None => "locked".to_string(),
            });
        }
        table.add_row(vec![
            Cell::new(w.path.display()),
            Cell::new(&w.branch),
            Cell::new(style::short_sha(&w.commit)),
            Cell::new(flags.join(", ")),
        ]);
    }
    println!("{}", table);
    Ok(())
}
