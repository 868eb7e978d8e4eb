//! `wtsync sync ...` subcommands.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Subcommand;
use comfy_table::{presets::UTF8_FULL, Cell, ContentArrangement, Table};

use wtsync_core::db::Database;
use wtsync_core::errors::SyncError;
use wtsync_core::models::{StageOptions, SyncPreview, SyncResult};
use wtsync_core::sync::SyncOrchestrator;

use crate::{style, truncate, AppContext};

#[derive(Subcommand, Debug)]
pub enum SyncAction {
    /// Show what a sync would do, without changing anything.
    Preview {
        /// Work unit identifier.
        id: String,
        /// Print the preview as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Merge the workspace branch as a single commit.
    Squash {
        /// Work unit identifier.
        id: String,
        /// Commit message (default: generated from the branch name).
        #[arg(short, long)]
        message: Option<String>,
    },
    /// Merge the workspace branch with a merge commit, keeping its history.
    Preserve {
        /// Work unit identifier.
        id: String,
    },
    /// Stage the workspace's changes without committing.
    Stage {
        /// Work unit identifier.
        id: String,
        /// Also bring over uncommitted files from the workspace.
        #[arg(long)]
        include_uncommitted: bool,
        /// Overwrite local modifications instead of merging into them.
        #[arg(long)]
        force: bool,
    },
    /// Show recorded sync attempts.
    History {
        /// Only this work unit.
        id: Option<String>,
        /// Maximum number of entries.
        #[arg(short, long, default_value = "20")]
        limit: u32,
    },
}

pub fn run(ctx: &AppContext, action: SyncAction) -> Result<()> {
    let orchestrator =
        SyncOrchestrator::from_config(&ctx.config, ctx.db.clone(), ctx.locks.clone());

    match action {
        SyncAction::Preview { id, json } => {
            let preview = orchestrator.preview(&id).map_err(explain)?;
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&preview).context("failed to encode preview")?
                );
            } else {
                print_preview(&id, &preview);
            }
            Ok(())
        }
        SyncAction::Squash { id, message } => {
            let result = orchestrator
                .squash_sync(&id, message.as_deref())
                .map_err(explain)?;
            report(&id, &result)
        }
        SyncAction::Preserve { id } => {
            let result = orchestrator.preserve_sync(&id).map_err(explain)?;
            report(&id, &result)
        }
        SyncAction::Stage {
            id,
            include_uncommitted,
            force,
        } => {
            let options = StageOptions {
                include_uncommitted,
                override_local_changes: force,
            };
            let result = orchestrator.stage_sync(&id, options).map_err(explain)?;
            report(&id, &result)
        }
        SyncAction::History { id, limit } => cmd_history(&ctx.db, id.as_deref(), limit),
    }
}

/// Attach the snapshot name to rollback errors so the operator can inspect it.
fn explain(err: SyncError) -> anyhow::Error {
    let snapshot = err.snapshot().map(str::to_string);
    match snapshot {
        Some(snapshot) => {
            anyhow::Error::new(err).context(format!("sync rolled back to snapshot '{}'", snapshot))
        }
        None => anyhow::Error::new(err),
    }
}

fn print_preview(id: &str, preview: &SyncPreview) {
    println!();
    println!("{}", style::header(&format!("Sync preview for '{}'", id)));
    println!();
    if preview.can_sync {
        println!("{}", style::success("Ready to sync"));
    } else {
        println!("{}", style::error("Cannot sync"));
    }
    for w in &preview.warnings {
        println!("{}", style::warn(w));
    }
    println!();

    if let Some(ref base) = preview.merge_base {
        println!("  Merge base : {}", style::short_sha(base));
    }
    println!("  Commits    : {}", preview.commits.len());
    println!(
        "  Files      : {} (+{} -{})",
        preview.diff.files.len(),
        preview.diff.additions,
        preview.diff.deletions
    );
    println!("  Conflicts  : {}", preview.conflicts.summary);
    if preview.uncommitted_changes.count > 0 {
        println!(
            "  Uncommitted in workspace : {}",
            preview.uncommitted_changes.files.join(", ")
        );
    }
    if preview.potential_local_conflicts.count > 0 {
        println!(
            "  Local edits in target    : {}",
            preview.potential_local_conflicts.files.join(", ")
        );
    }

    if !preview.commits.is_empty() {
        println!();
        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_content_arrangement(ContentArrangement::Dynamic);
        table.set_header(vec!["Commit", "Author", "Message"]);
        for c in &preview.commits {
            table.add_row(vec![
                Cell::new(style::short_sha(&c.sha)),
                Cell::new(&c.author_name),
                Cell::new(truncate(c.message.lines().next().unwrap_or(""), 60)),
            ]);
        }
        println!("{}", table);
    }

    if !preview.diff.files.is_empty() {
        println!();
        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_content_arrangement(ContentArrangement::Dynamic);
        table.set_header(vec!["File", "Change", "+", "-"]);
        for f in &preview.diff.files {
            let conflicted = preview.conflicts.code_conflicts.contains(&f.path)
                || preview
                    .conflicts
                    .record_conflicts
                    .iter()
                    .any(|r| r.file_path == f.path);
            let path = if conflicted {
                style::warn(&f.path)
            } else {
                f.path.clone()
            };
            table.add_row(vec![
                Cell::new(path),
                Cell::new(f.change.to_string()),
                Cell::new(f.additions),
                Cell::new(f.deletions),
            ]);
        }
        println!("{}", table);
    }
    println!();
}

fn report(id: &str, result: &SyncResult) -> Result<()> {
    println!();
    if result.success {
        let msg = match result.final_commit {
            Some(ref commit) => format!(
                "'{}' synced as {} ({} file(s))",
                id,
                style::short_sha(commit),
                result.files_changed
            ),
            None => format!("'{}' staged ({} file(s))", id, result.files_changed),
        };
        println!("{}", style::success(&msg));
        if let Some(n) = result.uncommitted_files_included {
            println!("  Uncommitted files included: {}", n);
        }
    } else if result.has_conflicts {
        println!("{}", style::warn(&format!("'{}' stopped with conflicts:", id)));
        for f in &result.files_with_conflicts {
            println!("    {}", f);
        }
        println!();
        println!("Resolve the conflicts in the repository, then commit or reset.");
    } else {
        println!(
            "{}",
            style::error(&format!(
                "'{}' not synced: {}",
                id,
                result.error.as_deref().unwrap_or("unknown reason")
            ))
        );
    }
    if let Some(ref snapshot) = result.snapshot {
        println!("  {}", style::dim(&format!("snapshot: {}", snapshot)));
    }
    println!();

    if result.success {
        Ok(())
    } else {
        anyhow::bail!("sync of '{}' did not complete", id)
    }
}

fn cmd_history(db: &Arc<Database>, id: Option<&str>, limit: u32) -> Result<()> {
    let entries = db
        .list_sync_history(id, limit)
        .context("failed to read sync history")?;

    if entries.is_empty() {
        println!("No sync attempts recorded.");
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Recorded", "Work unit", "Strategy", "State", "Commit", "Detail"]);
    for e in &entries {
        let detail = if e.result.has_conflicts {
            e.result.files_with_conflicts.join(", ")
        } else {
            e.result.error.clone().unwrap_or_default()
        };
        table.add_row(vec![
            Cell::new(&e.recorded_at[..19.min(e.recorded_at.len())]),
            Cell::new(&e.work_unit_id),
            Cell::new(e.strategy),
            Cell::new(style::attempt_state(&e.state.to_string())),
            Cell::new(
                e.result
                    .final_commit
                    .as_deref()
                    .map(style::short_sha)
                    .unwrap_or("-"),
            ),
            Cell::new(truncate(&detail, 50)),
        ]);
    }
    println!("{}", table);
    println!("{} entries shown", entries.len());
    Ok(())
}
