//! wtsync command-line tool.
//!
//! Creates, checks, and tears down per-work-unit git worktrees, and
//! reconciles finished work back into the shared repository with the
//! squash, preserve, or stage strategy.

mod style;
mod sync;
mod workspace;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use wtsync_core::config::AppConfig;
use wtsync_core::db::Database;
use wtsync_core::lock::PathLockRegistry;

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// wtsync command-line tool.
#[derive(Parser, Debug)]
#[command(
    name = "wtsync",
    version,
    about = "Isolated git worktrees per work unit, reconciled back into the shared repository"
)]
struct Cli {
    /// Path to the TOML configuration file. Defaults apply if it is missing.
    #[arg(short, long, global = true, default_value = "./wtsync.toml")]
    config: PathBuf,

    /// Log level filter (overrides the config file).
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate a default configuration file.
    Init {
        /// Output path for the generated config file.
        #[arg(short, long, default_value = "./wtsync.toml")]
        output: PathBuf,
    },

    /// Validate a configuration file.
    Validate,

    /// Manage isolated workspaces.
    Workspace {
        #[command(subcommand)]
        action: workspace::WorkspaceAction,
    },

    /// Reconcile a workspace into its base branch.
    Sync {
        #[command(subcommand)]
        action: sync::SyncAction,
    },
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> ExitCode {
    let cli = Cli::parse();

    // A broken config must not prevent `init` or `validate` from reporting it.
    let config_level = AppConfig::load_or_default(&cli.config)
        .ok()
        .map(|c| c.general.log_level);
    let filter = cli
        .log_level
        .clone()
        .or(config_level)
        .unwrap_or_else(|| "warn".to_string());

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&filter).unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_target(false)
        .without_time()
        .init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", style::error(&format!("{:#}", e)));
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Init { output } => cmd_init(&output),
        Commands::Validate => cmd_validate(&cli.config),
        Commands::Workspace { action } => {
            let ctx = AppContext::open(&cli.config)?;
            workspace::run(&ctx, action)
        }
        Commands::Sync { action } => {
            let ctx = AppContext::open(&cli.config)?;
            sync::run(&ctx, action)
        }
    }
}

/// Everything a subcommand needs: configuration, the descriptor database,
/// and the process-wide lock registry shared by manager and orchestrator.
pub(crate) struct AppContext {
    pub config: AppConfig,
    pub db: Arc<Database>,
    pub locks: Arc<PathLockRegistry>,
}

impl AppContext {
    fn open(config_path: &Path) -> Result<Self> {
        let config = load_config(config_path)?;
        let db = open_database(&config)?;
        Ok(Self {
            config,
            db: Arc::new(db),
            locks: Arc::new(PathLockRegistry::new()),
        })
    }
}

// ---------------------------------------------------------------------------
// Config helpers
// ---------------------------------------------------------------------------

fn load_config(path: &Path) -> Result<AppConfig> {
    let config = AppConfig::load_or_default(path).context("failed to load configuration file")?;
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn open_database(config: &AppConfig) -> Result<Database> {
    let db = Database::open_in_dir(&config.general.data_dir).context("failed to open database")?;
    tracing::debug!(data_dir = %config.general.data_dir.display(), "database ready");
    Ok(db)
}

// ---------------------------------------------------------------------------
// Subcommand implementations
// ---------------------------------------------------------------------------

fn cmd_init(output: &Path) -> Result<()> {
    let default_config = r#"# wtsync configuration

[general]
log_level = "info"
data_dir = ".wtsync"

[git]
binary = "git"
# Seconds before a git subprocess is killed; 0 disables the limit.
command_timeout_secs = 120

[worktree]
# Relative paths are resolved inside each repository.
storage_dir = ".worktrees"
branch_prefix = "wtsync"
auto_create_branches = true
auto_delete_branches = false
# sparse_checkout = ["src/", "Cargo.toml"]
create_retries = 1
lock_timeout_secs = 300

[records]
patterns = [".tracker/*.jsonl"]
id_field = "uuid"
timestamp_field = "updated_at"

[sync]
# latest_timestamp, ours, or theirs
tie_break = "latest_timestamp"
snapshot_prefix = "wtsync-snapshot"
retain_snapshots = true
serialize_reconciliation = true
"#;

    if output.exists() {
        anyhow::bail!(
            "file already exists: {}. Use a different path or remove the existing file.",
            output.display()
        );
    }

    std::fs::write(output, default_config).context("failed to write config file")?;

    println!("{}", style::success(&format!("Default configuration written to {}", output.display())));
    println!();
    println!("Next steps:");
    println!("  1. Adjust record patterns and the worktree storage directory");
    println!("  2. Validate with: wtsync validate --config {}", output.display());
    println!(
        "  3. Create a workspace: wtsync workspace create <repo> <work-unit-id> --config {}",
        output.display()
    );

    Ok(())
}

fn cmd_validate(config_path: &Path) -> Result<()> {
    println!("Validating configuration: {}", config_path.display());
    println!();

    let config = AppConfig::load_from_file(config_path).context("failed to parse configuration")?;
    println!("  [OK] TOML structure is valid");

    match config.validate() {
        Ok(()) => {
            println!("  [OK] All fields are valid");
        }
        Err(e) => {
            println!("  [FAIL] Validation error: {}", e);
            anyhow::bail!("configuration validation failed");
        }
    }

    println!();
    println!("Configuration summary:");
    println!("  Data directory  : {}", config.general.data_dir.display());
    println!("  Git binary      : {}", config.git.binary);
    println!(
        "  Git timeout     : {}",
        match config.git.command_timeout() {
            Some(t) => format!("{}s", t.as_secs()),
            None => "disabled".to_string(),
        }
    );
    println!("  Worktree dir    : {}", config.worktree.storage_dir.display());
    println!("  Branch prefix   : {}", config.worktree.branch_prefix);
    println!("  Record patterns : {}", config.records.patterns.join(", "));
    println!("  Record id field : {}", config.records.id_field);
    println!("  Tie-break       : {}", config.sync.tie_break);
    println!(
        "  Snapshots       : {}",
        if config.sync.retain_snapshots {
            "retained"
        } else {
            "discarded after success"
        }
    );
    println!();
    println!("Configuration is valid.");

    Ok(())
}

// ---------------------------------------------------------------------------
// Utilities
// ---------------------------------------------------------------------------

pub(crate) fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
