//! wtsync core library.
//!
//! This crate gives every agent session its own git worktree and branch,
//! then reconciles finished work back into the shared repository: worktree
//! lifecycle with per-path locking, conflict detection including
//! record-aware merging of JSON-lines files, and snapshot-protected
//! squash/preserve/stage synchronization.

pub mod config;
pub mod conflict;
pub mod db;
pub mod errors;
pub mod git;
pub mod lock;
pub mod models;
pub mod sync;
pub mod worktree;

#[cfg(test)]
mod test_support;

// Re-exports for convenience.
pub use config::AppConfig;
pub use db::Database;
pub use git::GitClient;
pub use lock::PathLockRegistry;
pub use sync::SyncOrchestrator;
pub use worktree::WorkspaceManager;
