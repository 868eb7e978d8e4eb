//! Version-control command interface.
//!
//! Reads go through `git2`; operations libgit2 does not cover well
//! (worktree add/remove, merges, commits that must run hooks, sparse
//! checkout) shell out to the `git` CLI with a timeout.

pub mod client;
pub mod command;
pub mod ops;

pub use client::{ConflictStages, GitClient, MergeMode, MergeOutcome};
pub use ops::WorktreeOps;
