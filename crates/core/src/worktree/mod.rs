//! Isolated workspace management.

pub mod cleanup;
pub mod manager;

pub use cleanup::{CleanupReport, CleanupStep, StepOutcome};
pub use manager::{CreateWorktreeParams, EnsureOutcome, WorkspaceManager};
