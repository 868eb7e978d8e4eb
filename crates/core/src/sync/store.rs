//! Resolution of work-unit identifiers to workspace descriptors.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::Utc;

use crate::errors::DatabaseError;
use crate::models::{AttemptState, SyncHistoryEntry, SyncResult, SyncStrategy, WorkspaceDescriptor};

/// Where the orchestrator looks up descriptors and reports outcomes.
///
/// Implemented by [`Database`](crate::db::Database) and by
/// [`InMemoryDescriptors`].
pub trait DescriptorStore: Send + Sync {
    fn load_descriptor(&self, work_unit_id: &str)
        -> Result<Option<WorkspaceDescriptor>, DatabaseError>;

    /// Called once per strategy invocation with its terminal outcome.
    fn record_result(
        &self,
        _work_unit_id: &str,
        _strategy: SyncStrategy,
        _state: AttemptState,
        _result: &SyncResult,
    ) -> Result<(), DatabaseError> {
        Ok(())
    }
}

/// A process-local store, for embedding and tests.
#[derive(Debug, Default)]
pub struct InMemoryDescriptors {
    descriptors: Mutex<HashMap<String, WorkspaceDescriptor>>,
    history: Mutex<Vec<SyncHistoryEntry>>,
}

impl InMemoryDescriptors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, work_unit_id: impl Into<String>, descriptor: WorkspaceDescriptor) {
        self.descriptors
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(work_unit_id.into(), descriptor);
    }

    /// Recorded attempts, oldest first.
    pub fn history(&self) -> Vec<SyncHistoryEntry> {
        self.history
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

impl DescriptorStore for InMemoryDescriptors {
    fn load_descriptor(
        &self,
        work_unit_id: &str,
    ) -> Result<Option<WorkspaceDescriptor>, DatabaseError> {
        Ok(self
            .descriptors
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(work_unit_id)
            .cloned())
    }

    fn record_result(
        &self,
        work_unit_id: &str,
        strategy: SyncStrategy,
        state: AttemptState,
        result: &SyncResult,
    ) -> Result<(), DatabaseError> {
        self.history
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(SyncHistoryEntry {
                work_unit_id: work_unit_id.to_string(),
                strategy,
                state,
                result: result.clone(),
                recorded_at: Utc::now().to_rfc3339(),
            });
        Ok(())
    }
}

impl<T: DescriptorStore + ?Sized> DescriptorStore for std::sync::Arc<T> {
    fn load_descriptor(
        &self,
        work_unit_id: &str,
    ) -> Result<Option<WorkspaceDescriptor>, DatabaseError> {
        (**self).load_descriptor(work_unit_id)
    }

    fn record_result(
        &self,
        work_unit_id: &str,
        strategy: SyncStrategy,
        state: AttemptState,
        result: &SyncResult,
    ) -> Result<(), DatabaseError> {
        (**self).record_result(work_unit_id, strategy, state, result)
    }
}
