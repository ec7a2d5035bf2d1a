use std::collections::HashMap;
use std::sync::Mutex;

use chrono::Utc;
use uuid::Uuid;

use skein_core::execution::{Checkpoint, CheckpointMeta};
use skein_core::state::WorkflowState;

/// In-process checkpoint store keyed by execution id.
///
/// Snapshots are append-only: a stored checkpoint is never modified.
#[derive(Default)]
pub struct CheckpointStore {
    entries: Mutex<HashMap<String, Vec<Checkpoint>>>,
}

impl CheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a deep copy of `state` and return the stored checkpoint.
    pub fn put(&self, execution_id: &str, state: &WorkflowState, meta: CheckpointMeta) -> Checkpoint {
        let checkpoint = Checkpoint {
            id: Uuid::new_v4().to_string(),
            execution_id: execution_id.to_string(),
            state: state.clone(),
            timestamp: Utc::now(),
            node_id: meta.node_id,
            reason: meta.reason,
        };
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .entry(execution_id.to_string())
            .or_default()
            .push(checkpoint.clone());
        checkpoint
    }

    /// Most recent checkpoint for an execution.
    pub fn latest(&self, execution_id: &str) -> Option<Checkpoint> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.get(execution_id).and_then(|list| list.last().cloned())
    }

    /// All checkpoints for an execution, oldest first.
    pub fn list(&self, execution_id: &str) -> Vec<Checkpoint> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.get(execution_id).cloned().unwrap_or_default()
    }

    /// Delete all checkpoints for an execution.
    pub fn delete(&self, execution_id: &str) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(execution_id).map(|list| list.len()).unwrap_or(0)
    }
}
