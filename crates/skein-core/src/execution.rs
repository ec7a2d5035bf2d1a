use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::SkeinError;
use crate::state::WorkflowState;

/// Lifecycle status of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Success,
    Failure,
    Skipped,
}

/// One node step in an execution's history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionHistoryEntry {
    pub node_id: String,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u64,
    pub status: StepStatus,
    /// Number of handler invocations this step took.
    pub attempts: u32,
    /// State before the step.
    pub input: WorkflowState,
    /// Partial update the handler returned.
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    pub nodes_executed: u64,
    pub execution_time_ms: u64,
    pub retry_count: u64,
    pub error_count: u64,
}

/// Serializable record of the error that ended an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionError {
    /// Taxonomy class: `NodeExecutionError`, `WorkflowTimeoutError`, `WorkflowError`, ...
    pub class: String,
    pub message: String,
    #[serde(default)]
    pub node_id: Option<String>,
}

impl From<&SkeinError> for ExecutionError {
    fn from(err: &SkeinError) -> Self {
        let node_id = match err {
            SkeinError::NodeExecution { node_id, .. } => Some(node_id.clone()),
            _ => None,
        };
        Self {
            class: err.class().to_string(),
            message: err.to_string(),
            node_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointReason {
    /// Taken by `pause_workflow`.
    Pause,
    /// Taken every `checkpoint_interval` completed steps.
    Interval,
}

/// Extra information recorded alongside a checkpoint's state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    /// Last node whose update is reflected in the snapshot.
    pub node_id: Option<String>,
    pub reason: CheckpointReason,
}

/// Immutable snapshot of an execution's state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub execution_id: String,
    pub state: WorkflowState,
    pub timestamp: DateTime<Utc>,
    pub node_id: Option<String>,
    pub reason: CheckpointReason,
}

/// Per-call execution overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Overrides the definition's timeout.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// One run of a compiled workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: String,
    pub workflow_id: String,
    pub state: WorkflowState,
    pub status: ExecutionStatus,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub checkpoints: Vec<Checkpoint>,
    #[serde(default)]
    pub history: Vec<ExecutionHistoryEntry>,
    #[serde(default)]
    pub metrics: ExecutionMetrics,
    #[serde(default)]
    pub error: Option<ExecutionError>,
    /// Most recent node (or parallel group) whose update was committed.
    #[serde(default)]
    pub last_completed: Option<String>,
}

impl WorkflowExecution {
    pub fn new(workflow_id: impl Into<String>, state: WorkflowState) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            workflow_id: workflow_id.into(),
            state,
            status: ExecutionStatus::Pending,
            start_time: Utc::now(),
            end_time: None,
            checkpoints: Vec::new(),
            history: Vec::new(),
            metrics: ExecutionMetrics::default(),
            error: None,
            last_completed: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == ExecutionStatus::Running
    }

    /// Move to a terminal status, stamping end time and total duration.
    pub fn finish(&mut self, status: ExecutionStatus, error: Option<&SkeinError>) {
        let now = Utc::now();
        self.status = status;
        self.end_time = Some(now);
        self.metrics.execution_time_ms = (now - self.start_time).num_milliseconds().max(0) as u64;
        self.error = error.map(ExecutionError::from);
    }
}

/// Outbound request for human input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HumanInputRequest {
    pub id: String,
    pub execution_id: String,
    pub node_id: String,
    pub prompt: String,
    #[serde(default)]
    pub options: Vec<Value>,
    pub timeout_ms: u64,
    pub requested_at: DateTime<Utc>,
}

/// Inbound human input, correlated by node id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HumanInputResponse {
    pub node_id: String,
    pub input: Value,
    pub user_id: String,
    pub timestamp: DateTime<Utc>,
}

/// Listing entry for a registered workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSummary {
    pub id: String,
    pub name: String,
    pub node_count: usize,
    pub entry_point: String,
    pub created_at: DateTime<Utc>,
}
