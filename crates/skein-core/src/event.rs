use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::definition::NodeType;
use crate::execution::ExecutionError;
use crate::state::{StateUpdate, WorkflowState};

/// Lifecycle and node events published by the engine.
#[derive(Debug, Clone)]
pub enum WorkflowEvent {
    /// A definition was compiled and registered.
    Created { workflow_id: String, name: String },
    /// An execution started running.
    Started { execution_id: String, workflow_id: String },
    /// An execution reached `completed`.
    Completed { execution_id: String, workflow_id: String, duration_ms: u64 },
    /// An execution reached `failed`.
    Failed { execution_id: String, error: ExecutionError },
    /// An execution exceeded its timeout.
    Timeout { execution_id: String, timeout_ms: u64 },
    /// An execution was paused.
    Paused { execution_id: String, checkpoint_id: String },
    /// A paused execution was resumed.
    Resumed { execution_id: String, from_node: Option<String> },
    /// An execution was cancelled.
    Cancelled { execution_id: String },
    /// A node step was committed.
    NodeExecuted {
        execution_id: String,
        node_id: String,
        node_type: NodeType,
        duration_ms: u64,
        success: bool,
    },
    /// The partial update a node contributed.
    Stream { execution_id: String, node_id: String, update: StateUpdate },
    /// A human node is waiting for input.
    HumanInputRequired {
        execution_id: String,
        node_id: String,
        prompt: String,
        options: Vec<Value>,
        timeout_ms: u64,
        state: WorkflowState,
    },
    /// Human input was delivered to a waiting node.
    HumanInputSubmitted { node_id: String, user_id: String },
}

impl WorkflowEvent {
    /// Wire name, e.g. `workflow:started` or `node:executed`.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Created { .. } => "workflow:created",
            Self::Started { .. } => "workflow:started",
            Self::Completed { .. } => "workflow:completed",
            Self::Failed { .. } => "workflow:failed",
            Self::Timeout { .. } => "workflow:timeout",
            Self::Paused { .. } => "workflow:paused",
            Self::Resumed { .. } => "workflow:resumed",
            Self::Cancelled { .. } => "workflow:cancelled",
            Self::NodeExecuted { .. } => "node:executed",
            Self::Stream { .. } => "workflow:stream",
            Self::HumanInputRequired { .. } => "human:input:required",
            Self::HumanInputSubmitted { .. } => "human:input:submitted",
        }
    }

    pub fn execution_id(&self) -> Option<&str> {
        match self {
            Self::Started { execution_id, .. }
            | Self::Completed { execution_id, .. }
            | Self::Failed { execution_id, .. }
            | Self::Timeout { execution_id, .. }
            | Self::Paused { execution_id, .. }
            | Self::Resumed { execution_id, .. }
            | Self::Cancelled { execution_id }
            | Self::NodeExecuted { execution_id, .. }
            | Self::Stream { execution_id, .. }
            | Self::HumanInputRequired { execution_id, .. } => Some(execution_id),
            Self::Created { .. } | Self::HumanInputSubmitted { .. } => None,
        }
    }
}

/// A published event with its publication time.
#[derive(Debug, Clone)]
pub struct EngineEvent {
    pub timestamp: DateTime<Utc>,
    pub event: WorkflowEvent,
}

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: WorkflowEvent) {
        tracing::trace!(event = event.name(), "publish");
        // Ignore error if no receivers
        let _ = self.tx.send(EngineEvent {
            timestamp: Utc::now(),
            event,
        });
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
