use thiserror::Error;

#[derive(Debug, Error)]
pub enum SkeinError {
    // Definition errors
    #[error("Workflow validation failed: {}", violations.join("; "))]
    Validation { violations: Vec<String> },

    // Node errors
    #[error("Node '{node_id}' failed: {source}")]
    NodeExecution {
        node_id: String,
        #[source]
        source: Box<SkeinError>,
    },

    #[error("Node '{node_id}' attempt timed out after {timeout_ms}ms")]
    NodeTimeout { node_id: String, timeout_ms: u64 },

    #[error("Handler error: {0}")]
    Handler(String),

    // Lifecycle errors
    #[error("Execution {execution_id} timed out after {timeout_ms}ms")]
    WorkflowTimeout { execution_id: String, timeout_ms: u64 },

    #[error("{}: {message}", kind.code())]
    Workflow {
        kind: WorkflowErrorKind,
        message: String,
    },

    #[error("Cancelled")]
    Cancelled,

    // Collaborator errors
    #[error("Circuit breaker open for tool: {tool}")]
    CircuitOpen { tool: String },

    #[error("Tool execution failed: {tool}: {message}")]
    ToolExecution { tool: String, message: String },

    #[error("Agent messaging failed: {0}")]
    Agent(String),

    #[error("LLM request failed: {0}")]
    Llm(String),

    #[error("No human input for node '{node_id}' within {timeout_ms}ms")]
    HumanInputTimeout { node_id: String, timeout_ms: u64 },

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Lifecycle fault classes carried by [`SkeinError::Workflow`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowErrorKind {
    NotFound,
    InUse,
    Cancelled,
    InvalidState,
    StepLimit,
}

impl WorkflowErrorKind {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound => "WORKFLOW_NOT_FOUND",
            Self::InUse => "WORKFLOW_IN_USE",
            Self::Cancelled => "WORKFLOW_CANCELLED",
            Self::InvalidState => "INVALID_STATE",
            Self::StepLimit => "WORKFLOW_STEP_LIMIT",
        }
    }
}

impl SkeinError {
    pub fn workflow(kind: WorkflowErrorKind, message: impl Into<String>) -> Self {
        Self::Workflow {
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(what: impl std::fmt::Display) -> Self {
        Self::workflow(WorkflowErrorKind::NotFound, format!("{} not found", what))
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::workflow(WorkflowErrorKind::InvalidState, message)
    }

    /// Wrap a handler failure as a node execution error. Already-wrapped
    /// errors for the same node are returned unchanged.
    pub fn node(node_id: impl Into<String>, source: SkeinError) -> Self {
        let node_id = node_id.into();
        match source {
            Self::NodeExecution { node_id: inner, source } if inner == node_id => {
                Self::NodeExecution { node_id, source }
            }
            other => Self::NodeExecution {
                node_id,
                source: Box::new(other),
            },
        }
    }

    /// Taxonomy name used in execution records and events.
    pub fn class(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "ValidationError",
            Self::NodeExecution { .. } => "NodeExecutionError",
            Self::WorkflowTimeout { .. } => "WorkflowTimeoutError",
            Self::Workflow { .. } | Self::Cancelled => "WorkflowError",
            _ => "Error",
        }
    }

    /// Whether this is the collaborator's "circuit breaker open" error.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }
}

pub type Result<T> = std::result::Result<T, SkeinError>;
