use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::types::ChatMessage;

/// Outbound message to a remote agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMessage {
    pub to: String,
    #[serde(rename = "type")]
    pub message_type: String,
    pub correlation_id: String,
    pub payload: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentResponseStatus {
    Completed,
    Pending,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResponse {
    pub status: AgentResponseStatus,
    #[serde(default)]
    pub data: Value,
}

impl AgentResponse {
    pub fn completed(data: Value) -> Self {
        Self {
            status: AgentResponseStatus::Completed,
            data,
        }
    }

    pub fn pending() -> Self {
        Self {
            status: AgentResponseStatus::Pending,
            data: Value::Null,
        }
    }
}

/// Agent messaging: the transport to remote agents.
pub trait AgentMessenger: Send + Sync + 'static {
    fn send_message(&self, message: AgentMessage) -> BoxFuture<'_, Result<AgentResponse>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub tool_name: String,
    pub arguments: Value,
}

/// Tool execution through the tool/plugin registry.
///
/// Implementations report an open circuit breaker as
/// [`SkeinError::CircuitOpen`](crate::error::SkeinError::CircuitOpen).
pub trait ToolExecutor: Send + Sync + 'static {
    fn execute_tool(&self, invocation: ToolInvocation) -> BoxFuture<'_, Result<Value>>;
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: Option<String>,
    pub system: String,
    pub messages: Vec<ChatMessage>,
}

/// LLM completion. Provider integration lives behind this trait.
pub trait CompletionClient: Send + Sync + 'static {
    fn complete(&self, request: CompletionRequest) -> BoxFuture<'_, Result<String>>;
}
