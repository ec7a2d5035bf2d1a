//! Offline collaborators for `skein run`: every call is answered locally so a
//! workflow file can be exercised without agents, tools or a model provider.

use futures::future::BoxFuture;
use serde_json::{json, Value};

use skein_core::error::Result;
use skein_core::traits::{
    AgentMessage, AgentMessenger, AgentResponse, CompletionClient, CompletionRequest, ToolExecutor,
    ToolInvocation,
};

/// Answers every task immediately with an echo of the request.
pub struct LoopbackAgents;

impl AgentMessenger for LoopbackAgents {
    fn send_message(&self, message: AgentMessage) -> BoxFuture<'_, Result<AgentResponse>> {
        Box::pin(async move {
            Ok(AgentResponse::completed(json!({
                "agent": message.to,
                "task": message.payload.get("task_name").cloned().unwrap_or(Value::Null),
                "echo": message.payload.get("message").cloned().unwrap_or(Value::Null),
            })))
        })
    }
}

/// Returns the invocation itself as the tool output.
pub struct LoopbackTools;

impl ToolExecutor for LoopbackTools {
    fn execute_tool(&self, invocation: ToolInvocation) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            Ok(json!({
                "tool": invocation.tool_name,
                "arguments": invocation.arguments,
            }))
        })
    }
}

/// Replies with the last conversation turn, tagged with the model name.
pub struct LoopbackModel;

impl CompletionClient for LoopbackModel {
    fn complete(&self, request: CompletionRequest) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            let model = request.model.as_deref().unwrap_or("loopback");
            let last = request
                .messages
                .last()
                .map(|m| m.content.as_str())
                .unwrap_or("(no input)");
            Ok(format!("[{}] {}", model, last))
        })
    }
}
