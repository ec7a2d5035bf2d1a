use std::sync::Arc;

use chrono::Utc;
use futures::future::BoxFuture;
use serde_json::{json, Value};
use tracing::{debug, info};

use skein_core::error::{Result, SkeinError};
use skein_core::state::{StateUpdate, WorkflowState, MESSAGES_CHANNEL, PENDING_AGENT_MESSAGES_CHANNEL};
use skein_core::traits::{AgentMessage, AgentMessenger, AgentResponseStatus};
use skein_core::types::{display_value, ChatMessage};

use super::{NodeContext, NodeHandler};

/// Message type sent to remote agents for a workflow step.
pub const TASK_REQUEST: &str = "task_request";

/// Sends a task to a remote agent through the messaging collaborator.
///
/// Metadata: `agent_id` (required), `task_name` (defaults to the node id),
/// `message`.
pub struct AgentHandler {
    messenger: Arc<dyn AgentMessenger>,
}

impl AgentHandler {
    pub fn new(messenger: Arc<dyn AgentMessenger>) -> Self {
        Self { messenger }
    }
}

/// `workflow-{workflowId}-node-{nodeId}-{timestamp}`
pub fn correlation_id(workflow_id: &str, node_id: &str) -> String {
    format!(
        "workflow-{}-node-{}-{}",
        workflow_id,
        node_id,
        Utc::now().timestamp_millis()
    )
}

/// The update recorded when a (possibly delayed) agent reply arrives.
pub fn completed_update(node_id: &str, agent_id: &str, data: Value) -> StateUpdate {
    let mut update = StateUpdate::new();
    update.insert(
        MESSAGES_CHANNEL.to_string(),
        json!([ChatMessage::agent(agent_id, display_value(&data)).to_value()]),
    );
    update.insert(format!("{}_result", node_id), data);
    update
}

impl NodeHandler for AgentHandler {
    fn handle<'a>(
        &'a self,
        ctx: NodeContext<'a>,
        state: &'a WorkflowState,
    ) -> BoxFuture<'a, Result<StateUpdate>> {
        Box::pin(async move {
            let node = ctx.node;
            let agent_id = node.meta_str("agent_id").ok_or_else(|| {
                SkeinError::Handler(format!("agent node '{}' has no agent_id", node.id))
            })?;
            let task_name = node.meta_str("task_name").unwrap_or(&node.id);
            let correlation_id = correlation_id(ctx.workflow_id, &node.id);

            if ctx.cancel.is_cancelled() {
                return Err(SkeinError::Cancelled);
            }

            let message = AgentMessage {
                to: agent_id.to_string(),
                message_type: TASK_REQUEST.to_string(),
                correlation_id: correlation_id.clone(),
                payload: json!({
                    "task_name": task_name,
                    "context": state.get("context").cloned().unwrap_or(Value::Null),
                    "message": node.metadata.get("message").cloned().unwrap_or(Value::Null),
                    "correlation_id": correlation_id,
                }),
            };

            debug!(node_id = %node.id, agent_id, correlation_id = %correlation_id, "Sending agent task");
            let response = self.messenger.send_message(message).await?;

            match response.status {
                AgentResponseStatus::Pending => {
                    info!(node_id = %node.id, correlation_id = %correlation_id, "Agent reply pending");
                    let mut pending = serde_json::Map::new();
                    pending.insert(
                        correlation_id,
                        json!({
                            "node_id": node.id,
                            "agent_id": agent_id,
                            "requested_at": Utc::now().to_rfc3339(),
                        }),
                    );
                    let mut update = StateUpdate::new();
                    update.insert(PENDING_AGENT_MESSAGES_CHANNEL.to_string(), Value::Object(pending));
                    Ok(update)
                }
                AgentResponseStatus::Completed => Ok(completed_update(&node.id, agent_id, response.data)),
            }
        })
    }
}
