use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::{json, Value};
use tracing::debug;

use skein_core::error::{Result, SkeinError};
use skein_core::state::{StateUpdate, WorkflowState, MESSAGES_CHANNEL};
use skein_core::traits::{CompletionClient, CompletionRequest};
use skein_core::types::{display_value, ChatMessage};

use super::{NodeContext, NodeHandler};

const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant.";

/// Requests a completion from the language model.
///
/// Metadata: `prompt` (system prompt), `model`, `input_path` (state path
/// appended as a user message after the conversation history).
pub struct LlmHandler {
    client: Arc<dyn CompletionClient>,
}

impl LlmHandler {
    pub fn new(client: Arc<dyn CompletionClient>) -> Self {
        Self { client }
    }
}

impl NodeHandler for LlmHandler {
    fn handle<'a>(
        &'a self,
        ctx: NodeContext<'a>,
        state: &'a WorkflowState,
    ) -> BoxFuture<'a, Result<StateUpdate>> {
        Box::pin(async move {
            let node = ctx.node;
            let system = node.meta_str("prompt").unwrap_or(DEFAULT_SYSTEM_PROMPT);

            let mut messages = ChatMessage::list_from(state.get(MESSAGES_CHANNEL));
            if let Some(input) = node.meta_str("input_path").and_then(|p| state.get_path(p)) {
                messages.push(ChatMessage::user(display_value(input)));
            }

            if ctx.cancel.is_cancelled() {
                return Err(SkeinError::Cancelled);
            }

            debug!(node_id = %node.id, history = messages.len(), "Requesting completion");
            let response = self
                .client
                .complete(CompletionRequest {
                    model: node.meta_str("model").map(String::from),
                    system: system.to_string(),
                    messages,
                })
                .await
                .map_err(|e| match e {
                    SkeinError::Llm(_) | SkeinError::Cancelled => e,
                    other => SkeinError::Llm(other.to_string()),
                })?;

            let mut update = StateUpdate::new();
            update.insert(
                MESSAGES_CHANNEL.to_string(),
                json!([
                    ChatMessage::system(system).named(&node.id).to_value(),
                    ChatMessage::assistant(response.clone()).named(&node.id).to_value(),
                ]),
            );
            update.insert(node.result_key(), Value::String(response));
            Ok(update)
        })
    }
}
