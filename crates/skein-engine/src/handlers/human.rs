use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use serde_json::{json, Value};
use uuid::Uuid;

use skein_core::error::{Result, SkeinError};
use skein_core::execution::HumanInputRequest;
use skein_core::state::{StateUpdate, WorkflowState, MESSAGES_CHANNEL};
use skein_core::types::{display_value, ChatMessage};

use super::{NodeContext, NodeHandler};
use crate::human::HumanInputGateway;

/// Suspends the node until a human submits input through the engine.
///
/// Metadata: `prompt`, `options`, `timeout_ms`. The node's own
/// `timeout_ms` is used when the metadata omits one.
pub struct HumanHandler {
    gateway: Arc<HumanInputGateway>,
    default_timeout: Duration,
}

impl HumanHandler {
    pub fn new(gateway: Arc<HumanInputGateway>, default_timeout: Duration) -> Self {
        Self {
            gateway,
            default_timeout,
        }
    }
}

impl NodeHandler for HumanHandler {
    fn handle<'a>(
        &'a self,
        ctx: NodeContext<'a>,
        state: &'a WorkflowState,
    ) -> BoxFuture<'a, Result<StateUpdate>> {
        Box::pin(async move {
            let node = ctx.node;
            if ctx.cancel.is_cancelled() {
                return Err(SkeinError::Cancelled);
            }
            let timeout_ms = node
                .meta_u64("timeout_ms")
                .or(node.timeout_ms)
                .unwrap_or(self.default_timeout.as_millis() as u64);
            let options = node
                .metadata
                .get("options")
                .and_then(|v| v.as_array())
                .cloned()
                .unwrap_or_default();

            let request = HumanInputRequest {
                id: Uuid::new_v4().to_string(),
                execution_id: ctx.execution_id.to_string(),
                node_id: node.id.clone(),
                prompt: node
                    .meta_str("prompt")
                    .map(String::from)
                    .unwrap_or_else(|| format!("Input required for '{}'", node.id)),
                options,
                timeout_ms,
                requested_at: Utc::now(),
            };

            let response = self.gateway.wait(request, state).await?;

            let mut update = StateUpdate::new();
            update.insert(
                MESSAGES_CHANNEL.to_string(),
                json!([ChatMessage::human(response.user_id.clone(), display_value(&response.input)).to_value()]),
            );
            update.insert(node.result_key(), response.input);
            update.insert(format!("{}_user", node.id), Value::String(response.user_id));
            Ok(update)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_core::definition::{Node, NodeType};
    use skein_core::event::EventBus;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn input_becomes_result_and_message() {
        let bus = Arc::new(EventBus::default());
        let gateway = Arc::new(HumanInputGateway::new(bus.clone()));
        let handler = HumanHandler::new(gateway.clone(), Duration::from_secs(5));
        let mut events = bus.subscribe();

        let submitter = tokio::spawn(async move {
            let _ = events.recv().await;
            gateway.submit("review", json!("approved"), "alice")
        });

        let node = Node::new("review", NodeType::Human).with_meta("prompt", json!("Approve?"));
        let cancel = CancellationToken::new();
        let ctx = NodeContext {
            workflow_id: "wf",
            execution_id: "exec",
            node: &node,
            cancel: &cancel,
        };
        let update = handler.handle(ctx, &WorkflowState::new()).await.unwrap();
        assert!(submitter.await.unwrap());

        assert_eq!(update.get("review_result"), Some(&json!("approved")));
        assert_eq!(update.get("review_user"), Some(&json!("alice")));
        let messages = ChatMessage::list_from(update.get("messages"));
        assert_eq!(messages[0].content, "approved");
        assert_eq!(messages[0].name.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn metadata_timeout_wins() {
        let gateway = Arc::new(HumanInputGateway::new(Arc::new(EventBus::default())));
        let handler = HumanHandler::new(gateway, Duration::from_secs(60));
        let node = Node::new("review", NodeType::Human)
            .with_timeout(Duration::from_secs(30))
            .with_meta("timeout_ms", json!(20));
        let cancel = CancellationToken::new();
        let ctx = NodeContext {
            workflow_id: "wf",
            execution_id: "exec",
            node: &node,
            cancel: &cancel,
        };
        let err = handler.handle(ctx, &WorkflowState::new()).await.unwrap_err();
        assert!(matches!(err, SkeinError::HumanInputTimeout { timeout_ms: 20, .. }));
    }
}
