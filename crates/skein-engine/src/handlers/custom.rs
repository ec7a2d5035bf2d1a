use futures::future::BoxFuture;
use serde_json::Value;

use skein_core::error::{Result, SkeinError};
use skein_core::state::{StateUpdate, WorkflowState};

use super::{NodeContext, NodeHandler};

/// Runs the caller-supplied pure transform attached to the node.
///
/// Nodes loaded from files cannot carry closures; they may instead set
/// `metadata.assign` to a fixed object that becomes the update.
pub struct CustomHandler;

impl NodeHandler for CustomHandler {
    fn handle<'a>(
        &'a self,
        ctx: NodeContext<'a>,
        state: &'a WorkflowState,
    ) -> BoxFuture<'a, Result<StateUpdate>> {
        Box::pin(async move {
            if ctx.cancel.is_cancelled() {
                return Err(SkeinError::Cancelled);
            }
            match (&ctx.node.transform, ctx.node.metadata.get("assign")) {
                (Some(transform), _) => transform.call(state),
                (None, Some(Value::Object(assign))) => Ok(assign.clone()),
                (None, _) => Err(SkeinError::Handler(format!(
                    "custom node '{}' has no transform",
                    ctx.node.id
                ))),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use skein_core::definition::{Node, NodeType};
    use tokio_util::sync::CancellationToken;

    fn ctx<'a>(node: &'a Node, cancel: &'a CancellationToken) -> NodeContext<'a> {
        NodeContext {
            workflow_id: "wf",
            execution_id: "exec",
            node,
            cancel,
        }
    }

    #[tokio::test]
    async fn runs_transform() {
        let node = Node::custom("double", |s| {
            let n = s.get("n").and_then(|v| v.as_i64()).unwrap_or(0);
            Ok(json!({"n": n * 2}).as_object().cloned().unwrap_or_default())
        });
        let mut state = WorkflowState::new();
        state.set("n", json!(21));
        let cancel = CancellationToken::new();
        let update = CustomHandler.handle(ctx(&node, &cancel), &state).await.unwrap();
        assert_eq!(update.get("n"), Some(&json!(42)));
    }

    #[tokio::test]
    async fn assign_metadata() {
        let node = Node::new("set", NodeType::Custom).with_meta("assign", json!({"ready": true}));
        let cancel = CancellationToken::new();
        let update = CustomHandler
            .handle(ctx(&node, &cancel), &WorkflowState::new())
            .await
            .unwrap();
        assert_eq!(update.get("ready"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn missing_transform() {
        let node = Node::new("empty", NodeType::Custom);
        let cancel = CancellationToken::new();
        let result = CustomHandler.handle(ctx(&node, &cancel), &WorkflowState::new()).await;
        assert!(matches!(result, Err(SkeinError::Handler(_))));
    }
}
