use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use skein_core::error::{Result, SkeinError};
use skein_core::state::{StateUpdate, WorkflowState};
use skein_core::traits::{ToolExecutor, ToolInvocation};

use super::{NodeContext, NodeHandler};

/// Invokes a registered tool.
///
/// Metadata: `tool_name` (required), `arguments` (fixed object),
/// `argument_paths` (argument name -> dotted state path), `skip_on_open`
/// and `fallback` for an open circuit breaker.
pub struct ToolHandler {
    executor: Arc<dyn ToolExecutor>,
}

impl ToolHandler {
    pub fn new(executor: Arc<dyn ToolExecutor>) -> Self {
        Self { executor }
    }
}

fn build_arguments(metadata: &Map<String, Value>, state: &WorkflowState) -> Value {
    let mut args = metadata
        .get("arguments")
        .and_then(|v| v.as_object())
        .cloned()
        .unwrap_or_default();
    if let Some(paths) = metadata.get("argument_paths").and_then(|v| v.as_object()) {
        for (name, path) in paths {
            let resolved = path
                .as_str()
                .and_then(|p| state.get_path(p))
                .cloned()
                .unwrap_or(Value::Null);
            args.insert(name.clone(), resolved);
        }
    }
    Value::Object(args)
}

impl NodeHandler for ToolHandler {
    fn handle<'a>(
        &'a self,
        ctx: NodeContext<'a>,
        state: &'a WorkflowState,
    ) -> BoxFuture<'a, Result<StateUpdate>> {
        Box::pin(async move {
            let node = ctx.node;
            let tool_name = node.meta_str("tool_name").ok_or_else(|| {
                SkeinError::Handler(format!("tool node '{}' has no tool_name", node.id))
            })?;
            if ctx.cancel.is_cancelled() {
                return Err(SkeinError::Cancelled);
            }

            let invocation = ToolInvocation {
                tool_name: tool_name.to_string(),
                arguments: build_arguments(&node.metadata, state),
            };
            debug!(node_id = %node.id, tool = tool_name, "Invoking tool");

            let mut update = StateUpdate::new();
            match self.executor.execute_tool(invocation).await {
                Ok(output) => {
                    update.insert(node.result_key(), output);
                }
                Err(e) if e.is_circuit_open() && node.meta_bool("skip_on_open") => {
                    warn!(node_id = %node.id, tool = tool_name, "Circuit open, skipping tool node");
                    let fallback = node.metadata.get("fallback").cloned().unwrap_or(Value::Null);
                    update.insert(node.result_key(), fallback);
                    update.insert(format!("{}_skipped", node.id), Value::Bool(true));
                }
                Err(e) => return Err(e),
            }
            Ok(update)
        })
    }
}
