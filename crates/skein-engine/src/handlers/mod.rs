//! Node handlers, one per node type, each adapting the generic node
//! contract to one external collaborator.

pub mod agent;
pub mod custom;
pub mod human;
pub mod llm;
pub mod tool;

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use skein_core::definition::{Node, NodeType};
use skein_core::error::Result;
use skein_core::state::{StateUpdate, WorkflowState};

pub use agent::AgentHandler;
pub use custom::CustomHandler;
pub use human::HumanHandler;
pub use llm::LlmHandler;
pub use tool::ToolHandler;

/// Everything a handler knows about the step it is running.
#[derive(Clone, Copy)]
pub struct NodeContext<'a> {
    pub workflow_id: &'a str,
    pub execution_id: &'a str,
    pub node: &'a Node,
    /// Fires when the execution is paused, cancelled or timed out.
    pub cancel: &'a CancellationToken,
}

/// Common handler contract: `(node, state, cancel) -> partial state`.
pub trait NodeHandler: Send + Sync + 'static {
    fn handle<'a>(
        &'a self,
        ctx: NodeContext<'a>,
        state: &'a WorkflowState,
    ) -> BoxFuture<'a, Result<StateUpdate>>;
}

/// Handlers keyed by node type.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<NodeType, Arc<dyn NodeHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the handler for a node type.
    pub fn register(&mut self, node_type: NodeType, handler: Arc<dyn NodeHandler>) {
        self.handlers.insert(node_type, handler);
    }

    pub fn get(&self, node_type: NodeType) -> Option<Arc<dyn NodeHandler>> {
        self.handlers.get(&node_type).cloned()
    }

    pub fn contains(&self, node_type: NodeType) -> bool {
        self.handlers.contains_key(&node_type)
    }

    pub fn node_types(&self) -> Vec<NodeType> {
        self.handlers.keys().copied().collect()
    }
}
