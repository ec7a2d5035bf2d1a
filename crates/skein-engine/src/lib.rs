//! Workflow execution engine.
//!
//! A [`WorkflowDefinition`](skein_core::WorkflowDefinition) is validated by
//! the [`GraphCompiler`] and registered with a [`WorkflowEngine`]. Each
//! execution is driven by the [`ExecutionLifecycleManager`], which walks the
//! graph vertex by vertex through the [`NodeDispatcher`]: handlers run under
//! the [`RetryCoordinator`], updates merge into state channel by channel, and
//! the [`ConditionalRouter`] or a static edge picks the next vertex.

pub mod checkpoint;
pub mod compiler;
pub mod dispatcher;
pub mod engine;
pub mod handlers;
pub mod human;
pub mod lifecycle;
pub mod retry;
pub mod router;

pub use checkpoint::CheckpointStore;
pub use compiler::{CompiledWorkflow, GraphCompiler, Vertex};
pub use dispatcher::{Dispatch, NodeDispatcher};
pub use engine::{WorkflowEngine, WorkflowEngineBuilder};
pub use handlers::{HandlerRegistry, NodeContext, NodeHandler};
pub use human::HumanInputGateway;
pub use lifecycle::{ExecutionLifecycleManager, ExecutionSlot};
pub use retry::RetryCoordinator;
pub use router::{evaluate_condition, ConditionalRouter};
