use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use skein_core::definition::{Node, NodeType, ParallelGroup};
use skein_core::error::{Result, SkeinError};
use skein_core::event::{EventBus, WorkflowEvent};
use skein_core::execution::{ExecutionHistoryEntry, StepStatus, WorkflowExecution};
use skein_core::state::{StateUpdate, WorkflowState};

use crate::compiler::{CompiledWorkflow, Vertex};
use crate::handlers::{HandlerRegistry, NodeContext};
use crate::retry::{Attempted, Exhausted, RetryCoordinator};

/// What happened to a dispatched vertex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// The update was merged and recorded.
    Committed,
    /// The execution left `running` (pause, cancel, timeout) while the step
    /// was in flight; its result was dropped without trace.
    Discarded,
}

/// The execution a step belongs to.
pub struct StepScope<'a> {
    pub workflow: &'a CompiledWorkflow,
    pub execution_id: &'a str,
    pub record: &'a Mutex<WorkflowExecution>,
    pub cancel: &'a CancellationToken,
}

impl StepScope<'_> {
    /// Whether this run segment may still change the record. A paused,
    /// cancelled or timed-out segment keeps a fired token even after the
    /// execution is resumed under a fresh one.
    pub fn is_live(&self, record: &WorkflowExecution) -> bool {
        record.is_running() && !self.cancel.is_cancelled()
    }
}

struct NodeRun<'n> {
    node: &'n Node,
    result: std::result::Result<Attempted<StateUpdate>, Exhausted>,
    duration_ms: u64,
}

/// Wraps handler invocations with retries, history tracking and state merging.
pub struct NodeDispatcher {
    handlers: HandlerRegistry,
    event_bus: Arc<EventBus>,
    default_parallel_limit: usize,
}

impl NodeDispatcher {
    pub fn new(handlers: HandlerRegistry, event_bus: Arc<EventBus>, default_parallel_limit: usize) -> Self {
        Self {
            handlers,
            event_bus,
            default_parallel_limit: default_parallel_limit.max(1),
        }
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    /// Run one vertex against `input` and commit its outcome to the record.
    ///
    /// Returns `Err` with the node's error once it has been recorded as a
    /// failure step; the caller decides the execution's fate.
    pub async fn dispatch(
        &self,
        scope: &StepScope<'_>,
        vertex: Vertex<'_>,
        input: &WorkflowState,
    ) -> Result<Dispatch> {
        match vertex {
            Vertex::Node(node) => {
                let run = self.invoke(scope, node, input).await;
                let mut record = scope.record.lock().await;
                if !scope.is_live(&record) {
                    debug!(execution_id = %scope.execution_id, node_id = %node.id, "Execution no longer running, discarding node result");
                    return Ok(Dispatch::Discarded);
                }
                self.commit(scope, &mut record, run, input)?;
                record.last_completed = Some(node.id.clone());
                Ok(Dispatch::Committed)
            }
            Vertex::Group(group) => self.dispatch_group(scope, group, input).await,
        }
    }

    async fn dispatch_group(
        &self,
        scope: &StepScope<'_>,
        group: &ParallelGroup,
        input: &WorkflowState,
    ) -> Result<Dispatch> {
        let limit = scope
            .workflow
            .config
            .parallel_limit
            .unwrap_or(self.default_parallel_limit)
            .max(1);
        info!(
            execution_id = %scope.execution_id,
            group_id = %group.id,
            members = group.nodes.len(),
            limit,
            "Dispatching parallel group"
        );

        // `buffered` keeps declaration order regardless of completion order
        // Futures are lazy: building them up front only sidesteps a rustc
        // higher-ranked lifetime limitation with closures held across awaits.
        let pending: Vec<_> = group
            .nodes
            .iter()
            .filter_map(|id| scope.workflow.node(id))
            .map(|node| self.invoke(scope, node, input))
            .collect();
        let runs: Vec<NodeRun<'_>> = stream::iter(pending)
            .buffered(limit)
            .collect()
            .await;

        let mut record = scope.record.lock().await;
        if !scope.is_live(&record) {
            debug!(execution_id = %scope.execution_id, group_id = %group.id, "Execution no longer running, discarding group results");
            return Ok(Dispatch::Discarded);
        }

        let mut first_error = None;
        for run in runs {
            if let Err(e) = self.commit(scope, &mut record, run, input) {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => {
                record.last_completed = Some(group.id.clone());
                Ok(Dispatch::Committed)
            }
        }
    }

    /// Invoke a node's handler through the retry coordinator. Every attempt
    /// races the cancellation signal and the node's per-attempt timeout.
    async fn invoke<'n>(&self, scope: &StepScope<'_>, node: &'n Node, input: &WorkflowState) -> NodeRun<'n> {
        let started = Instant::now();
        let Some(handler) = self.handlers.get(node.node_type) else {
            return NodeRun {
                node,
                result: Err(Exhausted {
                    error: SkeinError::node(
                        &node.id,
                        SkeinError::Handler(format!("no handler for node type '{}'", node.node_type)),
                    ),
                    attempts: 0,
                }),
                duration_ms: 0,
            };
        };
        let handler = &handler;
        let ctx = NodeContext {
            workflow_id: &scope.workflow.id,
            execution_id: scope.execution_id,
            node,
            cancel: scope.cancel,
        };
        // Human nodes apply their timeout to the wait itself
        let attempt_timeout = node.timeout_ms.filter(|_| node.node_type != NodeType::Human);
        let cancel = scope.cancel;

        let result = RetryCoordinator::run(&node.id, node.retry_policy.as_ref(), cancel, move |_attempt| async move {
            let attempt = async {
                match attempt_timeout {
                    Some(ms) => tokio::time::timeout(Duration::from_millis(ms), handler.handle(ctx, input))
                        .await
                        .unwrap_or_else(|_| {
                            Err(SkeinError::NodeTimeout {
                                node_id: node.id.clone(),
                                timeout_ms: ms,
                            })
                        }),
                    None => handler.handle(ctx, input).await,
                }
            };
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(SkeinError::Cancelled),
                result = attempt => result,
            }
        })
        .await;

        NodeRun {
            node,
            result,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }

    /// Record one node run on a running execution.
    fn commit(
        &self,
        scope: &StepScope<'_>,
        record: &mut WorkflowExecution,
        run: NodeRun<'_>,
        input: &WorkflowState,
    ) -> Result<()> {
        let node = run.node;
        match run.result {
            Ok(Attempted { value: update, attempts }) => {
                record.state.merge(&update, &scope.workflow.schema);
                let skipped = update.get(&format!("{}_skipped", node.id)) == Some(&Value::Bool(true));
                record.history.push(ExecutionHistoryEntry {
                    node_id: node.id.clone(),
                    timestamp: Utc::now(),
                    duration_ms: run.duration_ms,
                    status: if skipped { StepStatus::Skipped } else { StepStatus::Success },
                    attempts,
                    input: input.clone(),
                    output: Some(Value::Object(update.clone())),
                    error: None,
                });
                record.metrics.nodes_executed += 1;
                record.metrics.retry_count += u64::from(attempts.saturating_sub(1));
                debug!(
                    execution_id = %scope.execution_id,
                    node_id = %node.id,
                    attempts,
                    keys = update.len(),
                    "Merged node update"
                );

                self.event_bus.publish(WorkflowEvent::NodeExecuted {
                    execution_id: scope.execution_id.to_string(),
                    node_id: node.id.clone(),
                    node_type: node.node_type,
                    duration_ms: run.duration_ms,
                    success: true,
                });
                self.event_bus.publish(WorkflowEvent::Stream {
                    execution_id: scope.execution_id.to_string(),
                    node_id: node.id.clone(),
                    update,
                });
                Ok(())
            }
            Err(Exhausted { error, attempts }) => {
                error!(
                    execution_id = %scope.execution_id,
                    node_id = %node.id,
                    attempts,
                    error = %error,
                    "Node failed"
                );
                record.history.push(ExecutionHistoryEntry {
                    node_id: node.id.clone(),
                    timestamp: Utc::now(),
                    duration_ms: run.duration_ms,
                    status: StepStatus::Failure,
                    attempts,
                    input: input.clone(),
                    output: None,
                    error: Some(error.to_string()),
                });
                record.metrics.error_count += 1;
                record.metrics.retry_count += u64::from(attempts.saturating_sub(1));

                self.event_bus.publish(WorkflowEvent::NodeExecuted {
                    execution_id: scope.execution_id.to_string(),
                    node_id: node.id.clone(),
                    node_type: node.node_type,
                    duration_ms: run.duration_ms,
                    success: false,
                });
                Err(error)
            }
        }
    }
}
