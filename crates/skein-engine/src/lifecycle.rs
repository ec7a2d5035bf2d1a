use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use skein_core::error::{Result, SkeinError, WorkflowErrorKind};
use skein_core::event::{EventBus, WorkflowEvent};
use skein_core::execution::{Checkpoint, CheckpointMeta, CheckpointReason, ExecutionStatus, WorkflowExecution};

use crate::checkpoint::CheckpointStore;
use crate::compiler::CompiledWorkflow;
use crate::dispatcher::{Dispatch, NodeDispatcher, StepScope};

/// Engine-side handle on one execution.
pub struct ExecutionSlot {
    pub workflow: Arc<CompiledWorkflow>,
    pub record: Arc<Mutex<WorkflowExecution>>,
    /// Cancellation signal of the current run segment. Replaced on resume.
    token: std::sync::Mutex<CancellationToken>,
    /// Armed in full for every run segment.
    pub timeout: Option<Duration>,
}

impl ExecutionSlot {
    pub fn new(workflow: Arc<CompiledWorkflow>, record: WorkflowExecution, timeout: Option<Duration>) -> Self {
        Self {
            workflow,
            record: Arc::new(Mutex::new(record)),
            token: std::sync::Mutex::new(CancellationToken::new()),
            timeout,
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn rotate_token(&self) -> CancellationToken {
        let fresh = CancellationToken::new();
        *self.token.lock().unwrap_or_else(|e| e.into_inner()) = fresh.clone();
        fresh
    }

    fn cancel_segment(&self) {
        self.token.lock().unwrap_or_else(|e| e.into_inner()).cancel();
    }

    pub async fn snapshot(&self) -> WorkflowExecution {
        self.record.lock().await.clone()
    }
}

/// How a walk over the graph ended.
enum WalkEnd {
    /// No successor: the execution is complete.
    Finished,
    /// The segment lost the right to change the record (pause, cancel, timeout).
    Interrupted,
}

/// Drives executions through `pending -> running -> {completed | failed |
/// paused | cancelled}` and owns timeouts, pause, resume and cancel.
pub struct ExecutionLifecycleManager {
    dispatcher: NodeDispatcher,
    checkpoints: Arc<CheckpointStore>,
    event_bus: Arc<EventBus>,
    max_node_visits: usize,
}

impl ExecutionLifecycleManager {
    pub fn new(
        dispatcher: NodeDispatcher,
        checkpoints: Arc<CheckpointStore>,
        event_bus: Arc<EventBus>,
        max_node_visits: usize,
    ) -> Self {
        Self {
            dispatcher,
            checkpoints,
            event_bus,
            max_node_visits: max_node_visits.max(1),
        }
    }

    pub fn dispatcher(&self) -> &NodeDispatcher {
        &self.dispatcher
    }

    /// Move a pending execution to `running`.
    pub async fn begin(&self, slot: &ExecutionSlot) {
        let mut record = slot.record.lock().await;
        record.status = ExecutionStatus::Running;
        record.start_time = Utc::now();
        info!(execution_id = %record.id, workflow_id = %record.workflow_id, "Execution started");
        self.event_bus.publish(WorkflowEvent::Started {
            execution_id: record.id.clone(),
            workflow_id: record.workflow_id.clone(),
        });
    }

    /// Run one segment of an execution from `start` until it finishes, fails,
    /// times out or is interrupted, and return the resulting record.
    pub async fn drive(&self, slot: &ExecutionSlot, start: Option<String>) -> WorkflowExecution {
        let cancel = slot.token();
        let execution_id = slot.record.lock().await.id.clone();

        let walk = self.walk(slot, &execution_id, start, &cancel);
        let outcome = match slot.timeout {
            Some(limit) => tokio::select! {
                outcome = walk => Some(outcome),
                _ = tokio::time::sleep(limit) => None,
            },
            None => Some(walk.await),
        };

        let mut record = slot.record.lock().await;
        let live = record.is_running() && !cancel.is_cancelled();
        match outcome {
            _ if !live => {
                debug!(execution_id = %execution_id, status = %record.status, "Segment ended after interruption");
            }
            None => {
                let timeout_ms = slot.timeout.map(|d| d.as_millis() as u64).unwrap_or_default();
                let err = SkeinError::WorkflowTimeout {
                    execution_id: execution_id.clone(),
                    timeout_ms,
                };
                warn!(execution_id = %execution_id, timeout_ms, "Execution timed out");
                record.finish(ExecutionStatus::Failed, Some(&err));
                cancel.cancel();
                self.event_bus.publish(WorkflowEvent::Timeout {
                    execution_id: execution_id.clone(),
                    timeout_ms,
                });
                self.publish_failed(&record);
            }
            Some(Ok(WalkEnd::Finished)) => {
                record.finish(ExecutionStatus::Completed, None);
                info!(
                    execution_id = %execution_id,
                    nodes = record.metrics.nodes_executed,
                    duration_ms = record.metrics.execution_time_ms,
                    "Execution completed"
                );
                self.event_bus.publish(WorkflowEvent::Completed {
                    execution_id: execution_id.clone(),
                    workflow_id: record.workflow_id.clone(),
                    duration_ms: record.metrics.execution_time_ms,
                });
            }
            // A walk that was interrupted leaves the segment dead
            Some(Ok(WalkEnd::Interrupted)) => {}
            Some(Err(e)) => {
                error!(execution_id = %execution_id, error = %e, "Execution failed");
                record.finish(ExecutionStatus::Failed, Some(&e));
                cancel.cancel();
                self.publish_failed(&record);
            }
        }
        record.clone()
    }

    async fn walk(
        &self,
        slot: &ExecutionSlot,
        execution_id: &str,
        start: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<WalkEnd> {
        let workflow = slot.workflow.as_ref();
        let scope = StepScope {
            workflow,
            execution_id,
            record: slot.record.as_ref(),
            cancel,
        };
        let interval = workflow.config.checkpoint_interval;
        let mut visits: HashMap<String, usize> = HashMap::new();
        let mut steps: u32 = 0;
        let mut current = start;

        while let Some(vertex_id) = current {
            let count = visits.entry(vertex_id.clone()).or_insert(0);
            *count += 1;
            if *count > self.max_node_visits {
                warn!(
                    execution_id,
                    node_id = %vertex_id,
                    max_visits = self.max_node_visits,
                    "Node visit limit reached, terminating execution"
                );
                return Err(SkeinError::workflow(
                    WorkflowErrorKind::StepLimit,
                    format!(
                        "node '{}' visited more than {} times",
                        vertex_id, self.max_node_visits
                    ),
                ));
            }

            let vertex = workflow
                .vertex(&vertex_id)
                .ok_or_else(|| SkeinError::not_found(format!("node '{}'", vertex_id)))?;

            let input = {
                let record = slot.record.lock().await;
                if !scope.is_live(&record) {
                    return Ok(WalkEnd::Interrupted);
                }
                record.state.clone()
            };

            info!(execution_id, node_id = %vertex_id, "Executing node");
            if self.dispatcher.dispatch(&scope, vertex, &input).await? == Dispatch::Discarded {
                return Ok(WalkEnd::Interrupted);
            }

            let mut record = slot.record.lock().await;
            if !scope.is_live(&record) {
                return Ok(WalkEnd::Interrupted);
            }
            steps += 1;
            if interval > 0 && steps % interval == 0 {
                let checkpoint = self.checkpoints.put(
                    execution_id,
                    &record.state,
                    CheckpointMeta {
                        node_id: Some(vertex_id.clone()),
                        reason: CheckpointReason::Interval,
                    },
                );
                debug!(execution_id, checkpoint_id = %checkpoint.id, steps, "Interval checkpoint recorded");
                record.checkpoints.push(checkpoint);
            }

            current = workflow.next(&vertex_id, &record.state);
            match &current {
                Some(next) => debug!(execution_id, from = %vertex_id, to = %next, "Following transition"),
                None => debug!(execution_id, node_id = %vertex_id, "No outgoing transition, execution complete"),
            }
        }

        Ok(WalkEnd::Finished)
    }

    /// Checkpoint the last committed state and stop the running segment.
    pub async fn pause(&self, slot: &ExecutionSlot) -> Result<Checkpoint> {
        let mut record = slot.record.lock().await;
        if record.status != ExecutionStatus::Running {
            return Err(SkeinError::invalid_state(format!(
                "cannot pause execution {} in status {}",
                record.id, record.status
            )));
        }
        let checkpoint = self.checkpoints.put(
            &record.id,
            &record.state,
            CheckpointMeta {
                node_id: record.last_completed.clone(),
                reason: CheckpointReason::Pause,
            },
        );
        record.checkpoints.push(checkpoint.clone());
        record.status = ExecutionStatus::Paused;
        slot.cancel_segment();

        info!(execution_id = %record.id, checkpoint_id = %checkpoint.id, "Execution paused");
        self.event_bus.publish(WorkflowEvent::Paused {
            execution_id: record.id.clone(),
            checkpoint_id: checkpoint.id.clone(),
        });
        Ok(checkpoint)
    }

    /// Restore the latest checkpoint and mark the execution running again.
    /// Returns the vertex the new segment starts from.
    pub async fn resume(&self, slot: &ExecutionSlot) -> Result<Option<String>> {
        let mut record = slot.record.lock().await;
        if record.status != ExecutionStatus::Paused {
            return Err(SkeinError::invalid_state(format!(
                "cannot resume execution {} in status {}",
                record.id, record.status
            )));
        }

        if let Some(checkpoint) = self.checkpoints.latest(&record.id) {
            record.state = checkpoint.state;
            record.last_completed = checkpoint.node_id;
        }
        let from = match &record.last_completed {
            Some(last) => slot.workflow.next(last, &record.state),
            None => Some(slot.workflow.entry_point.clone()),
        };

        slot.rotate_token();
        record.status = ExecutionStatus::Running;
        info!(execution_id = %record.id, from = ?from, "Execution resumed");
        self.event_bus.publish(WorkflowEvent::Resumed {
            execution_id: record.id.clone(),
            from_node: from.clone(),
        });
        Ok(from)
    }

    /// Cancel a running or paused execution.
    pub async fn cancel(&self, slot: &ExecutionSlot) -> Result<WorkflowExecution> {
        let mut record = slot.record.lock().await;
        if !matches!(record.status, ExecutionStatus::Running | ExecutionStatus::Paused) {
            return Err(SkeinError::invalid_state(format!(
                "cannot cancel execution {} in status {}",
                record.id, record.status
            )));
        }
        let err = SkeinError::workflow(WorkflowErrorKind::Cancelled, "cancelled by user");
        record.finish(ExecutionStatus::Cancelled, Some(&err));
        slot.cancel_segment();

        info!(execution_id = %record.id, "Execution cancelled");
        self.event_bus.publish(WorkflowEvent::Cancelled {
            execution_id: record.id.clone(),
        });
        Ok(record.clone())
    }

    fn publish_failed(&self, record: &WorkflowExecution) {
        if let Some(error) = &record.error {
            self.event_bus.publish(WorkflowEvent::Failed {
                execution_id: record.id.clone(),
                error: error.clone(),
            });
        }
    }
}
