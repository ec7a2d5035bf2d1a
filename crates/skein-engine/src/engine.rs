use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::info;

use skein_core::config::EngineConfig;
use skein_core::definition::{NodeType, WorkflowDefinition};
use skein_core::error::{Result, SkeinError, WorkflowErrorKind};
use skein_core::event::{EngineEvent, EventBus, WorkflowEvent};
use skein_core::execution::{Checkpoint, ExecutionConfig, HumanInputRequest, WorkflowExecution, WorkflowSummary};
use skein_core::state::{WorkflowState, PENDING_AGENT_MESSAGES_CHANNEL};
use skein_core::traits::{AgentMessenger, CompletionClient, ToolExecutor};

use crate::checkpoint::CheckpointStore;
use crate::compiler::{CompiledWorkflow, GraphCompiler};
use crate::dispatcher::NodeDispatcher;
use crate::handlers::agent::completed_update;
use crate::handlers::{
    AgentHandler, CustomHandler, HandlerRegistry, HumanHandler, LlmHandler, NodeHandler, ToolHandler,
};
use crate::human::HumanInputGateway;
use crate::lifecycle::{ExecutionLifecycleManager, ExecutionSlot};

/// Assembles a [`WorkflowEngine`] from its collaborators.
///
/// Custom and human handlers are always available; agent, tool and LLM
/// handlers are registered when their collaborator is supplied.
pub struct WorkflowEngineBuilder {
    config: EngineConfig,
    event_bus: Option<Arc<EventBus>>,
    agent_messenger: Option<Arc<dyn AgentMessenger>>,
    tool_executor: Option<Arc<dyn ToolExecutor>>,
    completion_client: Option<Arc<dyn CompletionClient>>,
    handlers: Vec<(NodeType, Arc<dyn NodeHandler>)>,
}

impl WorkflowEngineBuilder {
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn with_agent_messenger(mut self, messenger: Arc<dyn AgentMessenger>) -> Self {
        self.agent_messenger = Some(messenger);
        self
    }

    pub fn with_tool_executor(mut self, executor: Arc<dyn ToolExecutor>) -> Self {
        self.tool_executor = Some(executor);
        self
    }

    pub fn with_completion_client(mut self, client: Arc<dyn CompletionClient>) -> Self {
        self.completion_client = Some(client);
        self
    }

    /// Register a handler for a node type, replacing the built-in one.
    pub fn with_handler(mut self, node_type: NodeType, handler: Arc<dyn NodeHandler>) -> Self {
        self.handlers.push((node_type, handler));
        self
    }

    pub fn build(self) -> WorkflowEngine {
        let event_bus = self
            .event_bus
            .unwrap_or_else(|| Arc::new(EventBus::new(self.config.event_capacity)));
        let human = Arc::new(HumanInputGateway::new(event_bus.clone()));

        let mut registry = HandlerRegistry::new();
        registry.register(NodeType::Custom, Arc::new(CustomHandler));
        registry.register(
            NodeType::Human,
            Arc::new(HumanHandler::new(human.clone(), self.config.human_input_timeout())),
        );
        if let Some(messenger) = self.agent_messenger {
            registry.register(NodeType::Agent, Arc::new(AgentHandler::new(messenger)));
        }
        if let Some(executor) = self.tool_executor {
            registry.register(NodeType::Tool, Arc::new(ToolHandler::new(executor)));
        }
        if let Some(client) = self.completion_client {
            registry.register(NodeType::Llm, Arc::new(LlmHandler::new(client)));
        }
        for (node_type, handler) in self.handlers {
            registry.register(node_type, handler);
        }

        let checkpoints = Arc::new(CheckpointStore::new());
        let dispatcher = NodeDispatcher::new(registry, event_bus.clone(), self.config.default_parallel_limit);
        let lifecycle = Arc::new(ExecutionLifecycleManager::new(
            dispatcher,
            checkpoints.clone(),
            event_bus.clone(),
            self.config.max_node_visits,
        ));

        WorkflowEngine {
            config: Arc::new(self.config),
            event_bus,
            lifecycle,
            checkpoints,
            human,
            workflows: Arc::new(RwLock::new(HashMap::new())),
            executions: Arc::new(RwLock::new(HashMap::new())),
            delivered: Arc::new(RwLock::new(HashSet::new())),
        }
    }
}

/// The workflow execution engine: definition table, execution table and
/// the management API over them. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct WorkflowEngine {
    config: Arc<EngineConfig>,
    event_bus: Arc<EventBus>,
    lifecycle: Arc<ExecutionLifecycleManager>,
    checkpoints: Arc<CheckpointStore>,
    human: Arc<HumanInputGateway>,
    workflows: Arc<RwLock<HashMap<String, Arc<CompiledWorkflow>>>>,
    executions: Arc<RwLock<HashMap<String, Arc<ExecutionSlot>>>>,
    /// Correlation ids whose agent response was already delivered.
    delivered: Arc<RwLock<HashSet<String>>>,
}

impl WorkflowEngine {
    pub fn builder() -> WorkflowEngineBuilder {
        WorkflowEngineBuilder {
            config: EngineConfig::default(),
            event_bus: None,
            agent_messenger: None,
            tool_executor: None,
            completion_client: None,
            handlers: Vec::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn event_bus(&self) -> Arc<EventBus> {
        self.event_bus.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.event_bus.subscribe()
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        self.lifecycle.dispatcher().handlers()
    }

    /// Validate and compile a definition without registering it.
    pub fn compile(&self, definition: WorkflowDefinition) -> Result<CompiledWorkflow> {
        GraphCompiler::new(self.handlers()).compile(definition)
    }

    /// Validate, compile and register a definition. Returns its id.
    pub async fn create_workflow(&self, definition: WorkflowDefinition) -> Result<String> {
        let compiled = self.compile(definition)?;
        let id = compiled.id.clone();
        let name = compiled.name.clone();

        let replaced = self
            .workflows
            .write()
            .await
            .insert(id.clone(), Arc::new(compiled))
            .is_some();
        info!(workflow_id = %id, name = %name, replaced, "Workflow registered");
        self.event_bus.publish(WorkflowEvent::Created {
            workflow_id: id.clone(),
            name,
        });
        Ok(id)
    }

    /// Run a workflow to its end (or pause/cancel) and return the record.
    ///
    /// Fails only when no execution could be created; node failures and
    /// timeouts are reported through the returned record's status and error.
    pub async fn execute_workflow(
        &self,
        workflow_id: &str,
        input: Map<String, Value>,
        config: ExecutionConfig,
    ) -> Result<WorkflowExecution> {
        let slot = self.prepare(workflow_id, input, &config).await?;
        self.lifecycle.begin(&slot).await;
        let entry = slot.workflow.entry_point.clone();
        Ok(self.lifecycle.drive(&slot, Some(entry)).await)
    }

    /// Like [`execute_workflow`](Self::execute_workflow) but runs in a
    /// background task. The execution is `running` when this returns.
    pub async fn start_workflow(
        &self,
        workflow_id: &str,
        input: Map<String, Value>,
        config: ExecutionConfig,
    ) -> Result<(String, JoinHandle<WorkflowExecution>)> {
        let slot = self.prepare(workflow_id, input, &config).await?;
        self.lifecycle.begin(&slot).await;
        let execution_id = slot.record.lock().await.id.clone();

        let lifecycle = self.lifecycle.clone();
        let handle = tokio::spawn(async move {
            let entry = slot.workflow.entry_point.clone();
            lifecycle.drive(&slot, Some(entry)).await
        });
        Ok((execution_id, handle))
    }

    pub async fn pause_workflow(&self, execution_id: &str) -> Result<Checkpoint> {
        let slot = self.slot(execution_id).await?;
        self.lifecycle.pause(&slot).await
    }

    /// Resume a paused execution from its latest checkpoint. The new run
    /// segment runs in the background; the handle yields the record once it
    /// ends.
    pub async fn resume_workflow(&self, execution_id: &str) -> Result<JoinHandle<WorkflowExecution>> {
        let slot = self.slot(execution_id).await?;
        let from = self.lifecycle.resume(&slot).await?;
        let lifecycle = self.lifecycle.clone();
        Ok(tokio::spawn(async move { lifecycle.drive(&slot, from).await }))
    }

    pub async fn cancel_workflow(&self, execution_id: &str) -> Result<WorkflowExecution> {
        let slot = self.slot(execution_id).await?;
        self.lifecycle.cancel(&slot).await
    }

    /// Snapshot of an execution.
    pub async fn get_workflow_status(&self, execution_id: &str) -> Result<WorkflowExecution> {
        Ok(self.slot(execution_id).await?.snapshot().await)
    }

    /// Registered workflows, oldest first.
    pub async fn list_workflows(&self) -> Vec<WorkflowSummary> {
        let mut summaries: Vec<_> = self.workflows.read().await.values().map(|w| w.summary()).collect();
        summaries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        summaries
    }

    /// The registered definition, with its assigned id.
    pub async fn get_workflow(&self, workflow_id: &str) -> Result<WorkflowDefinition> {
        Ok(self.workflow(workflow_id).await?.definition().clone())
    }

    /// Unregister a workflow. Fails with `WORKFLOW_IN_USE` while any of its
    /// executions is running. Its finished executions are evicted along with
    /// their checkpoints; paused ones stay resumable.
    pub async fn delete_workflow(&self, workflow_id: &str) -> Result<()> {
        let mut workflows = self.workflows.write().await;
        if !workflows.contains_key(workflow_id) {
            return Err(SkeinError::not_found(format!("workflow '{}'", workflow_id)));
        }
        let mut executions = self.executions.write().await;
        let mut finished = Vec::new();
        for (execution_id, slot) in executions.iter() {
            if slot.workflow.id != workflow_id {
                continue;
            }
            let record = slot.record.lock().await;
            if record.is_running() {
                return Err(SkeinError::workflow(
                    WorkflowErrorKind::InUse,
                    format!("workflow '{}' has running executions", workflow_id),
                ));
            }
            if record.status.is_terminal() {
                finished.push(execution_id.clone());
            }
        }

        workflows.remove(workflow_id);
        let mut dropped_checkpoints = 0;
        for execution_id in &finished {
            executions.remove(execution_id);
            dropped_checkpoints += self.checkpoints.delete(execution_id);
        }
        info!(
            workflow_id,
            evicted = finished.len(),
            dropped_checkpoints,
            "Workflow deleted"
        );
        Ok(())
    }

    /// Deliver input to the oldest human node waiting under `node_id`.
    /// Returns false when no node is waiting (including after a timeout).
    pub fn submit_human_input(&self, node_id: &str, input: Value, user_id: &str) -> bool {
        self.human.submit(node_id, input, user_id)
    }

    pub fn pending_human_inputs(&self) -> Vec<HumanInputRequest> {
        self.human.pending_requests()
    }

    /// Complete an agent request that answered `pending`.
    ///
    /// Finds the finished or paused execution holding `correlation_id` in its
    /// pending agent messages and runs a new execution of the same workflow
    /// from the agent node's successor, with the reply merged into state.
    pub async fn deliver_agent_response(&self, correlation_id: &str, data: Value) -> Result<WorkflowExecution> {
        // Claim the id before searching so concurrent deliveries cannot both pass.
        if !self.delivered.write().await.insert(correlation_id.to_string()) {
            return Err(SkeinError::invalid_state(format!(
                "agent response '{}' already delivered",
                correlation_id
            )));
        }
        let (workflow, mut state, node_id, agent_id) = match self.claim_pending(correlation_id).await {
            Ok(found) => found,
            Err(e) => {
                self.delivered.write().await.remove(correlation_id);
                return Err(e);
            }
        };

        if let Some(Value::Object(entries)) = state.get(PENDING_AGENT_MESSAGES_CHANNEL) {
            let mut remaining = entries.clone();
            remaining.remove(correlation_id);
            state.set(PENDING_AGENT_MESSAGES_CHANNEL, Value::Object(remaining));
        }
        state.merge(&completed_update(&node_id, &agent_id, data), &workflow.schema);
        let from = workflow.next(&node_id, &state);

        info!(correlation_id, node_id = %node_id, from = ?from, "Agent response delivered");

        let timeout = self.timeout_for(&workflow, &ExecutionConfig::default());
        let record = WorkflowExecution::new(&workflow.id, state);
        let slot = self.register(workflow, record, timeout).await;
        self.lifecycle.begin(&slot).await;
        Ok(self.lifecycle.drive(&slot, from).await)
    }

    /// Checkpoints recorded for an execution, oldest first.
    pub fn checkpoints(&self, execution_id: &str) -> Vec<Checkpoint> {
        self.checkpoints.list(execution_id)
    }

    /// Locate the pending entry for `correlation_id` and read its node and agent ids.
    async fn claim_pending(&self, correlation_id: &str) -> Result<(Arc<CompiledWorkflow>, WorkflowState, String, String)> {
        let (workflow, state, pending) = self.find_pending(correlation_id).await?;
        let node_id = pending
            .get("node_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| SkeinError::invalid_state(format!("pending entry '{}' has no node_id", correlation_id)))?
            .to_string();
        let agent_id = pending
            .get("agent_id")
            .and_then(|v| v.as_str())
            .unwrap_or(&node_id)
            .to_string();
        Ok((workflow, state, node_id, agent_id))
    }

    async fn find_pending(&self, correlation_id: &str) -> Result<(Arc<CompiledWorkflow>, WorkflowState, Value)> {
        for slot in self.executions.read().await.values() {
            let record = slot.record.lock().await;
            if record.is_running() {
                continue;
            }
            let entry = record
                .state
                .get(PENDING_AGENT_MESSAGES_CHANNEL)
                .and_then(|pending| pending.get(correlation_id))
                .cloned();
            if let Some(entry) = entry {
                return Ok((slot.workflow.clone(), record.state.clone(), entry));
            }
        }
        Err(SkeinError::not_found(format!("pending agent message '{}'", correlation_id)))
    }

    async fn prepare(
        &self,
        workflow_id: &str,
        input: Map<String, Value>,
        config: &ExecutionConfig,
    ) -> Result<Arc<ExecutionSlot>> {
        let workflow = self.workflow(workflow_id).await?;
        let state = WorkflowState::initial(&workflow.schema, &input);
        let timeout = self.timeout_for(&workflow, config);
        let record = WorkflowExecution::new(&workflow.id, state);
        Ok(self.register(workflow, record, timeout).await)
    }

    async fn register(
        &self,
        workflow: Arc<CompiledWorkflow>,
        record: WorkflowExecution,
        timeout: Option<Duration>,
    ) -> Arc<ExecutionSlot> {
        let execution_id = record.id.clone();
        let slot = Arc::new(ExecutionSlot::new(workflow, record, timeout));
        self.executions.write().await.insert(execution_id, slot.clone());
        slot
    }

    fn timeout_for(&self, workflow: &CompiledWorkflow, config: &ExecutionConfig) -> Option<Duration> {
        config
            .timeout_ms
            .or(workflow.config.timeout_ms)
            .map(Duration::from_millis)
            .or_else(|| self.config.default_timeout())
    }

    async fn workflow(&self, workflow_id: &str) -> Result<Arc<CompiledWorkflow>> {
        self.workflows
            .read()
            .await
            .get(workflow_id)
            .cloned()
            .ok_or_else(|| SkeinError::not_found(format!("workflow '{}'", workflow_id)))
    }

    async fn slot(&self, execution_id: &str) -> Result<Arc<ExecutionSlot>> {
        self.executions
            .read()
            .await
            .get(execution_id)
            .cloned()
            .ok_or_else(|| SkeinError::not_found(format!("execution '{}'", execution_id)))
    }
}
