//! Scripted collaborators, an event recorder and definition fixtures.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{json, Map, Value};
use tokio::sync::broadcast;

use skein_core::definition::Node;
use skein_core::error::{Result, SkeinError};
use skein_core::event::{EngineEvent, EventBus};
use skein_core::state::StateUpdate;
use skein_core::traits::{
    AgentMessage, AgentMessenger, AgentResponse, CompletionClient, CompletionRequest, ToolExecutor,
    ToolInvocation,
};

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Agent messenger answering from a script, recording every message sent.
#[derive(Default)]
pub struct MockAgentMessenger {
    responses: Mutex<VecDeque<Result<AgentResponse>>>,
    sent: Mutex<Vec<AgentMessage>>,
}

impl MockAgentMessenger {
    pub fn new(responses: Vec<Result<AgentResponse>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn sent(&self) -> Vec<AgentMessage> {
        lock(&self.sent).clone()
    }
}

impl AgentMessenger for MockAgentMessenger {
    fn send_message(&self, message: AgentMessage) -> BoxFuture<'_, Result<AgentResponse>> {
        Box::pin(async move {
            lock(&self.sent).push(message);
            lock(&self.responses)
                .pop_front()
                .unwrap_or_else(|| Err(SkeinError::Agent("no scripted response".into())))
        })
    }
}

/// Tool executor with per-tool scripted results.
///
/// Unscripted calls echo `{tool, arguments}`. Tools marked with
/// [`with_circuit_open`](Self::with_circuit_open) always fail with
/// [`SkeinError::CircuitOpen`].
#[derive(Default)]
pub struct MockToolExecutor {
    results: Mutex<HashMap<String, VecDeque<Result<Value>>>>,
    open: HashSet<String>,
    calls: Mutex<Vec<ToolInvocation>>,
}

impl MockToolExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a result for the next call to `tool`.
    pub fn with_result(self, tool: &str, result: Result<Value>) -> Self {
        lock(&self.results)
            .entry(tool.to_string())
            .or_default()
            .push_back(result);
        self
    }

    pub fn with_circuit_open(mut self, tool: &str) -> Self {
        self.open.insert(tool.to_string());
        self
    }

    pub fn calls(&self) -> Vec<ToolInvocation> {
        lock(&self.calls).clone()
    }
}

impl ToolExecutor for MockToolExecutor {
    fn execute_tool(&self, invocation: ToolInvocation) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let name = invocation.tool_name.clone();
            lock(&self.calls).push(invocation.clone());
            if self.open.contains(&name) {
                return Err(SkeinError::CircuitOpen { tool: name });
            }
            let scripted = lock(&self.results).get_mut(&name).and_then(|q| q.pop_front());
            scripted.unwrap_or_else(|| Ok(json!({"tool": name, "arguments": invocation.arguments})))
        })
    }
}

/// Completion client replying from a script, then with `"ok"`.
#[derive(Default)]
pub struct MockCompletionClient {
    replies: Mutex<VecDeque<String>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl MockCompletionClient {
    pub fn new(replies: Vec<String>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        lock(&self.requests).clone()
    }
}

impl CompletionClient for MockCompletionClient {
    fn complete(&self, request: CompletionRequest) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            lock(&self.requests).push(request);
            Ok(lock(&self.replies).pop_front().unwrap_or_else(|| "ok".to_string()))
        })
    }
}

/// Collects events from an [`EventBus`] subscription.
pub struct EventRecorder {
    rx: broadcast::Receiver<EngineEvent>,
    events: Vec<EngineEvent>,
}

impl EventRecorder {
    pub fn new(bus: &EventBus) -> Self {
        Self {
            rx: bus.subscribe(),
            events: Vec::new(),
        }
    }

    /// Pull everything published so far and return the full log.
    pub fn drain(&mut self) -> &[EngineEvent] {
        while let Ok(event) = self.rx.try_recv() {
            self.events.push(event);
        }
        &self.events
    }

    pub fn names(&mut self) -> Vec<&'static str> {
        self.drain().iter().map(|e| e.event.name()).collect()
    }

    /// Wait until an event named `name` arrives.
    pub async fn wait_for(&mut self, name: &str, timeout: Duration) -> Option<EngineEvent> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let event = tokio::time::timeout_at(deadline, self.rx.recv()).await.ok()?.ok()?;
            self.events.push(event.clone());
            if event.event.name() == name {
                return Some(event);
            }
        }
    }
}

/// Build a state input map from a JSON object literal.
pub fn input(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

/// Custom node incrementing the `step` channel.
pub fn step_node(id: &str) -> Node {
    Node::custom(id, |state| {
        let step = state.get("step").and_then(|v| v.as_i64()).unwrap_or(0);
        let mut update = StateUpdate::new();
        update.insert("step".into(), json!(step + 1));
        Ok(update)
    })
}

/// Custom node writing a fixed value.
pub fn set_node(id: &str, key: &str, value: Value) -> Node {
    let key = key.to_string();
    Node::custom(id, move |_| {
        let mut update = StateUpdate::new();
        update.insert(key.clone(), value.clone());
        Ok(update)
    })
}

/// Custom node that fails `fail_times` times, then sets `{id}_done`.
/// `calls` counts every invocation.
pub fn flaky_node(id: &str, fail_times: u32, calls: Arc<AtomicU32>) -> Node {
    let done = format!("{}_done", id);
    Node::custom(id, move |_| {
        let n = calls.fetch_add(1, Ordering::SeqCst);
        if n < fail_times {
            return Err(SkeinError::Handler(format!("transient failure {}", n + 1)));
        }
        let mut update = StateUpdate::new();
        update.insert(done.clone(), Value::Bool(true));
        Ok(update)
    })
}
