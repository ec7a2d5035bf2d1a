use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{json, Value};

use skein_core::definition::{
    ConditionalRoute, Node, NodeType, ParallelGroup, RetryPolicy, WorkflowConfig, WorkflowDefinition,
};
use skein_core::error::{Result, SkeinError, WorkflowErrorKind};
use skein_core::event::WorkflowEvent;
use skein_core::execution::{CheckpointReason, ExecutionConfig, ExecutionStatus, StepStatus};
use skein_core::state::{ChannelSpec, MergeRule, StateUpdate, WorkflowState};
use skein_core::traits::AgentResponse;
use skein_core::types::{ChatMessage, Role};
use skein_engine::{NodeContext, NodeHandler, WorkflowEngine};
use skein_test_utils::{
    flaky_node, input, set_node, step_node, EventRecorder, MockAgentMessenger, MockToolExecutor,
};

const WAIT: Duration = Duration::from_secs(5);

/// Increments `step` after a delay. Registered for tool nodes so tests get
/// an asynchronous step that can be interrupted mid-flight.
struct SlowStep(Duration);

impl NodeHandler for SlowStep {
    fn handle<'a>(
        &'a self,
        _ctx: NodeContext<'a>,
        state: &'a WorkflowState,
    ) -> BoxFuture<'a, Result<StateUpdate>> {
        Box::pin(async move {
            tokio::time::sleep(self.0).await;
            let step = state.get("step").and_then(|v| v.as_i64()).unwrap_or(0);
            let mut update = StateUpdate::new();
            update.insert("step".into(), json!(step + 1));
            Ok(update)
        })
    }
}

fn engine() -> WorkflowEngine {
    WorkflowEngine::builder().build()
}

fn slow_engine(delay: Duration) -> WorkflowEngine {
    WorkflowEngine::builder()
        .with_handler(NodeType::Tool, Arc::new(SlowStep(delay)))
        .build()
}

fn slow(id: &str) -> Node {
    Node::new(id, NodeType::Tool)
}

#[tokio::test]
async fn missing_entry_point_is_a_validation_error() {
    let engine = engine();
    let def = WorkflowDefinition::new("broken", "nowhere").node(step_node("a"));
    let err = engine.create_workflow(def).await.unwrap_err();
    match err {
        SkeinError::Validation { violations } => {
            assert!(violations.iter().any(|v| v.contains("nowhere")));
        }
        other => panic!("expected validation error, got {other}"),
    }
    assert!(engine.list_workflows().await.is_empty());
}

#[tokio::test]
async fn single_transform_runs_once() {
    let engine = engine();
    let mut recorder = EventRecorder::new(&engine.event_bus());
    let id = engine
        .create_workflow(WorkflowDefinition::new("once", "inc").node(step_node("inc")))
        .await
        .unwrap();

    let exec = engine
        .execute_workflow(&id, input(json!({"step": 0})), ExecutionConfig::default())
        .await
        .unwrap();

    assert_eq!(exec.status, ExecutionStatus::Completed);
    assert_eq!(exec.state.get("step"), Some(&json!(1)));
    assert_eq!(exec.history.len(), 1);
    assert_eq!(exec.history[0].status, StepStatus::Success);
    assert_eq!(exec.history[0].input.get("step"), Some(&json!(0)));
    assert_eq!(exec.metrics.nodes_executed, 1);
    assert_eq!(
        recorder.names(),
        vec![
            "workflow:created",
            "workflow:started",
            "node:executed",
            "workflow:stream",
            "workflow:completed"
        ]
    );
}

#[tokio::test]
async fn retries_until_success() {
    let engine = engine();
    let calls = Arc::new(AtomicU32::new(0));
    let node = flaky_node("flaky", 2, calls.clone())
        .with_retry(RetryPolicy::exponential(3, Duration::from_millis(5)));
    let id = engine
        .create_workflow(WorkflowDefinition::new("retry", "flaky").node(node))
        .await
        .unwrap();

    let exec = engine
        .execute_workflow(&id, input(json!({})), ExecutionConfig::default())
        .await
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(exec.status, ExecutionStatus::Completed);
    assert_eq!(exec.state.get("flaky_done"), Some(&json!(true)));
    assert_eq!(exec.history[0].attempts, 3);
    assert_eq!(exec.metrics.retry_count, 2);
}

#[tokio::test]
async fn exhausted_retries_fail_the_execution() {
    let engine = engine();
    let calls = Arc::new(AtomicU32::new(0));
    let node = flaky_node("flaky", u32::MAX, calls.clone())
        .with_retry(RetryPolicy::linear(3, Duration::from_millis(5)));
    let id = engine
        .create_workflow(WorkflowDefinition::new("retry", "flaky").node(node))
        .await
        .unwrap();

    let exec = engine
        .execute_workflow(&id, input(json!({})), ExecutionConfig::default())
        .await
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(exec.status, ExecutionStatus::Failed);
    let error = exec.error.unwrap();
    assert_eq!(error.class, "NodeExecutionError");
    assert_eq!(error.node_id.as_deref(), Some("flaky"));
    assert_eq!(exec.history[0].status, StepStatus::Failure);
    assert_eq!(exec.metrics.error_count, 1);
}

#[tokio::test]
async fn workflow_max_retries_applies_to_nodes_without_policy() {
    let engine = engine();
    let calls = Arc::new(AtomicU32::new(0));
    let def = WorkflowDefinition::new("retry", "flaky")
        .node(flaky_node("flaky", 1, calls.clone()))
        .with_config(WorkflowConfig {
            max_retries: 1,
            ..Default::default()
        });
    let id = engine.create_workflow(def).await.unwrap();

    let exec = engine
        .execute_workflow(&id, input(json!({})), ExecutionConfig::default())
        .await
        .unwrap();
    assert_eq!(exec.status, ExecutionStatus::Completed);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn score_routing() {
    let engine = engine();
    let def = WorkflowDefinition::new("grading", "grade")
        .node(Node::new("grade", NodeType::Custom).with_meta("assign", json!({"graded": true})))
        .node(set_node("A", "branch", json!("A")))
        .node(set_node("B", "branch", json!("B")))
        .route(
            ConditionalRoute::new("grade", "B")
                .when_expr("A", "score >= 70")
                .when("B", |s| s.get("score").and_then(Value::as_f64).is_some_and(|n| n < 70.0)),
        );
    let id = engine.create_workflow(def).await.unwrap();

    for (score, expected) in [
        (json!(75), "A"),
        (json!(50), "B"),
        (json!("NaN"), "B"),
        (Value::Null, "B"),
    ] {
        let exec = engine
            .execute_workflow(&id, input(json!({ "score": score })), ExecutionConfig::default())
            .await
            .unwrap();
        assert_eq!(exec.status, ExecutionStatus::Completed);
        assert_eq!(exec.state.get("branch"), Some(&json!(expected)), "score {score}");
        assert_eq!(exec.history.len(), 2);
    }
}

#[tokio::test]
async fn pause_then_resume_continues_from_successor() {
    let engine = slow_engine(Duration::from_millis(200));
    let mut recorder = EventRecorder::new(&engine.event_bus());
    let def = WorkflowDefinition::new("pausable", "first")
        .node(step_node("first"))
        .node(slow("second"))
        .edge("first", "second");
    let id = engine.create_workflow(def).await.unwrap();

    let (exec_id, handle) = engine
        .start_workflow(&id, input(json!({"step": 0})), ExecutionConfig::default())
        .await
        .unwrap();
    let executed = recorder.wait_for("node:executed", WAIT).await.unwrap();
    assert!(matches!(
        executed.event,
        WorkflowEvent::NodeExecuted { ref node_id, .. } if node_id == "first"
    ));

    let checkpoint = engine.pause_workflow(&exec_id).await.unwrap();
    assert_eq!(checkpoint.state.get("step"), Some(&json!(1)));
    assert_eq!(checkpoint.node_id.as_deref(), Some("first"));

    let paused = handle.await.unwrap();
    assert_eq!(paused.status, ExecutionStatus::Paused);
    assert_eq!(paused.state.get("step"), Some(&json!(1)));
    assert!(engine.pause_workflow(&exec_id).await.is_err());

    let resumed = engine.resume_workflow(&exec_id).await.unwrap().await.unwrap();
    assert_eq!(resumed.status, ExecutionStatus::Completed);
    assert_eq!(resumed.state.get("step"), Some(&json!(2)));

    let checkpoints = engine.checkpoints(&exec_id);
    assert!(checkpoints
        .iter()
        .any(|c| c.reason == CheckpointReason::Pause && c.state.get("step") == Some(&json!(1))));

    let names = recorder.names();
    assert!(names.contains(&"workflow:paused"));
    assert!(names.contains(&"workflow:resumed"));
}

#[tokio::test]
async fn cancel_stops_node_events() {
    let engine = slow_engine(Duration::from_millis(100));
    let mut recorder = EventRecorder::new(&engine.event_bus());
    let def = WorkflowDefinition::new("cancellable", "a")
        .node(slow("a"))
        .node(slow("b"))
        .node(slow("c"))
        .edge("a", "b")
        .edge("b", "c");
    let id = engine.create_workflow(def).await.unwrap();

    let (exec_id, handle) = engine
        .start_workflow(&id, input(json!({})), ExecutionConfig::default())
        .await
        .unwrap();
    recorder.wait_for("node:executed", WAIT).await.unwrap();

    let cancelled = engine.cancel_workflow(&exec_id).await.unwrap();
    assert_eq!(cancelled.status, ExecutionStatus::Cancelled);
    assert_eq!(cancelled.error.as_ref().map(|e| e.class.as_str()), Some("WorkflowError"));

    let finished = handle.await.unwrap();
    assert_eq!(finished.status, ExecutionStatus::Cancelled);
    assert_eq!(finished.history.len(), 1);

    // Give any stray work time to surface
    tokio::time::sleep(Duration::from_millis(250)).await;
    let events = recorder.drain().to_vec();
    let cancel_at = events
        .iter()
        .find(|e| e.event.name() == "workflow:cancelled")
        .map(|e| e.timestamp)
        .unwrap();
    assert!(events
        .iter()
        .filter(|e| e.event.name() == "node:executed")
        .all(|e| e.timestamp <= cancel_at));
    assert!(engine.resume_workflow(&exec_id).await.is_err());
}

#[tokio::test]
async fn workflow_timeout_fails_execution() {
    let engine = slow_engine(Duration::from_millis(500));
    let mut recorder = EventRecorder::new(&engine.event_bus());
    let id = engine
        .create_workflow(WorkflowDefinition::new("slow", "a").node(slow("a")))
        .await
        .unwrap();

    let exec = engine
        .execute_workflow(&id, input(json!({})), ExecutionConfig { timeout_ms: Some(50) })
        .await
        .unwrap();

    assert_eq!(exec.status, ExecutionStatus::Failed);
    assert_eq!(exec.error.unwrap().class, "WorkflowTimeoutError");
    assert!(exec.history.is_empty());

    let names = recorder.names();
    let timeout = names.iter().position(|n| *n == "workflow:timeout").unwrap();
    let failed = names.iter().position(|n| *n == "workflow:failed").unwrap();
    assert!(timeout < failed);
    assert!(!names.contains(&"node:executed"));
}

#[tokio::test]
async fn circuit_open_tool_is_skipped() {
    let tools = Arc::new(MockToolExecutor::new().with_circuit_open("weather"));
    let engine = WorkflowEngine::builder().with_tool_executor(tools).build();
    let def = WorkflowDefinition::new("forecast", "fetch")
        .node(
            Node::new("fetch", NodeType::Tool)
                .with_meta("tool_name", json!("weather"))
                .with_meta("skip_on_open", json!(true))
                .with_meta("fallback", json!({"forecast": "unknown"})),
        )
        .node(set_node("report", "reported", json!(true)))
        .edge("fetch", "report");
    let id = engine.create_workflow(def).await.unwrap();

    let exec = engine
        .execute_workflow(&id, input(json!({})), ExecutionConfig::default())
        .await
        .unwrap();

    assert_eq!(exec.status, ExecutionStatus::Completed);
    assert_eq!(exec.state.get("fetch_skipped"), Some(&json!(true)));
    assert_eq!(exec.state.get("fetch_result"), Some(&json!({"forecast": "unknown"})));
    assert_eq!(exec.state.get("reported"), Some(&json!(true)));
    assert_eq!(exec.history[0].status, StepStatus::Skipped);
}

#[tokio::test]
async fn human_node_waits_for_input() {
    let engine = engine();
    let mut recorder = EventRecorder::new(&engine.event_bus());
    let def = WorkflowDefinition::new("approval", "approve")
        .node(
            Node::new("approve", NodeType::Human)
                .with_meta("prompt", json!("Ship it?"))
                .with_meta("options", json!(["yes", "no"])),
        )
        .node(set_node("ship", "shipped", json!(true)))
        .edge("approve", "ship");
    let id = engine.create_workflow(def).await.unwrap();

    let (_, handle) = engine
        .start_workflow(&id, input(json!({})), ExecutionConfig::default())
        .await
        .unwrap();
    let required = recorder.wait_for("human:input:required", WAIT).await.unwrap();
    match required.event {
        WorkflowEvent::HumanInputRequired { prompt, options, .. } => {
            assert_eq!(prompt, "Ship it?");
            assert_eq!(options, vec![json!("yes"), json!("no")]);
        }
        other => panic!("unexpected event {}", other.name()),
    }
    assert_eq!(engine.pending_human_inputs().len(), 1);
    assert!(engine.submit_human_input("approve", json!("yes"), "alice"));

    let exec = handle.await.unwrap();
    assert_eq!(exec.status, ExecutionStatus::Completed);
    assert_eq!(exec.state.get("approve_result"), Some(&json!("yes")));
    assert_eq!(exec.state.get("shipped"), Some(&json!(true)));
    let messages = ChatMessage::list_from(exec.state.get("messages"));
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].role, Role::Human);
    assert_eq!(messages[0].name.as_deref(), Some("alice"));
}

#[tokio::test]
async fn human_timeout_fails_and_late_input_is_ignored() {
    let engine = engine();
    let def = WorkflowDefinition::new("approval", "approve").node(
        Node::new("approve", NodeType::Human).with_meta("timeout_ms", json!(30)),
    );
    let id = engine.create_workflow(def).await.unwrap();

    let exec = engine
        .execute_workflow(&id, input(json!({})), ExecutionConfig::default())
        .await
        .unwrap();
    assert_eq!(exec.status, ExecutionStatus::Failed);
    let error = exec.error.unwrap();
    assert_eq!(error.class, "NodeExecutionError");
    assert_eq!(error.node_id.as_deref(), Some("approve"));

    assert!(!engine.submit_human_input("approve", json!("too late"), "bob"));
    let after = engine.get_workflow_status(&exec.id).await.unwrap();
    assert_eq!(after.status, ExecutionStatus::Failed);
    assert!(after.state.get("approve_result").is_none());
}

#[tokio::test]
async fn delete_refused_while_running() {
    let engine = engine();
    let mut recorder = EventRecorder::new(&engine.event_bus());
    let def = WorkflowDefinition::new("approval", "approve").node(Node::new("approve", NodeType::Human));
    let id = engine.create_workflow(def).await.unwrap();

    let (_, handle) = engine
        .start_workflow(&id, input(json!({})), ExecutionConfig::default())
        .await
        .unwrap();
    recorder.wait_for("human:input:required", WAIT).await.unwrap();

    let err = engine.delete_workflow(&id).await.unwrap_err();
    assert!(matches!(err, SkeinError::Workflow { kind: WorkflowErrorKind::InUse, .. }));
    assert!(err.to_string().starts_with("WORKFLOW_IN_USE"));

    assert!(engine.submit_human_input("approve", json!("ok"), "carol"));
    assert_eq!(handle.await.unwrap().status, ExecutionStatus::Completed);
    engine.delete_workflow(&id).await.unwrap();
}

#[tokio::test]
async fn parallel_group_merges_in_declaration_order() {
    let engine = slow_engine(Duration::from_millis(20));
    let def = WorkflowDefinition::new("fanout", "fan")
        .channel("total", ChannelSpec::new(json!(0)).with_merge(MergeRule::Sum))
        .node(Node::custom("left", |_| {
            Ok(input(json!({"total": 1, "winner": "left", "left": true})))
        }))
        .node(Node::custom("right", |_| {
            Ok(input(json!({"total": 2, "winner": "right", "right": true})))
        }))
        .node(slow("tick"))
        .node(set_node("join", "joined", json!(true)))
        .parallel(ParallelGroup::new(
            "fan",
            vec!["left".into(), "tick".into(), "right".into()],
        ))
        .edge("fan", "join")
        .with_config(WorkflowConfig {
            parallel_limit: Some(2),
            ..Default::default()
        });
    let id = engine.create_workflow(def).await.unwrap();

    let exec = engine
        .execute_workflow(&id, input(json!({})), ExecutionConfig::default())
        .await
        .unwrap();

    assert_eq!(exec.status, ExecutionStatus::Completed);
    assert_eq!(exec.state.get("total"), Some(&json!(3)));
    assert_eq!(exec.state.get("winner"), Some(&json!("right")));
    assert_eq!(exec.state.get("step"), Some(&json!(1)));
    assert_eq!(exec.state.get("joined"), Some(&json!(true)));
    let order: Vec<_> = exec.history.iter().map(|h| h.node_id.as_str()).collect();
    assert_eq!(order, vec!["left", "tick", "right", "join"]);
    assert_eq!(exec.metrics.nodes_executed, 4);
}

#[tokio::test]
async fn pending_agent_response_is_delivered_later() {
    let messenger = Arc::new(MockAgentMessenger::new(vec![Ok(AgentResponse::pending())]));
    let engine = WorkflowEngine::builder()
        .with_agent_messenger(messenger.clone())
        .build();
    let def = WorkflowDefinition::new("research", "ask")
        .node(
            Node::new("ask", NodeType::Agent)
                .with_meta("agent_id", json!("researcher"))
                .with_meta("message", json!("Find sources")),
        )
        .node(Node::custom("summarize", |s| {
            let got = s.get("ask_result").cloned().unwrap_or(json!("nothing"));
            Ok(input(json!({ "summary": got })))
        }))
        .edge("ask", "summarize");
    let id = engine.create_workflow(def).await.unwrap();

    let first = engine
        .execute_workflow(&id, input(json!({})), ExecutionConfig::default())
        .await
        .unwrap();
    assert_eq!(first.status, ExecutionStatus::Completed);
    assert_eq!(first.state.get("summary"), Some(&json!("nothing")));
    assert!(ChatMessage::list_from(first.state.get("messages")).is_empty());

    let correlation_id = messenger.sent()[0].correlation_id.clone();
    assert!(first.state.get("pending_agent_messages").unwrap().get(&correlation_id).is_some());

    let delivered = engine
        .deliver_agent_response(&correlation_id, json!("three sources"))
        .await
        .unwrap();
    assert_ne!(delivered.id, first.id);
    assert_eq!(delivered.status, ExecutionStatus::Completed);
    assert_eq!(delivered.state.get("ask_result"), Some(&json!("three sources")));
    assert_eq!(delivered.state.get("summary"), Some(&json!("three sources")));
    assert_eq!(delivered.state.get("pending_agent_messages"), Some(&json!({})));
    let messages = ChatMessage::list_from(delivered.state.get("messages"));
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].role, Role::Agent);

    assert!(engine
        .deliver_agent_response(&correlation_id, json!("again"))
        .await
        .is_err());
    assert!(engine.deliver_agent_response("unknown", json!(1)).await.is_err());
}

#[tokio::test]
async fn paused_execution_can_be_cancelled() {
    let engine = slow_engine(Duration::from_millis(200));
    let mut recorder = EventRecorder::new(&engine.event_bus());
    let def = WorkflowDefinition::new("pausable", "first")
        .node(step_node("first"))
        .node(slow("second"))
        .edge("first", "second");
    let id = engine.create_workflow(def).await.unwrap();

    let (exec_id, handle) = engine
        .start_workflow(&id, input(json!({"step": 0})), ExecutionConfig::default())
        .await
        .unwrap();
    recorder.wait_for("node:executed", WAIT).await.unwrap();
    engine.pause_workflow(&exec_id).await.unwrap();
    assert_eq!(handle.await.unwrap().status, ExecutionStatus::Paused);

    let cancelled = engine.cancel_workflow(&exec_id).await.unwrap();
    assert_eq!(cancelled.status, ExecutionStatus::Cancelled);
    assert!(cancelled.end_time.is_some());
    assert_eq!(cancelled.error.as_ref().map(|e| e.class.as_str()), Some("WorkflowError"));
    assert_eq!(cancelled.state.get("step"), Some(&json!(1)));

    let err = engine.resume_workflow(&exec_id).await.unwrap_err();
    assert!(matches!(err, SkeinError::Workflow { kind: WorkflowErrorKind::InvalidState, .. }));
    assert!(engine.cancel_workflow(&exec_id).await.is_err());

    let status = engine.get_workflow_status(&exec_id).await.unwrap();
    assert_eq!(status.status, ExecutionStatus::Cancelled);
    assert!(recorder.names().contains(&"workflow:cancelled"));
}

#[tokio::test]
async fn human_timeout_is_final_with_workflow_retries() {
    let engine = engine();
    let mut recorder = EventRecorder::new(&engine.event_bus());
    let def = WorkflowDefinition::new("approval", "approve")
        .node(Node::new("approve", NodeType::Human).with_meta("timeout_ms", json!(30)))
        .with_config(WorkflowConfig {
            max_retries: 1,
            ..Default::default()
        });
    let id = engine.create_workflow(def).await.unwrap();

    let (exec_id, handle) = engine
        .start_workflow(&id, input(json!({})), ExecutionConfig::default())
        .await
        .unwrap();
    recorder.wait_for("human:input:required", WAIT).await.unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(!engine.submit_human_input("approve", json!("late"), "dave"));

    let exec = handle.await.unwrap();
    assert_eq!(exec.id, exec_id);
    assert_eq!(exec.status, ExecutionStatus::Failed);
    let error = exec.error.unwrap();
    assert_eq!(error.class, "NodeExecutionError");
    assert_eq!(error.node_id.as_deref(), Some("approve"));
    assert!(exec.state.get("approve_result").is_none());
    assert_eq!(exec.history[0].attempts, 1);

    let prompts = recorder
        .names()
        .into_iter()
        .filter(|n| *n == "human:input:required")
        .count();
    assert_eq!(prompts, 1);
}
