use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, info};

use skein_core::error::{Result, SkeinError};
use skein_core::event::{EventBus, WorkflowEvent};
use skein_core::execution::{HumanInputRequest, HumanInputResponse};
use skein_core::state::WorkflowState;

struct Waiter {
    request: HumanInputRequest,
    tx: oneshot::Sender<HumanInputResponse>,
}

/// Suspend/resume handshake for human nodes.
///
/// Waiters are queued per node id; a submission resolves the oldest live
/// waiter for that node. A waiter leaves the queue when it is resolved,
/// times out or is dropped (cancellation), so late input never reaches it.
pub struct HumanInputGateway {
    pending: Mutex<HashMap<String, VecDeque<Waiter>>>,
    event_bus: Arc<EventBus>,
}

/// Removes a waiter from the queue when its wait ends for any reason.
struct PendingGuard<'a> {
    gateway: &'a HumanInputGateway,
    node_id: String,
    request_id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.gateway.remove(&self.node_id, &self.request_id);
    }
}

impl HumanInputGateway {
    pub fn new(event_bus: Arc<EventBus>) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            event_bus,
        }
    }

    /// Publish `human:input:required` and wait for a submission or timeout.
    pub async fn wait(&self, request: HumanInputRequest, state: &WorkflowState) -> Result<HumanInputResponse> {
        let (tx, rx) = oneshot::channel();
        let node_id = request.node_id.clone();
        let timeout_ms = request.timeout_ms;

        self.lock()
            .entry(node_id.clone())
            .or_default()
            .push_back(Waiter {
                request: request.clone(),
                tx,
            });
        let _guard = PendingGuard {
            gateway: self,
            node_id: node_id.clone(),
            request_id: request.id.clone(),
        };

        self.event_bus.publish(WorkflowEvent::HumanInputRequired {
            execution_id: request.execution_id.clone(),
            node_id: node_id.clone(),
            prompt: request.prompt.clone(),
            options: request.options.clone(),
            timeout_ms,
            state: state.clone(),
        });
        info!(node_id = %node_id, execution_id = %request.execution_id, timeout_ms, "Waiting for human input");

        match tokio::time::timeout(Duration::from_millis(timeout_ms), rx).await {
            Ok(Ok(response)) => Ok(response),
            // Sender dropped without a response
            Ok(Err(_)) => Err(SkeinError::Handler(format!(
                "human input channel for node '{}' closed",
                node_id
            ))),
            Err(_) => Err(SkeinError::HumanInputTimeout { node_id, timeout_ms }),
        }
    }

    /// Deliver input to the oldest waiter for `node_id`.
    /// Returns true if a waiting node received it.
    pub fn submit(&self, node_id: &str, input: Value, user_id: &str) -> bool {
        let mut response = HumanInputResponse {
            node_id: node_id.to_string(),
            input,
            user_id: user_id.to_string(),
            timestamp: Utc::now(),
        };

        loop {
            let waiter = {
                let mut pending = self.lock();
                let Some(queue) = pending.get_mut(node_id) else {
                    break;
                };
                let waiter = queue.pop_front();
                if queue.is_empty() {
                    pending.remove(node_id);
                }
                waiter
            };
            let Some(waiter) = waiter else {
                break;
            };
            match waiter.tx.send(response) {
                Ok(()) => {
                    debug!(node_id, request_id = %waiter.request.id, "Human input delivered");
                    self.event_bus.publish(WorkflowEvent::HumanInputSubmitted {
                        node_id: node_id.to_string(),
                        user_id: user_id.to_string(),
                    });
                    return true;
                }
                // Receiver already gone, try the next waiter
                Err(returned) => response = returned,
            }
        }

        debug!(node_id, "No waiting node for human input");
        false
    }

    /// All outstanding requests.
    pub fn pending_requests(&self) -> Vec<HumanInputRequest> {
        self.lock()
            .values()
            .flat_map(|queue| queue.iter().map(|w| w.request.clone()))
            .collect()
    }

    fn remove(&self, node_id: &str, request_id: &str) {
        let mut pending = self.lock();
        if let Some(queue) = pending.get_mut(node_id) {
            queue.retain(|w| w.request.id != request_id);
            if queue.is_empty() {
                pending.remove(node_id);
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, VecDeque<Waiter>>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(id: &str, node: &str, timeout_ms: u64) -> HumanInputRequest {
        HumanInputRequest {
            id: id.to_string(),
            execution_id: "exec-1".to_string(),
            node_id: node.to_string(),
            prompt: "Approve?".to_string(),
            options: vec![json!("yes"), json!("no")],
            timeout_ms,
            requested_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn submit_resolves_waiter() {
        let bus = Arc::new(EventBus::default());
        let gateway = Arc::new(HumanInputGateway::new(bus.clone()));
        let mut events = bus.subscribe();

        let waiting = {
            let gateway = gateway.clone();
            tokio::spawn(async move { gateway.wait(request("r1", "approve", 5_000), &WorkflowState::new()).await })
        };

        let required = events.recv().await.unwrap();
        assert_eq!(required.event.name(), "human:input:required");
        assert!(gateway.submit("approve", json!("yes"), "alice"));

        let response = waiting.await.unwrap().unwrap();
        assert_eq!(response.input, json!("yes"));
        assert_eq!(response.user_id, "alice");
        assert!(gateway.pending_requests().is_empty());
    }

    #[tokio::test]
    async fn timeout_removes_waiter() {
        let gateway = HumanInputGateway::new(Arc::new(EventBus::default()));
        let result = gateway.wait(request("r2", "approve", 10), &WorkflowState::new()).await;
        assert!(matches!(result, Err(SkeinError::HumanInputTimeout { .. })));

        // Late input finds nobody
        assert!(!gateway.submit("approve", json!("yes"), "alice"));
        assert!(gateway.pending_requests().is_empty());
    }

    #[tokio::test]
    async fn unknown_node() {
        let gateway = HumanInputGateway::new(Arc::new(EventBus::default()));
        assert!(!gateway.submit("nobody", json!(1), "bob"));
    }

    #[tokio::test]
    async fn dropped_wait_is_unregistered() {
        let gateway = HumanInputGateway::new(Arc::new(EventBus::default()));
        let state = WorkflowState::new();
        let fut = gateway.wait(request("r3", "approve", 5_000), &state);
        // Poll once so the waiter registers, then drop it
        let _ = tokio::time::timeout(Duration::from_millis(5), fut).await;
        assert!(gateway.pending_requests().is_empty());
        assert!(!gateway.submit("approve", json!("late"), "carol"));
    }
}
