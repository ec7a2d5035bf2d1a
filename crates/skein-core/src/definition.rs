use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::error::Result;
use crate::state::{StateSchema, StateUpdate, WorkflowState};

/// The kind of collaborator a node invokes.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Agent,
    Tool,
    Llm,
    Human,
    Custom,
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Agent => "agent",
            Self::Tool => "tool",
            Self::Llm => "llm",
            Self::Human => "human",
            Self::Custom => "custom",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    Linear,
    Exponential,
}

/// Per-node retry configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total invocations, first attempt included. Must be at least 1.
    pub max_attempts: u32,
    #[serde(default = "default_backoff")]
    pub backoff: BackoffStrategy,
    #[serde(default)]
    pub initial_delay_ms: u64,
    #[serde(default)]
    pub max_delay_ms: Option<u64>,
}

fn default_backoff() -> BackoffStrategy {
    BackoffStrategy::Exponential
}

impl RetryPolicy {
    pub fn linear(max_attempts: u32, initial_delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff: BackoffStrategy::Linear,
            initial_delay_ms: initial_delay.as_millis() as u64,
            max_delay_ms: None,
        }
    }

    pub fn exponential(max_attempts: u32, initial_delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff: BackoffStrategy::Exponential,
            initial_delay_ms: initial_delay.as_millis() as u64,
            max_delay_ms: None,
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay_ms = Some(max_delay.as_millis() as u64);
        self
    }

    /// Delay before retry number `retry` (1-based: the wait after the first failure is retry 1).
    pub fn delay_for(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let ms = match self.backoff {
            BackoffStrategy::Linear => self.initial_delay_ms.saturating_mul(retry as u64),
            BackoffStrategy::Exponential => {
                let factor = 2u64.checked_pow(retry - 1).unwrap_or(u64::MAX);
                self.initial_delay_ms.saturating_mul(factor)
            }
        };
        let capped = match self.max_delay_ms {
            Some(max) => ms.min(max),
            None => ms,
        };
        Duration::from_millis(capped)
    }
}

/// Pure transform attached to a custom node.
#[derive(Clone)]
pub struct TransformFn(pub Arc<dyn Fn(&WorkflowState) -> Result<StateUpdate> + Send + Sync>);

impl TransformFn {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&WorkflowState) -> Result<StateUpdate> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub fn call(&self, state: &WorkflowState) -> Result<StateUpdate> {
        (self.0)(state)
    }
}

impl std::fmt::Debug for TransformFn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TransformFn(..)")
    }
}

/// One unit of work in a workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
    /// Cap on each handler attempt.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Handler-specific parameters (agent id, tool name, prompt, ...).
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,
    #[serde(skip)]
    pub transform: Option<TransformFn>,
}

impl Node {
    pub fn new(id: impl Into<String>, node_type: NodeType) -> Self {
        Self {
            id: id.into(),
            node_type,
            retry_policy: None,
            timeout_ms: None,
            metadata: serde_json::Map::new(),
            transform: None,
        }
    }

    /// A custom node running `f` over the current state.
    pub fn custom<F>(id: impl Into<String>, f: F) -> Self
    where
        F: Fn(&WorkflowState) -> Result<StateUpdate> + Send + Sync + 'static,
    {
        let mut node = Self::new(id, NodeType::Custom);
        node.transform = Some(TransformFn::new(f));
        node
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }

    pub fn meta_bool(&self, key: &str) -> bool {
        self.metadata.get(key).and_then(|v| v.as_bool()).unwrap_or(false)
    }

    pub fn meta_u64(&self, key: &str) -> Option<u64> {
        self.metadata.get(key).and_then(|v| v.as_u64())
    }

    /// Key under which handlers store this node's primary output.
    pub fn result_key(&self) -> String {
        format!("{}_result", self.id)
    }
}

/// A static, unconditional transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub from: String,
    pub to: String,
}

impl Edge {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}

/// Predicate closure evaluated against post-merge state.
pub type PredicateFn = Arc<dyn Fn(&WorkflowState) -> bool + Send + Sync>;

/// A routing predicate: either a closure or a textual expression such as
/// `score >= 70` or `status == "approved"`.
#[derive(Clone)]
pub enum Predicate {
    Expr(String),
    Func(PredicateFn),
}

impl std::fmt::Debug for Predicate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Expr(expr) => write!(f, "Expr({:?})", expr),
            Self::Func(_) => f.write_str("Func(..)"),
        }
    }
}

impl Serialize for Predicate {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Self::Expr(expr) => serializer.serialize_str(expr),
            Self::Func(_) => serializer.serialize_str("<fn>"),
        }
    }
}

impl<'de> Deserialize<'de> for Predicate {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        String::deserialize(deserializer).map(Self::Expr)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    #[serde(rename = "when")]
    pub predicate: Predicate,
    pub target: String,
}

/// Ordered predicate → target rules for one source node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionalRoute {
    pub source: String,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    pub default: String,
}

impl ConditionalRoute {
    pub fn new(source: impl Into<String>, default: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            conditions: Vec::new(),
            default: default.into(),
        }
    }

    /// Add a closure condition.
    pub fn when<F>(mut self, target: impl Into<String>, f: F) -> Self
    where
        F: Fn(&WorkflowState) -> bool + Send + Sync + 'static,
    {
        self.conditions.push(Condition {
            predicate: Predicate::Func(Arc::new(f)),
            target: target.into(),
        });
        self
    }

    /// Add an expression condition.
    pub fn when_expr(mut self, target: impl Into<String>, expr: impl Into<String>) -> Self {
        self.conditions.push(Condition {
            predicate: Predicate::Expr(expr.into()),
            target: target.into(),
        });
        self
    }

    /// Every node id this route may select.
    pub fn targets(&self) -> impl Iterator<Item = &str> {
        self.conditions
            .iter()
            .map(|c| c.target.as_str())
            .chain(std::iter::once(self.default.as_str()))
    }
}

/// A fixed batch of nodes fanned out concurrently and joined before merging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelGroup {
    pub id: String,
    pub nodes: Vec<String>,
}

impl ParallelGroup {
    pub fn new(id: impl Into<String>, nodes: Vec<String>) -> Self {
        Self {
            id: id.into(),
            nodes,
        }
    }
}

/// Workflow-wide execution settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowConfig {
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Retries given to nodes without their own policy (0 = none).
    #[serde(default)]
    pub max_retries: u32,
    /// Record a checkpoint after every N completed steps (0 = off).
    #[serde(default)]
    pub checkpoint_interval: u32,
    /// Maximum concurrently running members of a parallel group.
    #[serde(default)]
    pub parallel_limit: Option<usize>,
}

/// A declarative workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Generated at compile time when absent.
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub state_schema: StateSchema,
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    pub entry_point: String,
    #[serde(default)]
    pub conditional_routing: Vec<ConditionalRoute>,
    #[serde(default)]
    pub parallel_groups: Vec<ParallelGroup>,
    #[serde(default)]
    pub config: WorkflowConfig,
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>, entry_point: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            state_schema: StateSchema::new(),
            nodes: Vec::new(),
            edges: Vec::new(),
            entry_point: entry_point.into(),
            conditional_routing: Vec::new(),
            parallel_groups: Vec::new(),
            config: WorkflowConfig::default(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn channel(mut self, name: impl Into<String>, spec: crate::state::ChannelSpec) -> Self {
        self.state_schema.insert(name.into(), spec);
        self
    }

    pub fn node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn edge(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.edges.push(Edge::new(from, to));
        self
    }

    pub fn route(mut self, route: ConditionalRoute) -> Self {
        self.conditional_routing.push(route);
        self
    }

    pub fn parallel(mut self, group: ParallelGroup) -> Self {
        self.parallel_groups.push(group);
        self
    }

    pub fn with_config(mut self, config: WorkflowConfig) -> Self {
        self.config = config;
        self
    }
}
