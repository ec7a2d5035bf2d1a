use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use skein_core::definition::{
    Node, NodeType, ParallelGroup, RetryPolicy, WorkflowConfig, WorkflowDefinition,
};
use skein_core::error::{Result, SkeinError};
use skein_core::execution::WorkflowSummary;
use skein_core::state::{StateSchema, WorkflowState};

use crate::handlers::HandlerRegistry;
use crate::router::ConditionalRouter;

/// Initial backoff for policies derived from `config.max_retries`.
const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(100);
const DEFAULT_RETRY_MAX_DELAY: Duration = Duration::from_secs(10);

/// A step the lifecycle manager can visit: a single node or a parallel group.
#[derive(Debug, Clone, Copy)]
pub enum Vertex<'a> {
    Node(&'a Node),
    Group(&'a ParallelGroup),
}

/// A validated workflow ready for execution.
#[derive(Clone)]
pub struct CompiledWorkflow {
    pub id: String,
    pub name: String,
    pub entry_point: String,
    pub schema: StateSchema,
    pub config: WorkflowConfig,
    pub created_at: DateTime<Utc>,
    nodes: HashMap<String, Node>,
    /// Declaration order, for listing.
    node_order: Vec<String>,
    groups: HashMap<String, ParallelGroup>,
    successors: HashMap<String, String>,
    router: ConditionalRouter,
    definition: WorkflowDefinition,
}

impl CompiledWorkflow {
    pub fn vertex(&self, id: &str) -> Option<Vertex<'_>> {
        if let Some(group) = self.groups.get(id) {
            return Some(Vertex::Group(group));
        }
        self.nodes.get(id).map(Vertex::Node)
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    /// Next vertex after `from`, given post-merge state. A conditional route
    /// takes precedence over a static edge; `None` ends the execution.
    pub fn next(&self, from: &str, state: &WorkflowState) -> Option<String> {
        if let Some(target) = self.router.resolve(from, state) {
            return Some(target.to_string());
        }
        self.successors.get(from).cloned()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn summary(&self) -> WorkflowSummary {
        WorkflowSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            node_count: self.nodes.len(),
            entry_point: self.entry_point.clone(),
            created_at: self.created_at,
        }
    }

    /// The definition this workflow was compiled from, with the assigned id.
    pub fn definition(&self) -> &WorkflowDefinition {
        &self.definition
    }

    /// Outgoing transitions per vertex in declaration order:
    /// `(vertex, static successor, route targets)`.
    pub fn adjacency(&self) -> Vec<(String, Option<String>, Vec<String>)> {
        let route_targets: HashMap<&str, Vec<String>> = self
            .definition
            .conditional_routing
            .iter()
            .map(|r| (r.source.as_str(), r.targets().map(String::from).collect()))
            .collect();
        self.node_order
            .iter()
            .chain(self.definition.parallel_groups.iter().map(|g| &g.id))
            .map(|id| {
                (
                    id.clone(),
                    self.successors.get(id).cloned(),
                    route_targets.get(id.as_str()).cloned().unwrap_or_default(),
                )
            })
            .collect()
    }
}

/// Validates workflow definitions and compiles them into [`CompiledWorkflow`]s.
pub struct GraphCompiler<'a> {
    handlers: &'a HandlerRegistry,
}

impl<'a> GraphCompiler<'a> {
    pub fn new(handlers: &'a HandlerRegistry) -> Self {
        Self { handlers }
    }

    fn registered_types(&self) -> String {
        let mut names: Vec<String> = self.handlers.node_types().iter().map(|t| t.to_string()).collect();
        names.sort();
        names.join(", ")
    }

    /// Validate `definition`, collecting every violation before failing.
    pub fn compile(&self, definition: WorkflowDefinition) -> Result<CompiledWorkflow> {
        let mut violations = Vec::new();
        let mut router = ConditionalRouter::new();
        let mut successors: HashMap<String, String> = HashMap::new();

        if definition.nodes.is_empty() {
            violations.push("workflow has no nodes".to_string());
        }

        let mut node_ids = HashSet::new();
        for node in &definition.nodes {
            if !node_ids.insert(node.id.as_str()) {
                violations.push(format!("duplicate node id '{}'", node.id));
            }
            if !self.handlers.contains(node.node_type) {
                violations.push(format!(
                    "node '{}' has type '{}' with no registered handler (registered: {})",
                    node.id,
                    node.node_type,
                    self.registered_types()
                ));
            }
            if node.retry_policy.as_ref().is_some_and(|p| p.max_attempts == 0) {
                violations.push(format!("node '{}' retry policy needs max_attempts >= 1", node.id));
            }
            if node.node_type == NodeType::Custom
                && node.transform.is_none()
                && !matches!(node.metadata.get("assign"), Some(Value::Object(_)))
            {
                violations.push(format!("custom node '{}' has no transform", node.id));
            }
        }

        let mut group_ids = HashSet::new();
        for group in &definition.parallel_groups {
            if node_ids.contains(group.id.as_str()) {
                violations.push(format!("parallel group '{}' collides with a node id", group.id));
            }
            if !group_ids.insert(group.id.as_str()) {
                violations.push(format!("duplicate parallel group '{}'", group.id));
            }
            if group.nodes.is_empty() {
                violations.push(format!("parallel group '{}' has no members", group.id));
            }
            for member in &group.nodes {
                if !node_ids.contains(member.as_str()) {
                    violations.push(format!(
                        "parallel group '{}' references unknown node '{}'",
                        group.id, member
                    ));
                }
            }
        }

        let is_vertex = |id: &str| node_ids.contains(id) || group_ids.contains(id);

        if !is_vertex(&definition.entry_point) {
            violations.push(format!("entry point '{}' is not a node", definition.entry_point));
        }

        for edge in &definition.edges {
            if !is_vertex(&edge.from) {
                violations.push(format!("edge source '{}' does not exist", edge.from));
            }
            if !is_vertex(&edge.to) {
                violations.push(format!("edge target '{}' does not exist", edge.to));
            }
            if let Some(existing) = successors.get(&edge.from) {
                violations.push(format!(
                    "node '{}' has multiple static edges ('{}', '{}'); use a conditional route",
                    edge.from, existing, edge.to
                ));
            } else {
                successors.insert(edge.from.clone(), edge.to.clone());
            }
        }

        let mut route_sources = HashSet::new();
        for route in &definition.conditional_routing {
            if !route_sources.insert(route.source.as_str()) {
                violations.push(format!("node '{}' has more than one conditional route", route.source));
            }
            if !is_vertex(&route.source) {
                violations.push(format!("route source '{}' does not exist", route.source));
            }
            for target in route.targets() {
                if !is_vertex(target) {
                    violations.push(format!(
                        "route from '{}' targets unknown node '{}'",
                        route.source, target
                    ));
                }
            }
            if let Err(expr) = router.add(route) {
                violations.push(format!(
                    "route from '{}' has invalid condition '{}'",
                    route.source, expr
                ));
            }
            if successors.contains_key(&route.source) {
                debug!(source = %route.source, "Conditional route overrides static edge");
            }
        }

        if !violations.is_empty() {
            return Err(SkeinError::Validation { violations });
        }

        let mut definition = definition;
        let id = definition
            .id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        definition.id = Some(id.clone());

        let max_retries = definition.config.max_retries;
        let node_order: Vec<String> = definition.nodes.iter().map(|n| n.id.clone()).collect();
        let nodes = definition
            .nodes
            .iter()
            .cloned()
            .map(|mut node| {
                // Human nodes keep a single wait; a repeated prompt would
                // accept input after the timeout.
                if node.retry_policy.is_none() && max_retries > 0 && node.node_type != NodeType::Human {
                    node.retry_policy = Some(
                        RetryPolicy::exponential(max_retries.saturating_add(1), DEFAULT_RETRY_DELAY)
                            .with_max_delay(DEFAULT_RETRY_MAX_DELAY),
                    );
                }
                (node.id.clone(), node)
            })
            .collect();
        let groups = definition
            .parallel_groups
            .iter()
            .map(|g| (g.id.clone(), g.clone()))
            .collect();

        Ok(CompiledWorkflow {
            id,
            name: definition.name.clone(),
            entry_point: definition.entry_point.clone(),
            schema: definition.state_schema.clone(),
            config: definition.config.clone(),
            created_at: Utc::now(),
            nodes,
            node_order,
            groups,
            successors,
            router,
            definition,
        })
    }
}
