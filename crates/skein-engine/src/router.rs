use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;
use tracing::debug;

use skein_core::definition::{ConditionalRoute, Predicate, PredicateFn};
use skein_core::state::WorkflowState;

/// Comparison operators supported in route expressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Contains,
}

/// A parsed `path OP literal` expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub path: String,
    pub op: Op,
    pub literal: Value,
}

fn expr_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*([A-Za-z_][\w.]*)\s*(==|!=|>=|<=|>|<|\bcontains\b)\s*(.+?)\s*$")
            .expect("route expression regex is valid")
    })
}

impl Expr {
    /// Parse expressions like `score >= 70`, `status == "approved"` or
    /// `output contains "error"`. Returns `None` when unparseable.
    pub fn parse(expr: &str) -> Option<Self> {
        let caps = expr_regex().captures(expr)?;
        let op = match &caps[2] {
            "==" => Op::Eq,
            "!=" => Op::Ne,
            ">=" => Op::Ge,
            "<=" => Op::Le,
            ">" => Op::Gt,
            "<" => Op::Lt,
            _ => Op::Contains,
        };
        let raw = caps[3].trim();
        // Bare words are treated as strings
        let literal = serde_json::from_str(raw)
            .unwrap_or_else(|_| Value::String(raw.trim_matches('"').to_string()));
        Some(Self {
            path: caps[1].to_string(),
            op,
            literal,
        })
    }

    /// Evaluate against state. Missing paths and non-numeric operands of
    /// ordering comparisons evaluate to `false`.
    pub fn evaluate(&self, state: &WorkflowState) -> bool {
        let Some(left) = state.get_path(&self.path) else {
            return false;
        };
        match self.op {
            Op::Eq => values_equal(left, &self.literal),
            Op::Ne => !values_equal(left, &self.literal),
            Op::Contains => match (left, &self.literal) {
                (Value::String(s), Value::String(needle)) => s.contains(needle.as_str()),
                (Value::Array(items), needle) => items.iter().any(|v| values_equal(v, needle)),
                _ => false,
            },
            Op::Gt | Op::Ge | Op::Lt | Op::Le => {
                let (Some(l), Some(r)) = (left.as_f64(), self.literal.as_f64()) else {
                    return false;
                };
                match self.op {
                    Op::Gt => l > r,
                    Op::Ge => l >= r,
                    Op::Lt => l < r,
                    _ => l <= r,
                }
            }
        }
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

/// Evaluate a textual route expression against state.
///
/// Returns `false` for unparseable expressions.
pub fn evaluate_condition(expr: &str, state: &WorkflowState) -> bool {
    Expr::parse(expr).is_some_and(|e| e.evaluate(state))
}

#[derive(Clone)]
enum CompiledPredicate {
    Expr(Expr),
    Func(PredicateFn),
}

impl CompiledPredicate {
    fn matches(&self, state: &WorkflowState) -> bool {
        match self {
            Self::Expr(expr) => expr.evaluate(state),
            Self::Func(f) => f(state),
        }
    }
}

#[derive(Clone)]
struct CompiledRoute {
    conditions: Vec<(CompiledPredicate, String)>,
    default: String,
}

/// Resolves the next vertex after a node that owns a conditional route.
#[derive(Clone, Default)]
pub struct ConditionalRouter {
    routes: HashMap<String, CompiledRoute>,
}

impl ConditionalRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a route. Fails with the offending expression if one does not parse.
    pub fn add(&mut self, route: &ConditionalRoute) -> Result<(), String> {
        let mut conditions = Vec::with_capacity(route.conditions.len());
        for cond in &route.conditions {
            let compiled = match &cond.predicate {
                Predicate::Expr(text) => {
                    CompiledPredicate::Expr(Expr::parse(text).ok_or_else(|| text.clone())?)
                }
                Predicate::Func(f) => CompiledPredicate::Func(f.clone()),
            };
            conditions.push((compiled, cond.target.clone()));
        }
        self.routes.insert(
            route.source.clone(),
            CompiledRoute {
                conditions,
                default: route.default.clone(),
            },
        );
        Ok(())
    }

    /// First matching condition's target, else the route default.
    /// `None` when `source` has no registered route.
    pub fn resolve(&self, source: &str, state: &WorkflowState) -> Option<&str> {
        let route = self.routes.get(source)?;
        for (predicate, target) in &route.conditions {
            if predicate.matches(state) {
                debug!(source, target = %target, "Route condition matched");
                return Some(target);
            }
        }
        debug!(source, target = %route.default, "No route condition matched, using default");
        Some(&route.default)
    }
}
