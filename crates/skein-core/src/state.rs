use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

/// Partial state returned by a node handler.
pub type StateUpdate = Map<String, Value>;

/// Channel holding the conversation history.
pub const MESSAGES_CHANNEL: &str = "messages";
/// Channel mapping correlation ids to agent requests still awaiting a reply.
pub const PENDING_AGENT_MESSAGES_CHANNEL: &str = "pending_agent_messages";

/// User-supplied reducer: `(prior, update) -> merged`.
pub type ReducerFn = Arc<dyn Fn(Option<&Value>, &Value) -> Value + Send + Sync>;

/// How an update to a channel combines with its prior value.
#[derive(Clone, Default)]
pub enum MergeRule {
    /// Replace the prior value when the update defines one.
    #[default]
    Overwrite,
    /// Concatenate arrays (a non-array update is pushed as one element).
    Append,
    /// Shallow object merge, update keys win.
    Merge,
    /// Numeric addition.
    Sum,
    /// Caller-supplied reducer.
    Custom(ReducerFn),
}

impl MergeRule {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Overwrite => "overwrite",
            Self::Append => "append",
            Self::Merge => "merge",
            Self::Sum => "sum",
            Self::Custom(_) => "custom",
        }
    }

    /// Combine `update` into `prior`. `None` means the channel keeps its prior value.
    pub fn apply(&self, prior: Option<&Value>, update: &Value) -> Option<Value> {
        if update.is_null() {
            return None;
        }
        match self {
            Self::Overwrite => Some(update.clone()),
            Self::Append => {
                let mut items = match prior {
                    Some(Value::Array(items)) => items.clone(),
                    Some(Value::Null) | None => Vec::new(),
                    Some(other) => vec![other.clone()],
                };
                match update {
                    Value::Array(new_items) => items.extend(new_items.iter().cloned()),
                    other => items.push(other.clone()),
                }
                Some(Value::Array(items))
            }
            Self::Merge => match (prior, update) {
                (Some(Value::Object(base)), Value::Object(patch)) => {
                    let mut merged = base.clone();
                    for (k, v) in patch {
                        merged.insert(k.clone(), v.clone());
                    }
                    Some(Value::Object(merged))
                }
                _ => Some(update.clone()),
            },
            Self::Sum => {
                let base = prior.and_then(Value::as_f64).unwrap_or(0.0);
                match update.as_f64() {
                    Some(delta) => Some(number(base + delta)),
                    None => Some(update.clone()),
                }
            }
            Self::Custom(reducer) => Some(reducer(prior, update)),
        }
    }
}

/// Keep integral sums as integers so `1 + 1` stays `2` rather than `2.0`.
fn number(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
    }
}

impl std::fmt::Debug for MergeRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl Serialize for MergeRule {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

impl<'de> Deserialize<'de> for MergeRule {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        match name.as_str() {
            "overwrite" => Ok(Self::Overwrite),
            "append" => Ok(Self::Append),
            "merge" => Ok(Self::Merge),
            "sum" => Ok(Self::Sum),
            other => Err(serde::de::Error::custom(format!(
                "unknown merge rule '{}' (expected overwrite, append, merge or sum)",
                other
            ))),
        }
    }
}

/// Declaration of one state channel.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelSpec {
    #[serde(default)]
    pub default: Value,
    #[serde(default)]
    pub merge: MergeRule,
}

impl ChannelSpec {
    pub fn new(default: Value) -> Self {
        Self {
            default,
            merge: MergeRule::Overwrite,
        }
    }

    pub fn with_merge(mut self, merge: MergeRule) -> Self {
        self.merge = merge;
        self
    }
}

/// Channel declarations for a workflow.
pub type StateSchema = HashMap<String, ChannelSpec>;

/// The mutable record threaded through an execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowState {
    data: Map<String, Value>,
}

impl WorkflowState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(data: Map<String, Value>) -> Self {
        Self { data }
    }

    /// Build the initial state: channel defaults, then caller input on top.
    pub fn initial(schema: &StateSchema, input: &Map<String, Value>) -> Self {
        let mut data = Map::new();
        for (name, spec) in schema {
            if !spec.default.is_null() {
                data.insert(name.clone(), spec.default.clone());
            }
        }
        for (k, v) in input {
            data.insert(k.clone(), v.clone());
        }
        Self { data }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(|v| v.as_str())
    }

    /// Look up a dotted path such as `order.customer.id`. Array segments
    /// may be numeric indices.
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let mut current = self.data.get(parts.next()?)?;
        for part in parts {
            current = match current {
                Value::Object(obj) => obj.get(part)?,
                Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.data.insert(key.into(), value);
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.data.remove(key)
    }

    /// Apply a partial update using each channel's merge rule.
    ///
    /// Undeclared keys overwrite, except the built-in `messages` (append)
    /// and `pending_agent_messages` (merge) channels.
    pub fn merge(&mut self, update: &StateUpdate, schema: &StateSchema) {
        for (key, value) in update {
            let merged = match schema.get(key) {
                Some(spec) => spec.merge.apply(self.data.get(key), value),
                None => builtin_rule(key).apply(self.data.get(key), value),
            };
            if let Some(merged) = merged {
                self.data.insert(key.clone(), merged);
            }
        }
    }

    pub fn data(&self) -> &Map<String, Value> {
        &self.data
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

fn builtin_rule(key: &str) -> MergeRule {
    match key {
        MESSAGES_CHANNEL => MergeRule::Append,
        PENDING_AGENT_MESSAGES_CHANNEL => MergeRule::Merge,
        _ => MergeRule::Overwrite,
    }
}
