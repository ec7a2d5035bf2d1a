use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Result, SkeinError};

/// Top-level Skein configuration (`skein.toml`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Broadcast buffer for the event bus.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    /// Execution timeout applied when neither the call nor the definition sets one (0 = none).
    #[serde(default)]
    pub default_timeout_secs: u64,
    /// How often one vertex may run within a single execution run.
    #[serde(default = "default_max_node_visits")]
    pub max_node_visits: usize,
    /// Wait applied to human nodes that set no timeout of their own.
    #[serde(default = "default_human_input_timeout")]
    pub human_input_timeout_secs: u64,
    /// Parallel-group concurrency when the definition sets no limit.
    #[serde(default = "default_parallel_limit")]
    pub default_parallel_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            event_capacity: default_event_capacity(),
            default_timeout_secs: 0,
            max_node_visits: default_max_node_visits(),
            human_input_timeout_secs: default_human_input_timeout(),
            default_parallel_limit: default_parallel_limit(),
        }
    }
}

impl EngineConfig {
    pub fn default_timeout(&self) -> Option<Duration> {
        (self.default_timeout_secs > 0).then(|| Duration::from_secs(self.default_timeout_secs))
    }

    pub fn human_input_timeout(&self) -> Duration {
        Duration::from_secs(self.human_input_timeout_secs)
    }
}

fn default_event_capacity() -> usize { 1024 }
fn default_max_node_visits() -> usize { 25 }
fn default_human_input_timeout() -> u64 { 300 }
fn default_parallel_limit() -> usize { 8 }

/// Logging configuration for the binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

fn default_log_filter() -> String { "skein=info,warn".to_string() }

impl AppConfig {
    /// Load config from a TOML file, expanding `${ENV_VAR}` references.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| SkeinError::ConfigNotFound(path.display().to_string()))?;

        let (expanded, unset) = expand_env_vars(&content);
        for name in &unset {
            warn!(var = %name, path = %path.display(), "Config references an unset environment variable");
        }

        toml::from_str(&expanded).map_err(|e| SkeinError::Config(e.to_string()))
    }

    /// Like [`AppConfig::load`], but a missing file yields the defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        match Self::load(path) {
            Err(SkeinError::ConfigNotFound(_)) => Ok(Self::default()),
            other => other,
        }
    }
}

/// Substitute `${NAME}` references from the environment.
///
/// Unset names stay verbatim and are returned alongside the text. An
/// unterminated `${` is copied as-is.
fn expand_env_vars(input: &str) -> (String, Vec<String>) {
    let mut expanded = String::with_capacity(input.len());
    let mut unset = Vec::new();
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        expanded.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            expanded.push_str(&rest[start..]);
            return (expanded, unset);
        };
        let name = &after[..end];
        match std::env::var(name) {
            Ok(value) => expanded.push_str(&value),
            Err(_) => {
                expanded.push_str(&rest[start..start + 3 + end]);
                unset.push(name.to_string());
            }
        }
        rest = &after[end + 1..];
    }
    expanded.push_str(rest);
    (expanded, unset)
}
