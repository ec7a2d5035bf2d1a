mod loopback;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use serde_json::Value;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use skein_core::config::AppConfig;
use skein_core::definition::WorkflowDefinition;
use skein_core::event::WorkflowEvent;
use skein_core::execution::{ExecutionConfig, ExecutionStatus};
use skein_core::types::display_value;
use skein_engine::WorkflowEngine;

use loopback::{LoopbackAgents, LoopbackModel, LoopbackTools};

#[derive(Parser)]
#[command(name = "skein", version, about = "Multi-agent workflow engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "skein.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a workflow definition and report every problem
    Validate {
        /// Definition file (.json or .toml)
        file: PathBuf,
    },
    /// Print a workflow's vertices and transitions
    Graph {
        /// Definition file (.json or .toml)
        file: PathBuf,
    },
    /// Execute a workflow against loopback collaborators
    Run {
        /// Definition file (.json or .toml)
        file: PathBuf,
        /// Initial state as a JSON object
        #[arg(long, default_value = "{}")]
        input: String,
        /// Execution timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "skein", &mut std::io::stdout());
        return Ok(());
    }

    let config = AppConfig::load_or_default(&cli.config)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log.filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let engine = WorkflowEngine::builder()
        .with_config(config.engine.clone())
        .with_agent_messenger(Arc::new(LoopbackAgents))
        .with_tool_executor(Arc::new(LoopbackTools))
        .with_completion_client(Arc::new(LoopbackModel))
        .build();

    match cli.command {
        Commands::Validate { file } => {
            let definition = load_definition(&file)?;
            let name = definition.name.clone();
            let compiled = engine.compile(definition)?;
            println!("{}: ok ({} nodes)", name, compiled.node_count());
        }
        Commands::Graph { file } => {
            let definition = load_definition(&file)?;
            let compiled = engine.compile(definition)?;
            println!("{} (entry: {})", compiled.name, compiled.entry_point);
            for (vertex, next, routes) in compiled.adjacency() {
                let kind = compiled
                    .node(&vertex)
                    .map(|n| n.node_type.to_string())
                    .unwrap_or_else(|| "parallel".to_string());
                match (next, routes.is_empty()) {
                    (_, false) => println!("  {} [{}] -> {{{}}}", vertex, kind, routes.join(", ")),
                    (Some(next), true) => println!("  {} [{}] -> {}", vertex, kind, next),
                    (None, true) => println!("  {} [{}] (end)", vertex, kind),
                }
            }
        }
        Commands::Run {
            file,
            input,
            timeout_ms,
        } => run(&engine, &file, &input, timeout_ms).await?,
        Commands::Completions { .. } => {}
    }

    Ok(())
}

/// Parse a definition file by extension: `.toml`, otherwise JSON.
fn load_definition(path: &Path) -> anyhow::Result<WorkflowDefinition> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let definition = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?,
        _ => serde_json::from_str(&content).with_context(|| format!("parsing {}", path.display()))?,
    };
    Ok(definition)
}

async fn run(engine: &WorkflowEngine, file: &Path, input: &str, timeout_ms: Option<u64>) -> anyhow::Result<()> {
    let definition = load_definition(file)?;
    let input: Value = serde_json::from_str(input).context("--input must be JSON")?;
    let Value::Object(input) = input else {
        anyhow::bail!("--input must be a JSON object");
    };

    let workflow_id = engine.create_workflow(definition).await?;
    let mut events = engine.subscribe();
    let (execution_id, handle) = engine
        .start_workflow(&workflow_id, input, ExecutionConfig { timeout_ms })
        .await?;
    info!(execution_id = %execution_id, "Started");

    let prompter = engine.clone();
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event.event {
                WorkflowEvent::NodeExecuted {
                    node_id,
                    node_type,
                    duration_ms,
                    success,
                    ..
                } => {
                    let mark = if success { "ok" } else { "FAILED" };
                    eprintln!("[{}: {} {}] {}ms", node_id, node_type, mark, duration_ms);
                }
                WorkflowEvent::HumanInputRequired {
                    node_id,
                    prompt,
                    options,
                    ..
                } => {
                    let engine = prompter.clone();
                    tokio::task::spawn_blocking(move || {
                        let answer = ask_human(&prompt, &options);
                        if !engine.submit_human_input(&node_id, answer, "cli") {
                            warn!(node_id = %node_id, "Input arrived after the node stopped waiting");
                        }
                    });
                }
                WorkflowEvent::Completed { .. }
                | WorkflowEvent::Failed { .. }
                | WorkflowEvent::Cancelled { .. } => break,
                _ => {}
            }
        }
    });

    let execution = handle.await.context("execution task panicked")?;
    printer.abort();

    println!("{}", serde_json::to_string_pretty(&execution.state)?);
    eprintln!(
        "[{}: {} nodes, {} retries, {}ms]",
        execution.status,
        execution.metrics.nodes_executed,
        execution.metrics.retry_count,
        execution.metrics.execution_time_ms
    );
    if execution.status != ExecutionStatus::Completed {
        let reason = execution
            .error
            .map(|e| e.message)
            .unwrap_or_else(|| execution.status.to_string());
        anyhow::bail!("workflow did not complete: {}", reason);
    }
    Ok(())
}

/// Prompt on the terminal. With options the user picks one; otherwise free
/// text, parsed as JSON when it is valid JSON.
fn ask_human(prompt: &str, options: &[Value]) -> Value {
    if !options.is_empty() {
        let labels: Vec<String> = options.iter().map(display_value).collect();
        let picked = dialoguer::Select::new()
            .with_prompt(prompt)
            .items(&labels)
            .default(0)
            .interact()
            .unwrap_or(0);
        return options[picked].clone();
    }
    let text: String = dialoguer::Input::new()
        .with_prompt(prompt)
        .allow_empty(true)
        .interact_text()
        .unwrap_or_default();
    serde_json::from_str(&text).unwrap_or(Value::String(text))
}
