use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use futures::future::BoxFuture;
use serde_json::{Map, Value};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use weave_agent::{
    AgentRegistry, BpeEstimator, CharEstimator, ContextWindowManager, RunOptions, TokenEstimator,
    WorkflowEngine, WorkflowNode,
};
use weave_core::config::EngineConfig;
use weave_core::error::AgentError;
use weave_core::traits::Agent;
use weave_core::types::{AgentOutput, AgentTask};

#[derive(Parser)]
#[command(name = "weave", version, about = "Multi-agent workflow orchestration")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "weave.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a workflow file and print its structure
    Validate {
        /// Workflow definition (.toml or .json)
        file: PathBuf,
    },
    /// Run a workflow with echo agents standing in for every referenced agent
    DryRun {
        file: PathBuf,
        /// Initial context entries as key=value
        #[arg(short, long = "set", value_parser = parse_key_value)]
        set: Vec<(String, String)>,
    },
    /// Estimate the token cost of a file
    Estimate {
        file: PathBuf,
        /// Use the cl100k BPE tokenizer instead of the character ratio
        #[arg(long)]
        bpe: bool,
    },
    /// Split a document into budget-sized chunks
    Chunk {
        file: PathBuf,
        /// Maximum cost per chunk
        #[arg(long)]
        budget: usize,
    },
    /// Show current configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("weave=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let config = if cli.config.exists() {
        EngineConfig::load(&cli.config)?
    } else {
        info!(path = %cli.config.display(), "No config file found, using defaults");
        EngineConfig::default()
    };

    match cli.command {
        Commands::Validate { file } => {
            let workflow = load_workflow(&file)?;
            println!(
                "{}: {} nodes, agents: {}",
                workflow.id(),
                workflow.node_count(),
                workflow.agent_names().into_iter().collect::<Vec<_>>().join(", ")
            );
            print_tree(&workflow, 0);
        }
        Commands::DryRun { file, set } => {
            let workflow = load_workflow(&file)?;
            let mut registry = AgentRegistry::new();
            for name in workflow.agent_names() {
                registry.register(Arc::new(EchoAgent { name }))?;
            }
            let initial: Map<String, Value> = set
                .into_iter()
                .map(|(k, v)| (k, Value::String(v)))
                .collect();

            let engine = WorkflowEngine::new(Arc::new(registry), config);
            let result = engine.run(&workflow, initial, RunOptions::default()).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::Estimate { file, bpe } => {
            let text = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let estimator: Box<dyn TokenEstimator> = if bpe {
                Box::new(BpeEstimator)
            } else {
                Box::new(CharEstimator::new(config.context.chars_per_token))
            };
            let tokens = estimator.estimate(&text);
            println!("{} tokens ({} chars)", tokens, text.chars().count());
            if tokens > config.context.max_tokens {
                warn!(
                    tokens,
                    max_tokens = config.context.max_tokens,
                    "Document exceeds the configured context budget"
                );
            }
        }
        Commands::Chunk { file, budget } => {
            let text = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let manager = ContextWindowManager::from_config(&config.context);
            for (i, chunk) in manager.chunk(&text, budget).enumerate() {
                println!("--- chunk {} ({} tokens) ---", i + 1, manager.cost(chunk));
                print!("{}", chunk);
                if !chunk.ends_with('\n') {
                    println!();
                }
            }
        }
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

/// Load a workflow tree from TOML or JSON, chosen by extension.
fn load_workflow(path: &Path) -> anyhow::Result<WorkflowNode> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading workflow {}", path.display()))?;
    let workflow: WorkflowNode = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => toml::from_str(&content)?,
        Some("json") => serde_json::from_str(&content)?,
        other => bail!(
            "unsupported workflow format {:?}; expected .toml or .json",
            other.unwrap_or("")
        ),
    };
    workflow.validate()?;
    Ok(workflow)
}

fn print_tree(node: &WorkflowNode, depth: usize) {
    let indent = "  ".repeat(depth);
    match node {
        WorkflowNode::Leaf { id, agent, .. } => println!("{}- {} [leaf -> {}]", indent, id, agent),
        WorkflowNode::Loop {
            id, max_iterations, ..
        } => println!("{}- {} [loop, max {}]", indent, id, max_iterations),
        other => println!("{}- {} [{}]", indent, other.id(), other.kind()),
    }
    for child in node.children() {
        print_tree(child, depth + 1);
    }
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got '{}'", raw))
}

/// Returns its task prompt unchanged.
struct EchoAgent {
    name: String,
}

impl Agent for EchoAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Echoes its task"
    }

    fn run(&self, task: AgentTask) -> BoxFuture<'_, Result<AgentOutput, AgentError>> {
        Box::pin(async move { Ok(AgentOutput::text(task.prompt)) })
    }
}
