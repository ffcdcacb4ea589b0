mod journal;
mod settings;
mod simulator;

use clap::{Parser, Subcommand};
use journal::EventJournal;
use settings::CliConfig;
use std::path::{Path, PathBuf};
use std::time::Duration;
use taskweave_orchestrator::{
    OrchestrationContext, TaskGraph, WorkflowDefinition, WorkflowEngine, WorkflowStatus,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "taskweave", about = "Taskweave: dependency-aware workflow dispatcher")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "taskweave.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workflow against the simulated executor
    Run {
        /// Workflow definition (TOML)
        workflow: PathBuf,
        /// Append every bus event to this JSON-lines file
        #[arg(long)]
        journal: Option<PathBuf>,
        /// Cancel the workflow if it has not finished by then
        #[arg(long, default_value_t = 300)]
        timeout_secs: u64,
    },
    /// Check a workflow definition without running it
    Validate {
        /// Workflow definition (TOML)
        workflow: PathBuf,
    },
    /// List configured agents
    Agents,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let cli = Cli::parse();
    let config = CliConfig::load(&cli.config).await?;

    match cli.command {
        Commands::Run {
            workflow,
            journal,
            timeout_secs,
        } => run(config, workflow, journal, Duration::from_secs(timeout_secs)).await,
        Commands::Validate { workflow } => validate(&config, &workflow),
        Commands::Agents => {
            let agents = &config.orchestrator.agents;
            if agents.is_empty() {
                println!("No agents configured.");
                println!("Declare agents in {} under [[agents]]", cli.config.display());
                return Ok(());
            }
            println!("Configured agents:");
            for agent in agents {
                let tags: Vec<&str> = agent.capabilities.iter().map(String::as_str).collect();
                println!(
                    "  {} (capacity {}): {}",
                    agent.id,
                    agent.capacity,
                    tags.join(", ")
                );
                if let Some(category) = &agent.category {
                    println!("    category: {category}");
                }
                if !agent.preferences.is_empty() {
                    println!("    prefers: {}", agent.preferences.join(", "));
                }
            }
            println!("\nTotal: {} agent(s)", agents.len());
            Ok(())
        }
    }
}

async fn run(
    config: CliConfig,
    workflow: PathBuf,
    journal_path: Option<PathBuf>,
    timeout: Duration,
) -> anyhow::Result<()> {
    let definition = WorkflowDefinition::load(&workflow)?;
    let ctx = OrchestrationContext::from_config(&config.orchestrator)?;
    info!(
        agents = ctx.registry.len(),
        workflow = %definition.name,
        "Orchestrator ready"
    );

    let journal = match journal_path {
        Some(path) => {
            let mut journal = EventJournal::open(path).await?;
            journal.attach(&ctx.bus)?;
            Some(journal)
        }
        None => None,
    };

    let engine = WorkflowEngine::new(ctx.clone(), &config.orchestrator)?;
    simulator::attach(&ctx.bus, config.simulator)?;

    let outcome = execute(&engine, definition, timeout).await;

    if let Some(journal) = journal {
        journal.close(&ctx.bus).await;
    }
    ctx.bus.shutdown().await;

    match outcome? {
        WorkflowStatus::Completed => Ok(()),
        status => Err(anyhow::anyhow!("workflow ended {status}")),
    }
}

async fn execute(
    engine: &WorkflowEngine,
    definition: WorkflowDefinition,
    timeout: Duration,
) -> anyhow::Result<WorkflowStatus> {
    let id = engine.submit(definition).await?;
    let status = match engine.wait(id, timeout).await {
        Ok(status) => status,
        Err(e) => {
            warn!(workflow_id = %id, error = %e, "Workflow did not finish in time");
            engine.cancel(id).await?
        }
    };
    let report = engine.report(id).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(status)
}

fn validate(config: &CliConfig, workflow: &Path) -> anyhow::Result<()> {
    let definition = WorkflowDefinition::load(workflow)?;
    let graph = TaskGraph::build(definition.tasks.clone())?;

    let agents = &config.orchestrator.agents;
    let mut unhandled: Vec<&str> = graph
        .tasks()
        .iter()
        .map(|t| t.task_type.as_str())
        .filter(|task_type| !agents.iter().any(|a| a.handles(task_type)))
        .collect();
    unhandled.sort_unstable();
    unhandled.dedup();

    println!(
        "Workflow '{}' is valid: {} task(s)",
        definition.name,
        graph.len()
    );
    if !unhandled.is_empty() {
        println!(
            "  warning: no configured agent declares {}; dispatch will fall back to any free agent",
            unhandled.join(", ")
        );
    }
    Ok(())
}
