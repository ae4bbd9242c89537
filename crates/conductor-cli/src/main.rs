//! `conductor` command-line runner.

mod config;
mod worker;

use clap::{Parser, Subcommand};
use conductor_orchestrator::{ChannelDispatcher, Orchestrator, WorkflowStatus, WorkflowValidator};
use config::CliConfig;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "conductor", about = "Conductor task orchestration and workflow runner")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "conductor.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a workflow file and list every problem found
    Validate {
        /// Workflow definition (TOML, or JSON with a .json extension)
        workflow: PathBuf,
    },
    /// Run a workflow against the configured local workers
    Run {
        workflow: PathBuf,
        /// Run input as key=value; may be repeated
        #[arg(short, long = "input")]
        inputs: Vec<String>,
        /// Print the orchestrator statistics after the run
        #[arg(long)]
        stats: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .json()
        .init();

    let cli = Cli::parse();
    let config = CliConfig::load(&cli.config)?;

    match cli.command {
        Commands::Validate { workflow } => {
            let definition = config::load_workflow(&workflow)?;
            let issues = WorkflowValidator::validate(&definition);
            if issues.is_empty() {
                println!(
                    "workflow '{}' is valid ({} steps)",
                    definition.name,
                    definition.steps.len()
                );
                return Ok(());
            }
            for issue in &issues {
                println!("  - {issue}");
            }
            anyhow::bail!(
                "workflow '{}' has {} issue(s)",
                definition.name,
                issues.len()
            );
        }
        Commands::Run {
            workflow,
            inputs,
            stats,
        } => {
            let definition = config::load_workflow(&workflow)?;
            let inputs = config::parse_inputs(&inputs)?;

            let dispatcher = Arc::new(ChannelDispatcher::default());
            let orchestrator = Arc::new(Orchestrator::new(
                config.orchestrator.clone(),
                Arc::clone(&dispatcher) as _,
            )?);
            worker::spawn_pool(&orchestrator, &dispatcher, config.workers_for(&definition)).await?;
            orchestrator.start()?;

            info!(workflow = %definition.name, "Running workflow");
            let result = orchestrator.run_workflow(definition, inputs).await;
            let stats_map = orchestrator.stats();
            orchestrator.shutdown().await;
            let summary = result?;

            println!("{}", serde_json::to_string_pretty(&summary)?);
            if stats {
                println!("{}", serde_json::to_string_pretty(&stats_map)?);
            }
            if summary.status != WorkflowStatus::Completed {
                anyhow::bail!("workflow run {} failed", summary.run_id);
            }
            Ok(())
        }
    }
}
