//! Compliance orchestrator binary
//!
//! Runs the task scheduler as a long-lived process, or executes and inspects single
//! tasks from the command line.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use compliance_graph::CancellationToken;
use compliance_orchestrator::logging::init_logging;
use compliance_orchestrator::router::{route, ROUTES};
use compliance_orchestrator::{
    ComplianceOrchestrator, ConfigLoader, OrchestratorConfig, TaskCategory, WorkflowHandlers,
};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "compliance-orchestrator")]
#[command(about = "Schedule and run compliance workflows", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file
    #[arg(short, long, global = true, env = "COMPLIANCE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler until Ctrl-C or SIGTERM
    Run,

    /// Execute one task now and print its result
    Execute {
        /// Task type, e.g. update_compliance_scores
        task_type: String,

        /// Parameters as a JSON object
        #[arg(short, long)]
        params: Option<String>,
    },

    /// Show the category a task type routes to
    Route {
        /// Task type; omit to list the routing table
        task_type: Option<String>,
    },

    /// Validate configuration and print the effective settings
    CheckConfig,
}

fn load_config(path: Option<PathBuf>) -> anyhow::Result<OrchestratorConfig> {
    let loader = match path {
        Some(path) => ConfigLoader::new().with_path(path),
        None => ConfigLoader::new(),
    };
    loader.load().context("Failed to load configuration")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config)?;

    match cli.command {
        Commands::Run => {
            init_logging(&config.logging)?;
            run(config).await?;
        }
        Commands::Execute { task_type, params } => {
            init_logging(&config.logging)?;
            let params = match params {
                Some(raw) => serde_json::from_str(&raw).context("--params must be valid JSON")?,
                None => serde_json::Value::Null,
            };
            let orchestrator = ComplianceOrchestrator::new(config, WorkflowHandlers::new()).await?;
            let result = orchestrator.execute_task(&task_type, params).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::Route { task_type } => match task_type {
            Some(task_type) => {
                let category = route(&task_type);
                if category == TaskCategory::Error {
                    bail!("No route for task type '{task_type}'");
                }
                println!(
                    "{task_type} -> {category} (entry: {})",
                    category.entry_node().unwrap_or("-")
                );
            }
            None => {
                for (task_type, category) in ROUTES {
                    println!("{task_type:<28} {category}");
                }
            }
        },
        Commands::CheckConfig => {
            let tasks = config.scheduled_tasks()?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            println!("Configuration OK: {} scheduled task(s)", tasks.len());
        }
    }

    Ok(())
}

async fn run(config: OrchestratorConfig) -> anyhow::Result<()> {
    tracing::info!(version = compliance_orchestrator::version(), "Starting compliance orchestrator");
    let orchestrator = ComplianceOrchestrator::new(config, WorkflowHandlers::new()).await?;

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        shutdown.cancel();
    });

    orchestrator.run(cancel).await;

    let health = orchestrator.health().await;
    tracing::info!(
        pending = health.pending,
        running = health.running,
        failed = health.failed,
        total = health.total,
        "Scheduler stopped"
    );
    Ok(())
}

/// Signal for graceful shutdown (Ctrl-C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for CTRL-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received CTRL-C signal, shutting down");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM signal, shutting down");
        }
    }
}
