//! Command-line entry point for the draw oracle.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use draw_oracle::config::OracleConfig;
use draw_oracle::oracle::{OracleBuilder, Orchestrator, PipelineExecution, RunSelector};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// Prediction runs for numbered draws.
#[derive(Parser, Debug)]
#[command(name = "draw-oracle")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (defaults are used when omitted)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the pipeline once in the foreground
    Run,

    /// Start a run in the background and wait for it to finish
    Trigger,

    /// Show a run's status
    Status {
        /// Run id (latest run when omitted)
        #[arg(long)]
        run_id: Option<i64>,
    },

    /// List recent runs
    History {
        #[arg(long, default_value_t = 10)]
        limit: u32,
    },

    /// Start a run every few minutes until interrupted
    Daemon {
        #[arg(long, default_value_t = 60)]
        every_minutes: u64,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<OracleConfig> {
    match path {
        Some(path) => OracleConfig::load(path)
            .with_context(|| format!("failed to load config from {}", path.display())),
        None => {
            let mut config = OracleConfig::default();
            config.apply_env_overrides();
            config.validate().context("default configuration is invalid")?;
            Ok(config)
        }
    }
}

fn print_execution(execution: &PipelineExecution) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(execution)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;
    config.logging.init();

    let orchestrator = OracleBuilder::from_config(config)
        .connect()
        .await
        .context("failed to set up the orchestrator")?;

    match cli.command {
        Commands::Status { run_id } => {
            let selector = run_id.map_or(RunSelector::Latest, RunSelector::Id);
            match orchestrator.status(selector).await? {
                Some(execution) => print_execution(&execution)?,
                None => println!("no such run"),
            }
        }
        Commands::History { limit } => {
            for execution in orchestrator.history(limit).await? {
                println!(
                    "{:>6}  {}  {:<9}  {}",
                    execution.id.unwrap_or_default(),
                    execution.started_at.format("%Y-%m-%d %H:%M:%S"),
                    execution.status.as_str(),
                    execution.failure_reason.as_deref().unwrap_or("")
                );
            }
        }
        Commands::Run => {
            orchestrator.initialize().await?;
            let execution = orchestrator.run_now().await?;
            print_execution(&execution)?;
        }
        Commands::Trigger => {
            orchestrator.initialize().await?;
            let orchestrator = Arc::new(orchestrator);
            let handle = orchestrator.trigger().await?;
            println!("{}", serde_json::to_string(&handle.ack)?);
            let execution = handle.completion.await.context("run task panicked")?;
            print_execution(&execution)?;
        }
        Commands::Daemon { every_minutes } => {
            orchestrator.initialize().await?;
            info!("Starting a run every {} minutes", every_minutes);
            let every = Duration::from_secs(every_minutes.max(1).saturating_mul(60));
            let shutdown = async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!("Could not listen for ctrl-c: {}", e);
                    std::future::pending::<()>().await;
                }
                info!("Shutting down");
            };
            if let Some(last) = Arc::new(orchestrator).run_every(every, shutdown).await {
                info!("Last run {:?} ended {}", last.id, last.status);
            }
        }
    }

    Ok(())
}
