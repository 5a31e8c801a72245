mod logging;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use dwh_adapters::{CommandExtractor, CommandMerger};
use dwh_controller::{build_poll_scheduler, Collaborators, ControllerConfig, Orchestrator};
use dwh_core::RunStatus;
use tracing::{info, warn};

use crate::logging::LogLevel;

#[derive(Debug, Parser)]
#[command(name = "dwh-cli")]
#[command(about = "Incremental DWH controller")]
struct Cli {
    /// YAML configuration file. Without it, settings come from `DWH_*` variables.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Logging level; falls back to `DWH_LOG`, then `info`.
    #[arg(long, value_enum, value_name = "LEVEL")]
    log_level: Option<LogLevel>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the incremental schedule until Ctrl-C.
    Serve,
    /// Run one full extraction and exit.
    Batch,
    /// Run one incremental extraction and merge, then exit.
    Incremental,
    /// Print the state recovered from disk as JSON.
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_logging(cli.log_level);

    let config = match &cli.config {
        Some(path) => ControllerConfig::from_yaml_file(path)?,
        None => ControllerConfig::from_env(),
    };

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await,
        Commands::Batch => run_once(config, false).await,
        Commands::Incremental => run_once(config, true).await,
        Commands::Status => status(config).await,
    }
}

fn collaborators(config: &ControllerConfig) -> Result<Collaborators> {
    let extract = config
        .extract_command
        .as_deref()
        .ok_or_else(|| anyhow!("no extraction command configured (DWH_EXTRACT_CMD)"))?;
    let merge = config
        .merge_command
        .as_deref()
        .ok_or_else(|| anyhow!("no merge command configured (DWH_MERGE_CMD)"))?;
    Ok(Collaborators::new(
        Arc::new(CommandExtractor::new(extract)),
        Arc::new(CommandMerger::new(merge)),
    ))
}

async fn serve(config: ControllerConfig) -> Result<()> {
    let collaborators = collaborators(&config)?;
    let interval = config.poll_interval();
    let orchestrator = Orchestrator::initialize(config, collaborators).await?;
    orchestrator.register_existing_tables().await;

    let mut scheduler = build_poll_scheduler(Arc::clone(&orchestrator), interval).await?;
    scheduler.start().await.context("starting poll scheduler")?;
    info!(
        every = ?interval,
        next_trigger = ?orchestrator.next_trigger().await,
        "controller running"
    );

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;

    info!("shutting down");
    if let Some(active) = orchestrator.active_run().await {
        warn!(
            run_id = %active.run_id,
            kind = ?active.kind,
            started_at = %active.started_at,
            "a run is still active; its job process will be terminated"
        );
    }
    scheduler
        .shutdown()
        .await
        .context("stopping poll scheduler")?;
    Ok(())
}

async fn run_once(config: ControllerConfig, incremental: bool) -> Result<()> {
    let collaborators = collaborators(&config)?;
    let orchestrator = Orchestrator::initialize(config, collaborators).await?;

    let handle = if incremental {
        orchestrator.start_incremental().await?
    } else {
        orchestrator.start_batch().await?
    };
    handle.wait().await?;

    let record = orchestrator
        .last_run()
        .await
        .context("run finished without a record")?;
    println!("{}", serde_json::to_string_pretty(&record)?);
    if !record.is_finalized() {
        return Err(anyhow!("run {} ended without an outcome", record.run_id));
    }
    if record.status == RunStatus::Failure {
        return Err(anyhow!(
            "run failed; diagnostics: {}",
            record.diagnostics.as_deref().unwrap_or("not captured")
        ));
    }
    Ok(())
}

async fn status(config: ControllerConfig) -> Result<()> {
    let snapshot = Orchestrator::inspect(&config).await?;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}
