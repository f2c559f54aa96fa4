use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use opsync_core::{uda_taskrc_lines, DurationFormatter, IsoDurationFormatter};
use opsync_sync::{
    keyring_service, run_sync_once, validate_targets, SyncConfig, TargetsFile, TaskCalcFormatter,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "opsync")]
#[command(about = "Pull OpenProject work packages into Taskwarrior-shaped task records")]
struct Cli {
    /// Targets file (defaults to $OPSYNC_CONFIG, then ./opsync.yaml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch and normalize work packages, one JSON record per line on stdout
    Sync {
        #[arg(long)]
        target: Option<String>,
        /// Convert durations with `task calc` instead of in-process
        #[arg(long)]
        task_calc: bool,
        /// Exit successfully even when some items failed to normalize
        #[arg(long)]
        allow_partial: bool,
    },
    /// Check every target's configuration without contacting the server
    Validate,
    /// Print the taskrc UDA declarations the records rely on
    Schema,
    /// Print the credential-store identity of a target
    KeyringService {
        #[arg(long)]
        target: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = SyncConfig::from_env();
    if let Some(path) = cli.config {
        config = config.with_config_path(path);
    }

    match cli.command.unwrap_or(Commands::Sync {
        target: None,
        task_calc: false,
        allow_partial: false,
    }) {
        Commands::Sync {
            target,
            task_calc,
            allow_partial,
        } => {
            let formatter: Arc<dyn DurationFormatter> = if task_calc {
                Arc::new(TaskCalcFormatter::default())
            } else {
                Arc::new(IsoDurationFormatter)
            };
            let runs = run_sync_once(&config, target.as_deref(), formatter).await?;

            let mut failed = 0usize;
            for run in &runs {
                for record in &run.records {
                    let line = serde_json::to_string(&record.to_task_fields())
                        .context("serializing task record")?;
                    println!("{line}");
                }
                info!(
                    target_name = %run.summary.target,
                    run_id = %run.summary.run_id,
                    fetched = run.summary.fetched,
                    normalized = run.summary.normalized,
                    failed = run.summary.failures.len(),
                    "sync complete"
                );
                for failure in &run.summary.failures {
                    warn!(item_id = ?failure.item_id, "failed: {}", failure.error);
                }
                failed += run.summary.failures.len();
            }
            if failed > 0 && !allow_partial {
                bail!("{failed} work package(s) could not be normalized");
            }
        }
        Commands::Validate => {
            for service in validate_targets(&config).await? {
                let metadata = service.metadata();
                println!(
                    "ok {} url={} project_name={}",
                    service.target,
                    metadata.url,
                    metadata.project_name.as_deref().unwrap_or("-")
                );
            }
        }
        Commands::Schema => {
            for line in uda_taskrc_lines() {
                println!("{line}");
            }
        }
        Commands::KeyringService { target } => {
            let file = TargetsFile::load(&config.config_path).await?;
            println!("{}", keyring_service(&file.target(&target)?.options));
        }
    }

    Ok(())
}
