//! pgvault: PostgreSQL backup and restore orchestrator.
//!
//! `backup` dumps every selected database into one compressed snapshot,
//! uploads it, prunes expired snapshots and reports the run. `restore` replays
//! a snapshot (the newest by default) back into the server.

// pgvault/src/main.rs
mod backup;
mod config;
mod errors;
mod notify;
mod restore;
mod snapshot;
mod storage;
mod utils;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use config::{AppConfig, DEFAULT_CONFIG_FILE};
use errors::AppError;
use snapshot::human_size;
use storage::open_store;

#[derive(Parser, Debug)]
#[command(name = "pgvault", version, about = "PostgreSQL backup and restore orchestrator")]
struct Cli {
    /// JSON config file; environment variables override its values.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Dump, upload, prune and notify.
    Backup,
    /// Replay a snapshot into the database (newest when no name is given).
    Restore {
        #[arg(short, long, env = "RESTORE_SNAPSHOT")]
        snapshot: Option<String>,
    },
    /// List stored snapshots, newest first.
    List,
    /// Run the retention sweep without taking a backup.
    Prune,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "pgvault=info".into()))
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();
    match run_app(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("❌ Error: {:#}", e);
            ExitCode::from(exit_code_for(&e))
        }
    }
}

fn exit_code_for(err: &anyhow::Error) -> u8 {
    err.downcast_ref::<AppError>()
        .map_or(1, AppError::exit_code)
}

async fn run_app(cli: Cli) -> Result<()> {
    let (config_path, required) = match cli.config {
        Some(path) => (path, true),
        None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
    };
    let app_config = AppConfig::load(&config_path, required)
        .with_context(|| format!("Failed to load configuration from {}", config_path.display()))?;

    match cli.command {
        Command::Backup => {
            let run = backup::run_backup_flow(&app_config).await;
            if !run.is_success() {
                anyhow::bail!(
                    "Backup run {} failed: {}",
                    run.run_id,
                    run.error_detail.unwrap_or_default()
                );
            }
        }
        Command::Restore { snapshot } => {
            let report = restore::run_restore_flow(&app_config, snapshot)
                .await
                .context("Restore process failed")?;
            info!(
                "✅ Restored {} into {} databases",
                report.snapshot.name,
                report.databases.len()
            );
        }
        Command::List => list_snapshots(&app_config).await?,
        Command::Prune => {
            backup::run_prune_flow(&app_config)
                .await
                .context("Retention sweep failed")?;
        }
    }
    Ok(())
}

fn newest_first(snapshots: &mut [snapshot::Snapshot]) {
    snapshots.sort_by(|a, b| b.cmp(a));
}

async fn list_snapshots(app_config: &AppConfig) -> Result<()> {
    let store = open_store(app_config).await?;
    let mut snapshots = store
        .list()
        .await
        .with_context(|| format!("Failed to list snapshots in {}", store.describe()))?;
    newest_first(&mut snapshots);

    if snapshots.is_empty() {
        println!("No snapshots in {}", store.describe());
        return Ok(());
    }
    println!("{} snapshots in {}:", snapshots.len(), store.describe());
    for snap in &snapshots {
        println!(
            "  {:<45} {:>10}  {}",
            snap.name,
            human_size(snap.size_bytes),
            snap.created_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }
    Ok(())
}
