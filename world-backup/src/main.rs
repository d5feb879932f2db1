//! World backup - Main entry point

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use world_backup::daemon::shutdown::{ShutdownCoordinator, DEFAULT_GRACE};
use world_backup::host::directory::DirectoryHost;
use world_backup::schedule::{BackupScheduler, Schedule};
use world_backup::{utils, BackupManager, BackupOutcome, Config, UploadOutcome};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the scheduler until SIGINT/SIGTERM
    Run,

    /// Take one backup now
    Backup {
        /// Keep the archive local even when uploading is enabled
        #[arg(long)]
        local: bool,
    },

    /// Upload and delete a small file to check the upload settings
    TestUpload,

    /// Show the next scheduled backup times
    Next {
        #[arg(short = 'n', long, default_value_t = 5)]
        count: usize,
    },

    /// Print the effective configuration as TOML
    PrintConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => Config::default(),
    };

    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    match args.command {
        Command::Run => run(config).await,
        Command::Backup { local } => backup_once(config, !local).await,
        Command::TestUpload => test_upload(config).await,
        Command::Next { count } => {
            let schedule = Schedule::configure(
                &config.backup.schedule,
                chrono::Local::now().naive_local(),
            )?;
            println!("Schedule: {}", schedule.expression());
            for at in schedule.upcoming(count) {
                println!("  {}", at.format("%Y-%m-%d %H:%M"));
            }
            Ok(())
        }
        Command::PrintConfig => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

async fn run(config: Config) -> Result<()> {
    tracing::info!("Starting world-backup v{}", env!("CARGO_PKG_VERSION"));

    let host = Arc::new(DirectoryHost::from_config(&config.server)?);
    let manager = Arc::new(BackupManager::new(host.clone(), config));

    let scheduler = BackupScheduler::new(manager.clone()).await?;
    scheduler.init_schedule().await?;
    scheduler.start().await?;
    tracing::info!("Next backup at {}", scheduler.next_fire());

    let shutdown_coordinator = ShutdownCoordinator::new();
    shutdown_coordinator.wait_for_signal().await;

    host.disable();
    if let Err(e) = scheduler.shutdown().await {
        tracing::warn!("Scheduler shutdown error: {}", e);
    }
    shutdown_coordinator.shutdown(&manager, DEFAULT_GRACE).await;
    host.shutdown();

    Ok(())
}

async fn backup_once(config: Config, upload: bool) -> Result<()> {
    let host = Arc::new(DirectoryHost::from_config(&config.server)?);
    let manager = BackupManager::new(host.clone(), config);

    let outcome = manager.run_backup(upload, false).await;
    host.shutdown();

    match outcome {
        BackupOutcome::Completed { path, upload, .. } => {
            println!("{}", path.display());
            if let Some(handle) = upload {
                if let UploadOutcome::Failed(reason) = handle.await? {
                    anyhow::bail!("upload failed: {}", reason);
                }
            }
            Ok(())
        }
        BackupOutcome::Skipped(reason) => anyhow::bail!("{}", reason),
        BackupOutcome::Failed(reason) => anyhow::bail!("backup failed: {}", reason),
    }
}

async fn test_upload(config: Config) -> Result<()> {
    if !config.upload.enabled {
        tracing::warn!("Uploading is disabled in the configuration, testing anyway");
    }
    let data_dir = config.data_dir();
    let uploader = world_backup::Uploader::new(config.upload);

    let handle = uploader
        .test_upload(&data_dir)
        .await
        .context("test upload was not started")?;
    match handle.await? {
        UploadOutcome::Failed(reason) => anyhow::bail!("test upload failed: {}", reason),
        _ => Ok(()),
    }
}
