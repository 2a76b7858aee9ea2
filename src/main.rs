//! Housekeeper
//!
//! Backs up a PostgreSQL database and data directories into one archive,
//! on a schedule or on demand.

// housekeeper/src/main.rs
mod backup;
mod config;
mod errors;
mod health;
mod housekeeper;
mod scheduler;
mod utils;

use anyhow::{Context, Result};
use std::env;
use std::process::ExitCode;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info};

use crate::config::Config;
use crate::housekeeper::Housekeeper;
use crate::scheduler::BackupScheduler;

/// Upper bound for a running backup to finish after a shutdown signal.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, PartialEq, Eq)]
enum Action {
    /// Run the backup schedule until a shutdown signal arrives.
    Serve,
    /// One backup, then exit.
    Backup,
    /// Probe a running instance.
    Healthcheck,
}

impl Action {
    fn parse(arg: Option<&str>) -> Result<Self> {
        match arg.map(|a| a.trim().to_lowercase()).as_deref() {
            None | Some("") => Ok(Action::Serve),
            Some("backup") => Ok(Action::Backup),
            Some("healthcheck") => Ok(Action::Healthcheck),
            Some(other) => anyhow::bail!("Unknown action: {}", other),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let arg = env::args().nth(1);
    let action = match Action::parse(arg.as_deref()) {
        Ok(action) => action,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if action == Action::Healthcheck {
        return match health::healthcheck(&config::healthcheck_socket()).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("check failed: {:#}", e);
                ExitCode::FAILURE
            }
        };
    }

    match run_app(action).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_app(action: Action) -> Result<()> {
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            utils::logger::init("info")?;
            return Err(e).context("Failed to load config");
        }
    };
    utils::logger::init(&config.log_level)?;

    let mut housekeeper = Housekeeper::new(config)?;
    housekeeper.prepare().await?;

    if action == Action::Backup {
        return housekeeper
            .backup_service()
            .backup()
            .await
            .context("Backup failed");
    }

    let scheduler = BackupScheduler::start(housekeeper.backup_service().clone())
        .await
        .context("Failed to create backup schedule")?;

    wait_for_shutdown().await?;

    scheduler.stop(SHUTDOWN_TIMEOUT).await?;
    info!("Housekeeper stopped");
    Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
    let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())
        .context("Failed to install SIGTERM handler")?;

    tokio::select! {
        result = signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl+C")?;
            info!("Received SIGINT, shutting down");
        }
        _ = terminate.recv() => {
            info!("Received SIGTERM, shutting down");
        }
    }
    Ok(())
}
