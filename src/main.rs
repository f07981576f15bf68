//! Service Snapshot Backup Tool
//!
//! Takes point-in-time snapshots of mongo and redis and ships them to S3.
//! Usage: `cacti [task ...]` where tasks are configured service names
//! (`mongo`, `redis`); no arguments backs up every configured service.

// cacti/src/main.rs
mod backup;
mod config;
mod errors;

use anyhow::{Context, Result};
use config::BackupSettings;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_PATH: &str = "config.json";

/// Main entry point for the backup tool
#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match run_app().await {
        Ok(true) => {
            println!("✅ Backup completed successfully.");
            ExitCode::SUCCESS
        }
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("❌ Error: {:?}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_app() -> Result<bool> {
    let config_path = env::var("CACTI_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
    let settings = BackupSettings::load(&config_path).context(format!(
        "Failed to load application configuration from {}",
        config_path.display()
    ))?;

    let args: Vec<String> = env::args().skip(1).map(|a| a.trim().to_string()).collect();
    let requested = if args.is_empty() { None } else { Some(args.as_slice()) };

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling pending snapshot polls");
            on_signal.cancel();
        }
    });

    info!("🚀 Starting backup process");
    let report = backup::run_backup_flow(Arc::new(settings), requested, &cancel).await;

    for outcome in &report.outcomes {
        if let Ok(receipt) = &outcome.result {
            println!("✅ {}: uploaded to {}", outcome.task, receipt.location);
        }
    }
    for failure in report.failed() {
        eprintln!("❌ {}", failure);
    }
    println!(
        "{} of {} services backed up.",
        report.succeeded(),
        report.outcomes.len()
    );
    Ok(report.all_succeeded())
}
