//! pgs3backup - stream a PostgreSQL database to S3 as a tar archive.

mod config;
mod logging;

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use pgs3backup_driver_postgres::PostgresConnector;
use pgs3backup_dump::{BackupPipeline, BackupReport};
use tokio_util::sync::CancellationToken;

use crate::config::BackupConfig;

#[tokio::main]
async fn main() -> ExitCode {
    let config = BackupConfig::parse();

    if let Err(e) = logging::init(config.log_format) {
        eprintln!("failed to initialize logging: {e:#}");
        return ExitCode::FAILURE;
    }

    match run(config).await {
        Ok(report) => {
            println!("{}", report.location);
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "backup failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: BackupConfig) -> anyhow::Result<BackupReport> {
    config.validate().context("invalid configuration")?;
    tracing::info!(config = ?config, "starting pgs3backup");

    let started_at = Utc::now();
    let connector = Arc::new(PostgresConnector::new(config.postgres_config()));
    let sink = Arc::new(
        config
            .s3_config()
            .build()
            .context("failed to configure S3 client")?,
    );

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    let pipeline = BackupPipeline::new(connector, sink, config.backup_options(started_at))
        .with_shutdown(shutdown);
    let report = pipeline
        .run(&config.upload_target(started_at))
        .await
        .with_context(|| format!("backup of database {} failed", config.db_name))?;

    Ok(report)
}

/// Cancel `token` on SIGINT or SIGTERM
fn spawn_signal_handler(token: CancellationToken) {
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::warn!("shutdown signal received, aborting backup");
        token.cancel();
    });
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "cannot listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "cannot listen for SIGTERM");
            ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    ctrl_c().await;
}
