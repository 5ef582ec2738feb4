//! GPU Cleanup
//!
//! One-shot removal of GPU device-plugin discovery labels from every node in
//! a Kubernetes cluster. Exits with 0 when every node was reconciled, 2 when
//! some nodes failed, and 1 when the run could not start or list nodes.

mod cli;
mod config;
mod report;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cli::Cli;
use config::Config;
use gpu_cleanup_core::metrics::MetricsRegistry;
use gpu_cleanup_core::{ReconcileSummary, Reconciler};
use gpu_cleanup_k8s::K8sClient;

/// Exit code when every node was reconciled
const EXIT_SUCCESS: u8 = 0;

/// Exit code when at least one node could not be reconciled
const EXIT_PARTIAL_FAILURE: u8 = 2;

/// Process exit status for a finished run
fn exit_status(summary: &ReconcileSummary) -> u8 {
    if summary.is_success() {
        EXIT_SUCCESS
    } else {
        EXIT_PARTIAL_FAILURE
    }
}

/// Initialize the tracing/logging subsystem
///
/// Logs go to stderr; stdout carries the report.
fn init_logging(log_level: &str, json_format: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    if json_format {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

/// Flip `shutdown_tx` on SIGINT, SIGTERM, or when the run deadline passes
fn spawn_shutdown_handler(shutdown_tx: watch::Sender<bool>, deadline: Option<Duration>) {
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                warn!(error = %e, "Failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        let expired = async {
            match deadline {
                Some(deadline) => tokio::time::sleep(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            _ = ctrl_c => {
                info!("Received Ctrl+C, cancelling run");
            }
            _ = terminate => {
                info!("Received SIGTERM, cancelling run");
            }
            _ = expired => {
                warn!(deadline = ?deadline, "Run deadline reached, cancelling run");
            }
        }

        let _ = shutdown_tx.send(true);
    });
}

/// Write the metrics text exposition for a node-exporter textfile collector
fn write_metrics(metrics: &MetricsRegistry, path: &std::path::Path) -> Result<()> {
    let text = metrics.encode_text().context("Failed to encode metrics")?;
    std::fs::write(path, text)
        .with_context(|| format!("Failed to write metrics to {:?}", path))?;
    info!(path = ?path, "Metrics written");
    Ok(())
}

async fn run(cli: Cli) -> Result<ExitCode> {
    // Load configuration
    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => Config::default(),
    };

    // Apply CLI overrides
    config.apply_cli(&cli);
    config.validate().context("Invalid configuration")?;
    let rules = config.rules()?;

    info!(
        dry_run = config.dry_run,
        concurrency = config.concurrency,
        patterns = ?config.label_patterns,
        "Configuration loaded"
    );

    let metrics = Arc::new(MetricsRegistry::new());
    let client = K8sClient::new().await?.with_page_size(config.page_size);
    let reconciler = Reconciler::new(
        Arc::new(client),
        rules,
        config.reconcile_config(),
        metrics.clone(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_shutdown_handler(shutdown_tx, config.deadline);

    let summary = reconciler
        .run(shutdown_rx)
        .await
        .context("Node reconciliation aborted")?;

    report::print(&summary, cli.output)?;

    if let Some(path) = &config.metrics.textfile {
        if let Err(e) = write_metrics(&metrics, path) {
            warn!(error = %e, "Failed to export metrics");
        }
    }

    let status = exit_status(&summary);
    if status != EXIT_SUCCESS {
        error!(
            failed = summary.failed,
            nodes = ?summary.failed_nodes,
            "Some nodes could not be reconciled"
        );
    }
    Ok(ExitCode::from(status))
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Parse CLI arguments
    let cli = Cli::parse_args();

    // Initialize logging
    init_logging(&cli.log_level, cli.log_json);

    info!(version = env!("CARGO_PKG_VERSION"), "gpu-cleanup starting");

    run(cli).await
}
