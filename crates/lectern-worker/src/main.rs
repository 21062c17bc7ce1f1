//! Extraction worker daemon.
//!
//! Opens the store, runs migrations, starts an extraction pool configured
//! from the environment and stops it gracefully on Ctrl-C / SIGTERM.

use std::time::Duration;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lectern_core::defaults::{DATABASE_URL, STOP_TIMEOUT_SECS};
use lectern_db::{log_pool_metrics, Database, PoolConfig};
use lectern_jobs::{ExtractorRegistry, WorkerBuilder, WorkerConfig};

/// Initialize tracing with configurable output.
///
/// Environment variables:
///   LOG_FORMAT  - "json" or "text" (default: "text")
///   LOG_FILE    - path to log file (optional, enables file logging)
///   LOG_ANSI    - "true"/"false" override ANSI colors (auto-detected by default)
///   RUST_LOG    - standard env filter (default: "lectern=info")
fn init_logging() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let log_file = std::env::var("LOG_FILE").ok();
    let log_ansi = std::env::var("LOG_ANSI")
        .ok()
        .map(|v| v == "true" || v == "1");

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "lectern_worker=info,lectern_jobs=info,lectern_db=info".into()
    });
    let registry = tracing_subscriber::registry().with(env_filter);

    let guard = if let Some(ref path) = log_file {
        let path = std::path::Path::new(path);
        let file_dir = path.parent().unwrap_or(std::path::Path::new("."));
        let file_name = path
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or("lectern-worker.log");
        let file_appender = tracing_appender::rolling::daily(file_dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        if log_format == "json" {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(non_blocking),
                )
                .init();
        } else {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(non_blocking)
                        .with_ansi(log_ansi.unwrap_or(false)),
                )
                .init();
        }
        Some(guard)
    } else {
        if log_format == "json" {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        } else {
            let mut layer = tracing_subscriber::fmt::layer();
            if let Some(ansi) = log_ansi {
                layer = layer.with_ansi(ansi);
            }
            registry.with(layer).init();
        }
        None
    };

    info!(
        log_format = %log_format,
        log_file = log_file.as_deref().unwrap_or("(stdout)"),
        "Logging initialized"
    );
    guard
}

/// Resolve on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let _log_guard = init_logging();

    let config = WorkerConfig::from_env();
    let database_url = std::env::var("DATABASE_URL").unwrap_or_else(|_| DATABASE_URL.to_string());
    let stop_timeout = Duration::from_secs(
        std::env::var("EXTRACTION_STOP_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(STOP_TIMEOUT_SECS),
    );

    // Every unit plus the heartbeat loop holds at most one connection at a time.
    let max_connections = u32::try_from(config.num_workers + 2)
        .unwrap_or(u32::MAX)
        .max(10);
    let db = Database::connect_with_config(
        &database_url,
        PoolConfig::default().max_connections(max_connections),
    )
    .await
    .with_context(|| format!("failed to open store at {}", database_url))?;
    db.migrate().await.context("failed to run migrations")?;
    log_pool_metrics(db.pool());

    let registry = ExtractorRegistry::with_builtins();
    for (name, healthy) in registry.health_check_all().await {
        if healthy {
            info!(extractor = %name, "Extractor available");
        } else {
            warn!(
                extractor = %name,
                "Extractor dependency missing, jobs for it will retry as missing_capability"
            );
        }
    }

    let worker = WorkerBuilder::new(db.clone())
        .with_config(config)
        .with_registry(registry)
        .build();
    let handle = worker.start().await.context("failed to start worker pool")?;

    let status = worker.get_status().await?;
    info!(
        pool = %status.pool_name,
        num_workers = status.num_workers,
        queue_depth = status.queue_depth,
        "Extraction worker running"
    );

    shutdown_signal().await;

    let stopped = handle.stop(stop_timeout).await;
    match worker.get_status().await {
        Ok(status) => info!(
            stopped_cleanly = stopped,
            status = %serde_json::to_string(&status.stats).unwrap_or_default(),
            queue_depth = status.queue_depth,
            "Extraction worker stopped"
        ),
        Err(e) => warn!(error = %e, "Failed to read final status"),
    }

    db.close().await;
    Ok(())
}
