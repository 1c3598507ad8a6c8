//! Cevra API Gateway
//!
//! The single process serving the HTTP API. It loads configuration,
//! connects the database, wires every service and handles:
//! - Request routing and validation
//! - Per-class rate limiting
//! - Streaming chat responses
//! - Observability (logging, metrics)

mod app;
mod handlers;
mod middleware;

use anyhow::Context;
use cevra_common::{config::AppConfig, db::DbPool, metrics};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = Arc::new(AppConfig::load().context("failed to load configuration")?);

    init_tracing(&config);
    info!("Starting Cevra API Gateway v{}", cevra_common::VERSION);

    // Initialize metrics
    if config.observability.metrics_port != 0 {
        let addr = SocketAddr::from(([0, 0, 0, 0], config.observability.metrics_port));
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("failed to start the Prometheus exporter")?;
        info!(%addr, "Prometheus exporter listening");
    }
    metrics::register_metrics();

    // Initialize database connection
    let db = DbPool::new(&config.database).await?;
    if config.database.auto_create_schema {
        db.ensure_schema().await?;
    }

    let state = app::AppState::build(config.clone(), db).await?;
    let router = app::create_router(state);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("invalid server address")?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "Listening");

    let grace = config.shutdown_timeout();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            force_exit_after(grace);
        })
        .await?;

    info!("Server shutdown complete");
    Ok(())
}

/// JSON or human-readable output; RUST_LOG overrides the configured level
fn init_tracing(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.observability.log_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    if config.observability.json_logging {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Open streams are given `grace` to finish once shutdown starts
fn force_exit_after(grace: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(grace).await;
        warn!(grace_secs = grace.as_secs(), "Graceful shutdown timed out, exiting");
        std::process::exit(1);
    });
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, starting shutdown..."),
        _ = terminate => info!("Received SIGTERM, starting shutdown..."),
    }
}
