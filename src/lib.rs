//! logwarden -- in-memory indexed log store with baseline-driven anomaly
//! detection.
//!
//! This crate provides the monitoring core: a capped, multiply-indexed record
//! store with cached search and timed retention, per-entity behavioural
//! baselines, pluggable anomaly rules, risk scoring and alerts, plus a thin
//! HTTP API over all of it.

pub mod api;
pub mod config;
pub mod detect;
pub mod monitor;
pub mod scheduler;
pub mod storage;

use std::sync::Arc;

use anyhow::{Context, Result};

pub use crate::config::Config;
pub use crate::monitor::{Monitor, MonitorError, RetentionReport};

/// Start the logwarden daemon: record store, retention sweeper and API server.
pub async fn serve(config: Config) -> Result<()> {
    // 1. Build the monitor
    let monitor = Arc::new(Monitor::new(config.clone()).context("failed to build monitor")?);

    // 2. Start the retention sweeper (background task)
    let sweeper = monitor.start_retention();

    // 3. Start API Server
    let addr: std::net::SocketAddr = config
        .api
        .bind
        .parse()
        .with_context(|| format!("invalid bind address: {}", config.api.bind))?;
    let app = api::router(api::state::AppState::new(monitor));

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(%addr, "logwarden listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("API server failed")?;

    // 4. Stop sweeping; a sweep in progress finishes first
    sweeper.shutdown().await;
    tracing::info!("logwarden stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
