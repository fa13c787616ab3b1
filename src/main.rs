//! `pxa-agent`: process entry point. Loads configuration, wires an [`Agent`],
//! and runs it until a shutdown signal arrives.
//!
//! Daemonization, the PCP/WebSocket broker connection, and TLS association
//! are out of this crate's scope (see [`pxa::agent`]); this binary supplies
//! only what is needed to exercise the request lifecycle end to end: a PID
//! file, structured logging, and a [`Connector`] that logs every outbound
//! message instead of sending it anywhere.

use std::sync::Arc;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use clap::Parser as _;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

use pxa::agent::Agent;
use pxa::config::Cli;
use pxa::connector::Connector;
use pxa::pid_file::PidFile;
use pxa::response::ActionResponse;

/// A [`Connector`] that logs every outbound message via `tracing` instead of
/// delivering it. Stands in for the broker transport this crate does not
/// implement.
#[derive(Debug, Default)]
struct LoggingConnector;

#[async_trait]
impl Connector for LoggingConnector {
    #[expect(clippy::unused_async, reason = "Connector's methods are async for every impl; this one logs rather than awaiting I/O")]
    async fn send_pxp_error(&self, target: &str, transaction_id: &str, description: &str) {
        tracing::warn!(target, transaction_id, description, "PXPError");
    }

    #[expect(clippy::unused_async, reason = "Connector's methods are async for every impl; this one logs rather than awaiting I/O")]
    async fn send_blocking_response(&self, target: &str, response: &ActionResponse) {
        tracing::info!(target, results = ?log_safe(response), "blocking response");
    }

    #[expect(clippy::unused_async, reason = "Connector's methods are async for every impl; this one logs rather than awaiting I/O")]
    async fn send_provisional_response(&self, target: &str, transaction_id: &str) {
        tracing::info!(target, transaction_id, "provisional response");
    }

    #[expect(clippy::unused_async, reason = "Connector's methods are async for every impl; this one logs rather than awaiting I/O")]
    async fn send_non_blocking_response(&self, target: &str, response: &ActionResponse, job_id: &str) {
        tracing::info!(target, job_id, results = ?log_safe(response), "non-blocking response");
    }
}

fn log_safe(response: &ActionResponse) -> Value { Value::Object(response.metadata().clone()) }

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let Ok(mut term) = signal(SignalKind::terminate()) else {
            let _ = tokio::signal::ctrl_c().await;
            return;
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = term.recv() => {},
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .json()
        .init();

    let cli = Cli::parse();
    let config = cli.config;

    tokio::fs::create_dir_all(&config.spool_dir).await.context("creating spool directory")?;
    tokio::fs::create_dir_all(&config.cache_dir).await.context("creating cache directory")?;

    let mut pid_file = PidFile::new(&config.spool_dir).context("opening PID file directory")?;
    pid_file.lock().context("another pxa-agent instance is already running")?;
    pid_file.write(std::process::id()).context("writing PID file")?;
    pid_file.cleanup_when_done();

    let connector: Arc<dyn Connector> = Arc::new(LoggingConnector);
    let agent = Arc::new(Agent::new(&config, connector).await.context("building agent")?);
    tracing::info!(spool_dir = %config.spool_dir, modules_dir = %config.modules_dir, "pxa-agent starting");

    let purge_handle = agent.spawn_purge_loop();

    shutdown_signal().await;
    tracing::info!("shutdown signal received");

    agent.shutdown().await;
    purge_handle.abort();

    Ok(())
}
