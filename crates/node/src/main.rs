//! Node entry point: reads env/config, builds the controller, and runs
//! until a termination signal arrives.
//!
//! Safety features:
//! - Signal handler: SIGTERM/SIGINT → stop workers, close all valves
//! - Durable zone state with unclean-shutdown recovery on next boot
//! - Weather fetch failures degrade to standard conditions

use std::env;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{info, warn};

use irrigation_node::controller::Controller;

#[tokio::main]
async fn main() -> Result<()> {
    // ── Structured logging ──────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "node.toml".to_string());
    let data_dir = env::var("DATA_DIR").unwrap_or_else(|_| "data".to_string());
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("failed to create data dir: {data_dir}"))?;

    let config = irrigation_node::config::load(&config_path)?;
    info!(
        config = %config_path,
        circuits = config.circuits.len(),
        "configuration loaded"
    );

    // ── Controller ──────────────────────────────────────────────────
    let state_path = Path::new(&data_dir).join("zones_state.json");
    let log_path = Path::new(&data_dir).join("irrigation_log.json");
    let controller = Controller::new(config, state_path, log_path).await?;
    controller.start().context("failed to start controller")?;
    info!("irrigation node running");

    // ── Signal handling ─────────────────────────────────────────────
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    let exit_reason = tokio::select! {
        _ = &mut ctrl_c => "SIGINT",
        _ = sigterm.recv() => "SIGTERM",
    };

    // ── Graceful shutdown ───────────────────────────────────────────
    warn!(signal = exit_reason, "shutting down");
    controller.shutdown().await;
    info!("shutdown complete");
    Ok(())
}
