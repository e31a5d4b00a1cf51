//! Triage Daemon - incident triage control plane
//!
//! Ingests evidence from agents, gates recovery plans, and executes
//! approved actions.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;
use triaged::config::{DaemonConfig, CONFIG_PATH};
use triaged::server::{self, AppState};

#[derive(Parser)]
#[command(name = "triaged", about = "Incident triage control plane", version)]
struct Cli {
    /// Path to the daemon config file
    #[arg(short, long, default_value = CONFIG_PATH)]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    info!("triaged v{} starting", env!("CARGO_PKG_VERSION"));

    let config = DaemonConfig::load(&cli.config)?;
    if config.agent_tokens.is_empty() {
        tracing::warn!("No agent tokens configured; all evidence batches will be rejected");
    }

    server::run(AppState::new(config)).await
}
