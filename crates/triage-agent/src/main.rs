//! Triage probe agent.
//!
//! Samples host and endpoint state on a fixed cadence, classifies the
//! observations, and ships them to the control plane in batches.
//! Sampling never blocks on delivery: a failed flush is retried on the
//! next cycle and evidence is superseded by newer samples.

mod buffer;
mod client;
mod config;
mod sample;

use anyhow::Result;
use buffer::EvidenceBuffer;
use clap::Parser;
use client::ControlPlaneClient;
use config::AgentConfig;
use sample::{EndpointSampler, HostSampler};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};
use triage_common::{Classifier, EvidenceKind, EvidenceRecord, Payload, Severity, Thresholds};

#[derive(Parser)]
#[command(name = "triage-agent", version, about = "Evidence-producing probe agent")]
struct Cli {
    /// Path to the agent config file
    #[arg(short, long, default_value = config::CONFIG_PATH)]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let cfg = AgentConfig::load(&cli.config)?;

    info!("triage-agent v{} starting", env!("CARGO_PKG_VERSION"));

    let client = ControlPlaneClient::new(
        &cfg.control_plane_url,
        &cfg.token,
        &cfg.agent_id,
        Duration::from_secs(cfg.flush_timeout_secs),
    )?;

    if let Err(e) = client.heartbeat(&cfg.env).await {
        // The control plane may come up after us; keep sampling anyway.
        warn!("Initial heartbeat failed: {}", e);
    }

    let mut buffer = EvidenceBuffer::new(cfg.buffer_capacity, cfg.batch_max);
    let mut host = cfg.host_enabled.then(|| HostSampler::new(&cfg.agent_id));
    let endpoint = cfg.endpoint_url.as_ref().map(|url| {
        let classifier = Classifier::new(
            &format!("{}:endpoint", cfg.agent_id),
            Thresholds {
                latency_warn_ms: cfg.latency_warn_ms,
            },
        );
        EndpointSampler::new(url, classifier)
    });

    let mut tick = tokio::time::interval(Duration::from_secs(cfg.poll_interval_secs.max(1)));

    loop {
        tokio::select! {
            _ = tick.tick() => {
                run_cycle(&cfg, &mut buffer, host.as_mut(), endpoint.as_ref(), &client).await;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down, attempting final flush");
                if let Err(e) = buffer.flush(&client).await {
                    warn!("Final flush failed, {} records lost: {}", buffer.len(), e);
                }
                break;
            }
        }
    }

    Ok(())
}

async fn run_cycle(
    cfg: &AgentConfig,
    buffer: &mut EvidenceBuffer,
    host: Option<&mut HostSampler>,
    endpoint: Option<&EndpointSampler>,
    client: &ControlPlaneClient,
) {
    if let Some(sampler) = host {
        buffer.add(sampler.sample());
    }

    if let Some(sampler) = endpoint {
        buffer.add(sampler.sample().await);
    }

    if buffer.is_empty() {
        return;
    }

    // One flush per tick, plus extra batches while a recovered backlog
    // still holds a full batch. At most one failure per cycle.
    loop {
        match buffer.flush(client).await {
            Ok(sent) => {
                if sent > 0 {
                    info!("Flushed {} records ({} pending)", sent, buffer.len());
                }
                if !buffer.should_flush() {
                    break;
                }
            }
            Err(e) => {
                error!("Evidence flush failed: {}", e);
                // Record the delivery failure itself as evidence for
                // the next successful flush.
                let mut payload = Payload::new();
                payload.insert("pending", &buffer.len().to_string());
                buffer.add(EvidenceRecord::new(
                    &cfg.agent_id,
                    EvidenceKind::CollectorError,
                    Severity::Warning,
                    "send_error",
                    &e.to_string(),
                    payload,
                ));
                break;
            }
        }
    }
}
