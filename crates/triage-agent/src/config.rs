//! Agent configuration.
//!
//! Loads settings from a TOML file, falling back to defaults for any
//! missing field. The control-plane URL, bearer token, and agent id are
//! the only fields without a sensible default.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::info;

/// Default config file path
pub const CONFIG_PATH: &str = "/etc/triage/agent.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Producer identity sent with every batch, e.g. `agent:web-1`.
    pub agent_id: String,

    /// Base URL of the control plane, e.g. `http://127.0.0.1:7810`.
    pub control_plane_url: String,

    /// Bearer credential handed to the agent at provisioning time.
    pub token: String,

    #[serde(default = "default_env")]
    pub env: String,

    /// Sampling cadence. Flush is bound to this tick; a dropped batch
    /// is superseded by the next sampling cycle.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Endpoint to check each cycle, if any.
    #[serde(default)]
    pub endpoint_url: Option<String>,

    #[serde(default = "default_true")]
    pub host_enabled: bool,

    /// Max records held before the oldest are evicted.
    #[serde(default = "default_capacity")]
    pub buffer_capacity: usize,

    /// Records per flush attempt.
    #[serde(default = "default_batch_max")]
    pub batch_max: usize,

    /// Latency at or above this classifies as a spike.
    #[serde(default = "default_latency_warn")]
    pub latency_warn_ms: u64,

    /// Per-attempt deadline for the flush network call.
    #[serde(default = "default_flush_timeout")]
    pub flush_timeout_secs: u64,
}

fn default_env() -> String {
    "prod".to_string()
}

fn default_poll_interval() -> u64 {
    15
}

fn default_true() -> bool {
    true
}

fn default_capacity() -> usize {
    5_000
}

fn default_batch_max() -> usize {
    200
}

fn default_latency_warn() -> u64 {
    2_000
}

fn default_flush_timeout() -> u64 {
    10
}

impl AgentConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Cannot read agent config at {}", path.display()))?;
        let config: AgentConfig = toml::from_str(&raw)
            .with_context(|| format!("Invalid agent config at {}", path.display()))?;
        info!(
            "Loaded agent config: id={} control_plane={}",
            config.agent_id, config.control_plane_url
        );
        Ok(config)
    }
}
