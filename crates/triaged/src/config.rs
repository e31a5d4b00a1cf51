//! Daemon configuration.
//!
//! Loaded from /etc/triage/triaged.toml or a path given on the command
//! line. Every field has a default so a missing file still yields a
//! usable local setup, except that with no agent tokens configured all
//! evidence batches are rejected.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::{info, warn};
use triage_common::SafetyPolicy;

/// Default config file path
pub const CONFIG_PATH: &str = "/etc/triage/triaged.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_listen")]
    pub listen_addr: String,

    /// Shared secret per producer identity. A batch claiming a producer
    /// must carry that producer's bearer credential.
    #[serde(default)]
    pub agent_tokens: HashMap<String, String>,

    #[serde(default = "default_session_hours")]
    pub session_duration_hours: i64,

    /// Timeout applied to every action and rollback command.
    #[serde(default = "default_step_timeout")]
    pub step_timeout_secs: u64,

    /// Cap on captured command output; oldest output is truncated.
    #[serde(default = "default_max_output")]
    pub max_output_bytes: usize,

    /// In-memory evidence log size; oldest entries fall off.
    #[serde(default = "default_evidence_capacity")]
    pub evidence_log_capacity: usize,

    #[serde(default)]
    pub policy: SafetyPolicy,
}

fn default_listen() -> String {
    // Localhost only; fronting proxies own external exposure.
    "127.0.0.1:7810".to_string()
}

fn default_session_hours() -> i64 {
    24
}

fn default_step_timeout() -> u64 {
    300
}

fn default_max_output() -> usize {
    64 * 1024
}

fn default_evidence_capacity() -> usize {
    10_000
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen(),
            agent_tokens: HashMap::new(),
            session_duration_hours: default_session_hours(),
            step_timeout_secs: default_step_timeout(),
            max_output_bytes: default_max_output(),
            evidence_log_capacity: default_evidence_capacity(),
            policy: SafetyPolicy::default(),
        }
    }
}

impl DaemonConfig {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            warn!(
                "No config at {}, using defaults (no agents authorized)",
                path.display()
            );
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Cannot read config at {}", path.display()))?;
        let config: DaemonConfig = toml::from_str(&raw)
            .with_context(|| format!("Invalid config at {}", path.display()))?;
        info!(
            "Loaded config: listen={} agents={}",
            config.listen_addr,
            config.agent_tokens.len()
        );
        Ok(config)
    }
}
