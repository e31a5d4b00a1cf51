//! Wire types for the agent-to-collector and viewer-to-session APIs.

use crate::action::{ActionStep, ProposedStep};
use crate::evidence::EvidenceRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Header naming the producer a batch claims to come from. The bearer
/// credential in `Authorization` must match this producer's shared
/// secret.
pub const AGENT_HEADER: &str = "x-triage-agent";

/// One flush call: the whole batch commits or none of it does.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceBatch {
    pub events: Vec<EvidenceRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestResponse {
    pub accepted: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub env: String,
    pub version: String,
}

/// Candidate action list from the external planner. The core validates
/// risk tier and blocklist membership only, never command syntax.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanProposal {
    /// Target service or incident this plan recovers.
    pub service_name: String,
    pub steps: Vec<ProposedStep>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanResponse {
    pub session_id: String,
    /// Opaque secret required for any session API call.
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub steps: Vec<ActionStep>,
}

/// Idempotent read of everything a viewer needs to render a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub service_name: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub plan: Vec<ActionStep>,
    pub viewers: Vec<String>,
    pub emergency_stopped: bool,
    pub stopped_by: Option<String>,
    pub stopped_reason: Option<String>,
}

/// Inbound messages on the viewer channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ViewerCommand {
    Approve { step_id: String },
    Reject { step_id: String, reason: String },
    EmergencyStop { reason: String },
}

/// Uniform error body for rejected API calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn viewer_commands_parse_from_tagged_json() {
        let cmd: ViewerCommand =
            serde_json::from_str(r#"{"type":"approve","step_id":"abc"}"#).unwrap();
        assert!(matches!(cmd, ViewerCommand::Approve { step_id } if step_id == "abc"));

        let cmd: ViewerCommand =
            serde_json::from_str(r#"{"type":"emergency_stop","reason":"wrong host"}"#).unwrap();
        assert!(matches!(cmd, ViewerCommand::EmergencyStop { reason } if reason == "wrong host"));
    }
}
