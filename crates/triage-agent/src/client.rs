//! HTTP client for the control plane.
//!
//! Every call carries the bearer credential plus the producer-identity
//! header. Failures surface as transport errors and are retried on the
//! buffer's own schedule, never here.

use crate::buffer::EvidenceSink;
use std::time::Duration;
use triage_common::protocol::{EvidenceBatch, Heartbeat, IngestResponse, AGENT_HEADER};
use triage_common::{EvidenceRecord, TriageError};

pub struct ControlPlaneClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
    agent_id: String,
}

impl ControlPlaneClient {
    pub fn new(
        base_url: &str,
        token: &str,
        agent_id: &str,
        timeout: Duration,
    ) -> Result<Self, TriageError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TriageError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            agent_id: agent_id.to_string(),
        })
    }

    pub async fn heartbeat(&self, env: &str) -> Result<(), TriageError> {
        let body = Heartbeat {
            env: env.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        };
        let response = self
            .http
            .post(format!("{}/api/agent/heartbeat", self.base_url))
            .bearer_auth(&self.token)
            .header(AGENT_HEADER, &self.agent_id)
            .json(&body)
            .send()
            .await
            .map_err(|e| TriageError::Transport(e.to_string()))?;
        self.check_status(response.status())?;
        Ok(())
    }

    /// Submit one batch. An accepted call commits the whole batch; a
    /// rejected call commits none of it.
    pub async fn send_evidence(&self, events: &[EvidenceRecord]) -> Result<usize, TriageError> {
        let body = EvidenceBatch {
            events: events.to_vec(),
        };
        let response = self
            .http
            .post(format!("{}/api/agent/evidence", self.base_url))
            .bearer_auth(&self.token)
            .header(AGENT_HEADER, &self.agent_id)
            .json(&body)
            .send()
            .await
            .map_err(|e| TriageError::Transport(e.to_string()))?;

        self.check_status(response.status())?;
        let accepted: IngestResponse = response
            .json()
            .await
            .map_err(|e| TriageError::Transport(e.to_string()))?;
        Ok(accepted.accepted)
    }

    fn check_status(&self, status: reqwest::StatusCode) -> Result<(), TriageError> {
        if status.is_success() {
            return Ok(());
        }
        match status.as_u16() {
            401 | 403 => Err(TriageError::Auth(format!(
                "control plane rejected credential for {}",
                self.agent_id
            ))),
            400 | 422 => Err(TriageError::Validation(format!(
                "control plane rejected batch: HTTP {}",
                status
            ))),
            _ => Err(TriageError::Transport(format!("HTTP {}", status))),
        }
    }
}

impl EvidenceSink for ControlPlaneClient {
    async fn send_batch(&self, batch: &[EvidenceRecord]) -> Result<usize, TriageError> {
        self.send_evidence(batch).await
    }
}
