//! Collector ingress: authenticates, validates, persists, and fans out
//! incoming evidence batches.
//!
//! Batches are all-or-nothing: one malformed record rejects the whole
//! call and commits none of it. Fan-out is fire-and-forget over a
//! broadcast channel; a stalled subscriber loses its oldest events but
//! never backpressures ingestion.

use crate::config::DaemonConfig;
use crate::evidence_log::EvidenceLog;
use std::collections::HashMap;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use triage_common::{EvidenceRecord, TriageError};

/// Per-subscriber queue depth; lagging subscribers drop oldest-first.
pub const SUBSCRIBER_QUEUE: usize = 256;

pub struct Ingress {
    agent_tokens: HashMap<String, String>,
    publisher: broadcast::Sender<EvidenceRecord>,
}

impl Ingress {
    pub fn new(config: &DaemonConfig) -> Self {
        let (publisher, _) = broadcast::channel(SUBSCRIBER_QUEUE);
        Self {
            agent_tokens: config.agent_tokens.clone(),
            publisher,
        }
    }

    /// Validate credentials and records, then commit the batch to the
    /// log and publish each record to live subscribers.
    pub fn ingest(
        &self,
        log: &mut EvidenceLog,
        producer_id: &str,
        credential: &str,
        batch: &[EvidenceRecord],
    ) -> Result<usize, TriageError> {
        self.authenticate(producer_id, credential)?;

        for (i, record) in batch.iter().enumerate() {
            validate_record(record)
                .map_err(|reason| TriageError::Validation(format!("record {}: {}", i, reason)))?;
        }

        log.append_batch(batch);
        for record in batch {
            // No receivers is fine; fan-out is best-effort.
            let _ = self.publisher.send(record.clone());
        }
        debug!("Ingested {} records from {}", batch.len(), producer_id);
        Ok(batch.len())
    }

    pub fn authenticate(&self, producer_id: &str, credential: &str) -> Result<(), TriageError> {
        match self.agent_tokens.get(producer_id) {
            Some(expected) if expected == credential => Ok(()),
            Some(_) => {
                warn!("Bad credential for producer {}", producer_id);
                Err(TriageError::Auth(format!(
                    "bad credential for {}",
                    producer_id
                )))
            }
            None => {
                warn!("Unknown producer {}", producer_id);
                Err(TriageError::Auth(format!(
                    "unknown producer {}",
                    producer_id
                )))
            }
        }
    }

    /// Live evidence stream for session viewers or a planner.
    pub fn subscribe(&self) -> broadcast::Receiver<EvidenceRecord> {
        self.publisher.subscribe()
    }
}

fn validate_record(record: &EvidenceRecord) -> Result<(), String> {
    if record.source_id.is_empty() || record.source_id == "-" {
        return Err("missing source_id".to_string());
    }
    if record.trigger.is_empty() || record.trigger == "-" {
        return Err("missing trigger".to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use triage_common::{EvidenceKind, Payload, Severity};

    fn config() -> DaemonConfig {
        let mut config = DaemonConfig::default();
        config
            .agent_tokens
            .insert("agent:web-1".to_string(), "s3cret".to_string());
        config
    }

    fn record(trigger: &str) -> EvidenceRecord {
        EvidenceRecord::new(
            "agent:web-1",
            EvidenceKind::EndpointProbe,
            Severity::Critical,
            trigger,
            "HTTP 503",
            Payload::new(),
        )
    }

    #[test]
    fn accepted_batch_commits_whole_batch() {
        let ingress = Ingress::new(&config());
        let mut log = EvidenceLog::new(100);
        let n = ingress
            .ingest(&mut log, "agent:web-1", "s3cret", &[record("a"), record("b")])
            .unwrap();
        assert_eq!(n, 2);
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn bad_credential_is_rejected() {
        let ingress = Ingress::new(&config());
        let mut log = EvidenceLog::new(100);
        let err = ingress
            .ingest(&mut log, "agent:web-1", "wrong", &[record("a")])
            .unwrap_err();
        assert!(matches!(err, TriageError::Auth(_)));
        assert!(log.is_empty());
    }

    #[test]
    fn unknown_producer_is_rejected() {
        let ingress = Ingress::new(&config());
        let mut log = EvidenceLog::new(100);
        assert!(ingress
            .ingest(&mut log, "agent:rogue", "s3cret", &[record("a")])
            .is_err());
    }

    #[test]
    fn one_malformed_record_rejects_the_whole_batch() {
        let ingress = Ingress::new(&config());
        let mut log = EvidenceLog::new(100);
        let mut bad = record("");
        bad.trigger = String::new();
        let err = ingress
            .ingest(&mut log, "agent:web-1", "s3cret", &[record("ok"), bad])
            .unwrap_err();
        assert!(matches!(err, TriageError::Validation(_)));
        // All-or-nothing: the valid record was not committed either.
        assert!(log.is_empty());
    }

    #[tokio::test]
    async fn accepted_records_reach_subscribers() {
        let ingress = Ingress::new(&config());
        let mut log = EvidenceLog::new(100);
        let mut rx = ingress.subscribe();
        ingress
            .ingest(&mut log, "agent:web-1", "s3cret", &[record("http_5xx")])
            .unwrap();
        let got = rx.recv().await.unwrap();
        assert_eq!(got.trigger, "http_5xx");
    }
}
