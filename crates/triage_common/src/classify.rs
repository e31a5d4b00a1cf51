//! Deterministic evidence classification.
//!
//! Turns one raw endpoint observation into a typed [`EvidenceRecord`]
//! using a fixed threshold table. When several conditions match in one
//! observation cycle the most severe wins; at equal severity the more
//! specific trigger (listed first below) wins. Only one trigger label is
//! surfaced, but every contributing raw field still lands in the
//! payload.
//!
//! Classification never fails: unparseable input degrades to
//! `info`/`unknown`.

use crate::evidence::{EvidenceKind, EvidenceRecord, Payload, Severity};
use serde::{Deserialize, Serialize};

/// Raw output of one endpoint probe cycle, before classification.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawObservation {
    pub url: String,
    #[serde(default)]
    pub dns_ok: bool,
    /// `None` for plain-http targets where no handshake was attempted.
    #[serde(default)]
    pub tls_ok: Option<bool>,
    /// HTTP status code; `0` or absent means the connection failed.
    #[serde(default)]
    pub http_code: Option<u16>,
    #[serde(default)]
    pub latency_ms: Option<u64>,
}

/// Threshold table for the classifier. Fixed per classifier instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thresholds {
    /// Latency at or above this is a `latency_spike`.
    pub latency_warn_ms: u64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            latency_warn_ms: 2_000,
        }
    }
}

pub struct Classifier {
    source_id: String,
    thresholds: Thresholds,
}

impl Classifier {
    pub fn new(source_id: &str, thresholds: Thresholds) -> Self {
        Self {
            source_id: source_id.to_string(),
            thresholds,
        }
    }

    /// Classify one observation. Pure function of the observation and
    /// the threshold table.
    pub fn classify(&self, obs: &RawObservation) -> EvidenceRecord {
        // Candidates in specificity order; the most severe wins, ties
        // go to the earlier entry.
        let mut candidates: Vec<(Severity, &str, String)> = Vec::new();

        if !obs.dns_ok {
            candidates.push((
                Severity::Critical,
                "dns_fail",
                format!("DNS resolution failed for {}", obs.url),
            ));
        }
        if obs.tls_ok == Some(false) {
            candidates.push((
                Severity::Critical,
                "tls_fail",
                format!("TLS handshake failed for {}", obs.url),
            ));
        }
        match obs.http_code {
            None | Some(0) => candidates.push((
                Severity::Critical,
                "connect_fail",
                format!("HTTP request failed for {}", obs.url),
            )),
            Some(code) if code >= 500 => candidates.push((
                Severity::Critical,
                "http_5xx",
                format!("HTTP {} for {}", code, obs.url),
            )),
            Some(code) if code >= 400 => candidates.push((
                Severity::Warning,
                "http_4xx",
                format!("HTTP {} for {}", code, obs.url),
            )),
            Some(_) => {}
        }
        if let Some(latency) = obs.latency_ms {
            if latency >= self.thresholds.latency_warn_ms {
                candidates.push((
                    Severity::Warning,
                    "latency_spike",
                    format!("Latency {}ms for {}", latency, obs.url),
                ));
            }
        }

        // Strictly-greater comparison keeps the earlier (more specific)
        // candidate on a severity tie.
        let mut winner: Option<(Severity, &str, String)> = None;
        for candidate in candidates {
            if winner.as_ref().map_or(true, |(best, _, _)| candidate.0 > *best) {
                winner = Some(candidate);
            }
        }
        let (severity, trigger, message) = winner.unwrap_or((
            Severity::Info,
            "normal",
            format!("OK {} {}", obs.http_code.unwrap_or(0), obs.url),
        ));

        EvidenceRecord::new(
            &self.source_id,
            EvidenceKind::EndpointProbe,
            severity,
            trigger,
            &message,
            self.payload_for(obs),
        )
    }

    /// Classify an untyped observation. Anything that does not
    /// deserialize as a [`RawObservation`] becomes `info`/`unknown`
    /// rather than an error.
    pub fn classify_value(&self, value: &serde_json::Value) -> EvidenceRecord {
        match serde_json::from_value::<RawObservation>(value.clone()) {
            Ok(obs) => self.classify(&obs),
            Err(_) => EvidenceRecord::new(
                &self.source_id,
                EvidenceKind::EndpointProbe,
                Severity::Info,
                "unknown",
                "Unparseable observation",
                [("raw", value.to_string().as_str())].into_iter().collect(),
            ),
        }
    }

    fn payload_for(&self, obs: &RawObservation) -> Payload {
        let mut payload = Payload::new();
        payload.insert("url", &obs.url);
        payload.insert("dns_ok", if obs.dns_ok { "true" } else { "false" });
        if let Some(tls_ok) = obs.tls_ok {
            payload.insert("tls_ok", if tls_ok { "true" } else { "false" });
        }
        payload.insert(
            "http_code",
            &format!("{:03}", obs.http_code.unwrap_or(0)),
        );
        if let Some(latency) = obs.latency_ms {
            payload.insert("latency_ms", &latency.to_string());
        }
        payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> Classifier {
        Classifier::new("agent:endpoint", Thresholds::default())
    }

    #[test]
    fn unreachable_host_is_connect_fail() {
        // DNS resolves but the TCP connect never completes.
        let obs = RawObservation {
            url: "http://10.255.255.1/".into(),
            dns_ok: true,
            tls_ok: None,
            http_code: Some(0),
            latency_ms: Some(5_000),
        };
        let record = classifier().classify(&obs);
        assert_eq!(record.severity, Severity::Critical);
        assert_eq!(record.trigger, "connect_fail");
        assert_eq!(record.payload.get("http_code"), Some("000"));
    }

    #[test]
    fn http_503_after_clean_dns_and_tls_is_http_5xx() {
        let obs = RawObservation {
            url: "https://example.com/".into(),
            dns_ok: true,
            tls_ok: Some(true),
            http_code: Some(503),
            latency_ms: Some(120),
        };
        let record = classifier().classify(&obs);
        assert_eq!(record.severity, Severity::Critical);
        assert_eq!(record.trigger, "http_5xx");
    }

    #[test]
    fn tls_handshake_failure_is_tls_fail() {
        // DNS resolved, handshake failed, no HTTP attempt was made.
        let obs = RawObservation {
            url: "https://expired.example.com/".into(),
            dns_ok: true,
            tls_ok: Some(false),
            http_code: None,
            latency_ms: None,
        };
        let record = classifier().classify(&obs);
        assert_eq!(record.trigger, "tls_fail");
        assert_eq!(record.severity, Severity::Critical);
        assert_eq!(record.payload.get("tls_ok"), Some("false"));
    }

    #[test]
    fn dns_failure_outranks_everything() {
        let obs = RawObservation {
            url: "https://nxdomain.invalid/".into(),
            dns_ok: false,
            tls_ok: Some(false),
            http_code: Some(0),
            latency_ms: None,
        };
        let record = classifier().classify(&obs);
        assert_eq!(record.trigger, "dns_fail");
        assert_eq!(record.severity, Severity::Critical);
    }

    #[test]
    fn slow_but_healthy_is_latency_spike() {
        let obs = RawObservation {
            url: "https://example.com/".into(),
            dns_ok: true,
            tls_ok: Some(true),
            http_code: Some(200),
            latency_ms: Some(2_500),
        };
        let record = classifier().classify(&obs);
        assert_eq!(record.severity, Severity::Warning);
        assert_eq!(record.trigger, "latency_spike");
    }

    #[test]
    fn healthy_observation_is_normal() {
        let obs = RawObservation {
            url: "https://example.com/".into(),
            dns_ok: true,
            tls_ok: Some(true),
            http_code: Some(200),
            latency_ms: Some(80),
        };
        let record = classifier().classify(&obs);
        assert_eq!(record.severity, Severity::Info);
        assert_eq!(record.trigger, "normal");
        // Contributing fields are still visible even though only one
        // trigger label is surfaced.
        assert_eq!(record.payload.get("latency_ms"), Some("80"));
    }

    #[test]
    fn garbage_degrades_to_unknown() {
        let record = classifier().classify_value(&serde_json::json!(["not", "an", "object"]));
        assert_eq!(record.severity, Severity::Info);
        assert_eq!(record.trigger, "unknown");
    }
}
