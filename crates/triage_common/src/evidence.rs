//! Evidence records: normalized, sanitized observations about monitored
//! infrastructure.
//!
//! Records are immutable after construction. Sanitization is a
//! constructor-time invariant: no payload key or value ever contains a
//! space, tab, carriage return, newline, or pipe character, so a record
//! always survives line-oriented transports unchanged.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Severity of an evidence record. The derive order gives the total
/// order used for "most severe wins" classification.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "info" => Some(Severity::Info),
            "warning" => Some(Severity::Warning),
            "critical" => Some(Severity::Critical),
            _ => None,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What kind of observation a record represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EvidenceKind {
    HostState,
    EndpointProbe,
    LogTail,
    ProcessSnapshot,
    SecurityHint,
    CollectorError,
}

impl EvidenceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvidenceKind::HostState => "host-state",
            EvidenceKind::EndpointProbe => "endpoint-probe",
            EvidenceKind::LogTail => "log-tail",
            EvidenceKind::ProcessSnapshot => "process-snapshot",
            EvidenceKind::SecurityHint => "security-hint",
            EvidenceKind::CollectorError => "collector-error",
        }
    }
}

/// Ordered string-to-string payload. Insertion order is preserved so a
/// record renders and parses deterministically.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(Vec<(String, String)>);

impl Payload {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Insert a key/value pair, sanitizing both. A repeated key
    /// overwrites in place, keeping its original position.
    pub fn insert(&mut self, key: &str, value: &str) {
        let key = sanitize_key(key);
        let value = sanitize_field(value);
        if let Some(entry) = self.0.iter_mut().find(|(k, _)| *k == key) {
            entry.1 = value;
        } else {
            self.0.push((key, value));
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: AsRef<str>, V: AsRef<str>> FromIterator<(K, V)> for Payload {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut payload = Payload::new();
        for (k, v) in iter {
            payload.insert(k.as_ref(), v.as_ref());
        }
        payload
    }
}

/// Replace every character that would break the line format. Empty
/// strings become `-` so `key=` stays parseable.
pub fn sanitize_field(s: &str) -> String {
    let cleaned: String = s
        .chars()
        .map(|c| match c {
            ' ' | '\t' | '\r' | '\n' | '|' => '_',
            other => other,
        })
        .collect();
    if cleaned.is_empty() {
        "-".to_string()
    } else {
        cleaned
    }
}

/// Keys additionally may not contain `=`, which delimits key from value.
fn sanitize_key(s: &str) -> String {
    sanitize_field(s).replace('=', ":")
}

/// One normalized observation flowing from a probe into the collector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceRecord {
    pub timestamp: DateTime<Utc>,
    /// Producer identity, e.g. `agent:host`, `agent:endpoint`.
    pub source_id: String,
    pub kind: EvidenceKind,
    pub severity: Severity,
    /// Short tag naming the specific anomaly, e.g. `dns_fail`.
    pub trigger: String,
    pub message: String,
    pub payload: Payload,
}

impl EvidenceRecord {
    pub fn new(
        source_id: &str,
        kind: EvidenceKind,
        severity: Severity,
        trigger: &str,
        message: &str,
        payload: Payload,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            source_id: sanitize_field(source_id),
            kind,
            severity,
            trigger: sanitize_field(trigger),
            message: sanitize_field(message),
            payload,
        }
    }

    /// Render as one line for human or log consumption:
    /// `timestamp | level=<severity> | key=value key=value ...`
    pub fn to_line(&self) -> String {
        let mut fields = vec![
            format!("source={}", self.source_id),
            format!("kind={}", self.kind.as_str()),
            format!("trigger={}", self.trigger),
            format!("message={}", self.message),
        ];
        for (k, v) in self.payload.iter() {
            fields.push(format!("{}={}", k, v));
        }
        format!(
            "{} | level={} | {}",
            self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            self.severity,
            fields.join(" ")
        )
    }

    /// Parse a line produced by [`to_line`]. Returns `None` for
    /// anything that does not match the format.
    pub fn parse_line(line: &str) -> Option<Self> {
        let mut parts = line.splitn(3, " | ");
        let ts = parts.next()?;
        let level = parts.next()?.strip_prefix("level=")?;
        let fields = parts.next()?;

        let timestamp = DateTime::parse_from_rfc3339(ts).ok()?.with_timezone(&Utc);
        let severity = Severity::parse(level)?;

        let mut source_id = String::new();
        let mut kind = EvidenceKind::CollectorError;
        let mut trigger = String::new();
        let mut message = String::new();
        let mut payload = Payload::new();

        for field in fields.split(' ') {
            let (key, value) = field.split_once('=')?;
            match key {
                "source" => source_id = value.to_string(),
                "kind" => {
                    kind = serde_json::from_value(serde_json::Value::String(value.to_string()))
                        .ok()?
                }
                "trigger" => trigger = value.to_string(),
                "message" => message = value.to_string(),
                _ => payload.insert(key, value),
            }
        }

        Some(Self {
            timestamp,
            source_id,
            kind,
            severity,
            trigger,
            message,
            payload,
        })
    }
}
