//! Samplers feeding the evidence buffer.
//!
//! The host sampler reads cpu/memory/disk through sysinfo. The
//! endpoint sampler resolves DNS, performs an explicit TLS handshake
//! for https targets, then times one GET; it reports the status code,
//! or code 0 when the request never completed, and leaves the
//! classifier to assign severity and trigger.

use std::sync::Arc;
use std::time::{Duration, Instant};
use sysinfo::{Disks, System};
use tokio::net::TcpStream;
use tokio_rustls::rustls::{self, OwnedTrustAnchor, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::debug;
use triage_common::{
    Classifier, EvidenceKind, EvidenceRecord, Payload, RawObservation, Severity,
};

const HOST_CRITICAL_PERCENT: f64 = 95.0;

const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct HostSampler {
    source_id: String,
    system: System,
}

impl HostSampler {
    pub fn new(agent_id: &str) -> Self {
        Self {
            source_id: format!("{}:host", agent_id),
            system: System::new(),
        }
    }

    pub fn sample(&mut self) -> EvidenceRecord {
        self.system.refresh_cpu();
        self.system.refresh_memory();

        let cpu_percent = self.system.global_cpu_info().cpu_usage() as f64;
        let total_mem = self.system.total_memory().max(1);
        let mem_percent = self.system.used_memory() as f64 / total_mem as f64 * 100.0;

        let disks = Disks::new_with_refreshed_list();
        let disk_percent = disks
            .iter()
            .map(|d| {
                let total = d.total_space().max(1);
                (total - d.available_space()) as f64 / total as f64 * 100.0
            })
            .fold(0.0_f64, f64::max);

        let pressured = cpu_percent > HOST_CRITICAL_PERCENT || disk_percent > HOST_CRITICAL_PERCENT;
        let (severity, trigger) = if pressured {
            (Severity::Critical, "host_pressure")
        } else {
            (Severity::Info, "normal")
        };

        let mut payload = Payload::new();
        payload.insert("cpu_percent", &format!("{:.1}", cpu_percent));
        payload.insert("mem_percent", &format!("{:.1}", mem_percent));
        payload.insert("disk_percent", &format!("{:.1}", disk_percent));

        EvidenceRecord::new(
            &self.source_id,
            EvidenceKind::HostState,
            severity,
            trigger,
            "Host health sample",
            payload,
        )
    }
}

pub struct EndpointSampler {
    url: String,
    classifier: Classifier,
    http: reqwest::Client,
    tls: TlsConnector,
}

impl EndpointSampler {
    pub fn new(url: &str, classifier: Classifier) -> Self {
        Self {
            url: url.to_string(),
            classifier,
            http: reqwest::Client::new(),
            tls: tls_connector(),
        }
    }

    pub async fn sample(&self) -> EvidenceRecord {
        let obs = self.observe().await;
        debug!("Endpoint observation: {:?}", obs);
        self.classifier.classify(&obs)
    }

    async fn observe(&self) -> RawObservation {
        let mut obs = RawObservation {
            url: self.url.clone(),
            ..RawObservation::default()
        };

        let (host, port, is_https) = match split_host_port(&self.url) {
            Some(parts) => parts,
            None => return obs,
        };

        if tokio::net::lookup_host((host.as_str(), port)).await.is_err() {
            return obs;
        }
        obs.dns_ok = true;

        // Explicit handshake before the GET, so a certificate or
        // protocol failure surfaces as tls_fail rather than folding
        // into connect_fail.
        if is_https {
            match self.handshake(&host, port).await {
                Some(true) => obs.tls_ok = Some(true),
                Some(false) => {
                    obs.tls_ok = Some(false);
                    return obs;
                }
                // TCP connect itself failed.
                None => {
                    obs.http_code = Some(0);
                    return obs;
                }
            }
        }

        let started = Instant::now();
        match self.http.get(&self.url).send().await {
            Ok(response) => {
                obs.latency_ms = Some(started.elapsed().as_millis() as u64);
                obs.http_code = Some(response.status().as_u16());
            }
            Err(_) => {
                obs.latency_ms = Some(started.elapsed().as_millis() as u64);
                obs.http_code = Some(0);
            }
        }
        obs
    }

    /// One TLS handshake against the target. `Some(false)` is a
    /// handshake failure on a reachable host; `None` means the TCP
    /// connect never completed.
    async fn handshake(&self, host: &str, port: u16) -> Option<bool> {
        let server_name = match rustls::ServerName::try_from(host) {
            Ok(name) => name,
            Err(e) => {
                debug!("Host {:?} is not a valid TLS server name: {}", host, e);
                return Some(false);
            }
        };

        let connect = TcpStream::connect((host, port));
        let stream = match tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, connect).await {
            Ok(Ok(stream)) => stream,
            _ => return None,
        };

        match tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, self.tls.connect(server_name, stream))
            .await
        {
            Ok(Ok(_)) => Some(true),
            Ok(Err(e)) => {
                debug!("TLS handshake failed for {}:{}: {}", host, port, e);
                Some(false)
            }
            Err(_) => Some(false),
        }
    }
}

fn tls_connector() -> TlsConnector {
    let mut roots = RootCertStore::empty();
    roots.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|anchor| {
        OwnedTrustAnchor::from_subject_spki_name_constraints(
            anchor.subject,
            anchor.spki,
            anchor.name_constraints,
        )
    }));
    let config = rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

/// Minimal URL split; enough for `http(s)://host[:port]/...`.
fn split_host_port(url: &str) -> Option<(String, u16, bool)> {
    let (is_https, rest) = if let Some(rest) = url.strip_prefix("https://") {
        (true, rest)
    } else if let Some(rest) = url.strip_prefix("http://") {
        (false, rest)
    } else {
        return None;
    };

    let authority = rest.split(['/', '?']).next()?;
    let (host, port) = match authority.rsplit_once(':') {
        Some((h, p)) => (h, p.parse().ok()?),
        None => (authority, if is_https { 443 } else { 80 }),
    };
    if host.is_empty() {
        return None;
    }
    Some((host.to_string(), port, is_https))
}
