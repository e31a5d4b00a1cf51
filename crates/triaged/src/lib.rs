//! triaged - incident triage control plane
//!
//! Receives evidence from triage agents, holds the bounded evidence
//! log, gates proposed recovery plans through the safety policy, and
//! runs approved steps with timeout and rollback while streaming
//! progress to connected viewers.

pub mod broadcast;
pub mod config;
pub mod evidence_log;
pub mod executor;
pub mod ingress;
pub mod routes;
pub mod server;
pub mod session;
