//! Shared types for the triage control plane and its probe agents.
//!
//! The evidence side (records, classifier) and the recovery side
//! (actions, policy, session events) both live here so the daemon and
//! the agent binaries agree on every wire shape.

pub mod action;
pub mod classify;
pub mod error;
pub mod events;
pub mod evidence;
pub mod policy;
pub mod protocol;

pub use action::{ActionStatus, ActionStep, ProposedStep, RiskTier};
pub use classify::{Classifier, RawObservation, Thresholds};
pub use error::{Result, TriageError};
pub use events::SessionEvent;
pub use evidence::{EvidenceKind, EvidenceRecord, Payload, Severity};
pub use policy::{GateDecision, SafetyGate, SafetyPolicy};
