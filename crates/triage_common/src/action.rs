//! Recovery action model: risk tiers, step state machine, and the plan
//! proposal shape handed over by the external planner.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Ordinal classification of how dangerous an action is to execute.
/// The derive order is the total order used by the safety monitor.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum RiskTier {
    /// Read-only, no risk.
    Safe,
    /// Minimal risk (restart a service).
    Low,
    /// Moderate risk (modify config).
    Medium,
    /// High risk (database operations).
    High,
    /// Destructive operations.
    Critical,
}

impl RiskTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskTier::Safe => "safe",
            RiskTier::Low => "low",
            RiskTier::Medium => "medium",
            RiskTier::High => "high",
            RiskTier::Critical => "critical",
        }
    }
}

impl fmt::Display for RiskTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle of one action step. Forward-only: a state is never
/// revisited; a retry is a brand-new step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    /// Just created from the plan, not yet gated.
    Proposed,
    /// Gated as safe to run without a human.
    AutoExecute,
    /// Waiting for a viewer to approve or reject.
    PendingApproval,
    Approved,
    Running,
    Completed,
    Failed,
    /// Terminal: a viewer rejected the step.
    Rejected,
    /// Terminal: emergency stop or policy violation.
    Blocked,
    RollingBack,
    RolledBack,
    RollbackFailed,
}

impl ActionStatus {
    /// Terminal states admit no further transition.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ActionStatus::Completed
                | ActionStatus::Rejected
                | ActionStatus::Blocked
                | ActionStatus::RolledBack
                | ActionStatus::RollbackFailed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionStatus::Proposed => "proposed",
            ActionStatus::AutoExecute => "auto_execute",
            ActionStatus::PendingApproval => "pending_approval",
            ActionStatus::Approved => "approved",
            ActionStatus::Running => "running",
            ActionStatus::Completed => "completed",
            ActionStatus::Failed => "failed",
            ActionStatus::Rejected => "rejected",
            ActionStatus::Blocked => "blocked",
            ActionStatus::RollingBack => "rolling_back",
            ActionStatus::RolledBack => "rolled_back",
            ActionStatus::RollbackFailed => "rollback_failed",
        }
    }
}

impl fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One step of a recovery plan. The command string is opaque: the core
/// never interprets its semantics, only its risk and blocklist
/// membership.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionStep {
    pub step_id: String,
    pub description: String,
    pub command: String,
    pub risk_tier: RiskTier,
    /// Derived from risk tier and policy at gating time.
    pub requires_approval: bool,
    pub rollback_command: Option<String>,
    pub status: ActionStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Combined captured output, bounded and oldest-truncated.
    pub output: Option<String>,
    /// Human-readable reason for a failed/blocked/rejected state.
    pub error: Option<String>,
    pub approved_by: Option<String>,
}

impl ActionStep {
    pub fn new(description: &str, command: &str, risk_tier: RiskTier) -> Self {
        Self {
            step_id: Uuid::new_v4().to_string(),
            description: description.to_string(),
            command: command.to_string(),
            risk_tier,
            requires_approval: false,
            rollback_command: None,
            status: ActionStatus::Proposed,
            started_at: None,
            completed_at: None,
            output: None,
            error: None,
            approved_by: None,
        }
    }

    pub fn with_rollback(mut self, rollback_command: &str) -> Self {
        self.rollback_command = Some(rollback_command.to_string());
        self
    }
}

/// One planner-proposed step before gating.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposedStep {
    pub description: String,
    pub command: String,
    pub risk: RiskTier,
    #[serde(default)]
    pub rollback_command: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn risk_tiers_are_totally_ordered() {
        assert!(RiskTier::Safe < RiskTier::Low);
        assert!(RiskTier::Low < RiskTier::Medium);
        assert!(RiskTier::Medium < RiskTier::High);
        assert!(RiskTier::High < RiskTier::Critical);
    }

    #[test]
    fn terminal_states() {
        assert!(ActionStatus::Completed.is_terminal());
        assert!(ActionStatus::Rejected.is_terminal());
        assert!(ActionStatus::Blocked.is_terminal());
        assert!(!ActionStatus::Running.is_terminal());
        assert!(!ActionStatus::Failed.is_terminal());
    }
}
