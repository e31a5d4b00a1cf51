//! Safety policy and the gate decision.
//!
//! The gate converts a proposed action into auto-execute,
//! approval-required, or blocked. The blocklist check runs first and is
//! non-bypassable: no configuration can make a blocklisted command
//! auto-execute.

use crate::action::{ActionStep, RiskTier};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Destructive-operation signatures. Checked case-insensitively against
/// the raw command string before any other rule.
const DESTRUCTIVE_SIGNATURES: &[&str] = &[
    // Filesystem / disk destruction
    r"\brm\s+-rf?\s+/",
    r"\bmkfs\b",
    r"\bdd\s+if=",
    r"\bcryptsetup\s+luksFormat\b",
    // System lockout
    r"\brm\b.*\b(passwd|shadow|sudoers)\b",
    r"\bchmod\s+777\s+/etc",
    r"\bpasswd\s+root\b",
    r"\biptables\s+-F\b",
    r"\bsystemctl\s+(stop|disable)\b.*\bsshd?\b",
    // Availability
    r"\bshutdown\b",
    r"\breboot\b",
    r"\bhalt\b",
    r"\bpoweroff\b",
    r"\binit\s+[06]\b",
    // Database destruction
    r"\bDROP\s+DATABASE\b",
    r"\bDROP\s+TABLE\b",
    r"\bTRUNCATE\s+TABLE\b",
    r"\bDELETE\s+FROM\s+\w+\s*(;|$)",
];

/// Policy knobs for the safety gate. Loaded from the daemon config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyPolicy {
    /// Steps at or below this tier may run without a human, unless the
    /// planner flagged them for approval.
    #[serde(default = "default_max_auto_level")]
    pub max_auto_level: RiskTier,

    /// Steps above this tier always need approval, regardless of other
    /// settings.
    #[serde(default = "default_require_approval_above")]
    pub require_approval_above: RiskTier,

    /// Exact command strings (or leading words) to block, in addition
    /// to the built-in signatures.
    #[serde(default)]
    pub blocked_commands: Vec<String>,

    /// Extra blocklist regex patterns from config.
    #[serde(default)]
    pub blocked_patterns: Vec<String>,
}

fn default_max_auto_level() -> RiskTier {
    RiskTier::Low
}

fn default_require_approval_above() -> RiskTier {
    RiskTier::Low
}

impl Default for SafetyPolicy {
    fn default() -> Self {
        Self {
            max_auto_level: default_max_auto_level(),
            require_approval_above: default_require_approval_above(),
            blocked_commands: Vec::new(),
            blocked_patterns: Vec::new(),
        }
    }
}

/// Outcome of gating one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "decision")]
pub enum GateDecision {
    AutoExecute,
    NeedsApproval,
    Blocked { reason: String },
}

/// Compiled gate: the policy plus its blocklist regexes.
pub struct SafetyGate {
    policy: SafetyPolicy,
    patterns: Vec<Regex>,
}

impl SafetyGate {
    /// Compile the built-in signatures plus any configured extras.
    /// Invalid configured patterns are skipped with a warning rather
    /// than weakening the built-in set.
    pub fn new(policy: SafetyPolicy) -> Self {
        let mut patterns = Vec::new();
        for pattern in DESTRUCTIVE_SIGNATURES
            .iter()
            .copied()
            .chain(policy.blocked_patterns.iter().map(String::as_str))
        {
            match RegexBuilder::new(pattern).case_insensitive(true).build() {
                Ok(re) => patterns.push(re),
                Err(e) => warn!("Skipping invalid blocklist pattern {:?}: {}", pattern, e),
            }
        }
        Self { policy, patterns }
    }

    pub fn policy(&self) -> &SafetyPolicy {
        &self.policy
    }

    /// Gate one step. Decision order is fixed: blocklist first (exact
    /// entries, then signatures), then the approval threshold, then the
    /// auto-execute ceiling.
    pub fn gate(&self, step: &ActionStep) -> GateDecision {
        let command = step.command.trim();

        if self.is_exact_blocked(command) {
            return GateDecision::Blocked {
                reason: "Command is in the configured blocklist".to_string(),
            };
        }
        for re in &self.patterns {
            if re.is_match(command) {
                return GateDecision::Blocked {
                    reason: format!("Command matches destructive signature {:?}", re.as_str()),
                };
            }
        }

        if step.risk_tier > self.policy.require_approval_above {
            return GateDecision::NeedsApproval;
        }
        if step.risk_tier <= self.policy.max_auto_level && !step.requires_approval {
            return GateDecision::AutoExecute;
        }
        GateDecision::NeedsApproval
    }

    fn is_exact_blocked(&self, command: &str) -> bool {
        let first_word = command.split_whitespace().next().unwrap_or("");
        self.policy
            .blocked_commands
            .iter()
            .any(|blocked| blocked == command || blocked == first_word)
    }
}
