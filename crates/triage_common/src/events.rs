//! Events broadcast to every viewer attached to a session.
//!
//! Each event carries the full current step or viewer snapshot, so a
//! viewer can re-render without a separate fetch.

use crate::action::ActionStep;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// A step changed state (gated, approved, running, blocked, ...).
    ActionUpdate { step: ActionStep },
    ActionComplete { step: ActionStep },
    ActionFailed { step: ActionStep, reason: String },
    /// A step is waiting for a human decision.
    ApprovalRequired { step: ActionStep },
    EmergencyStopped { stopped_by: String, reason: String },
    ViewerConnected {
        viewer: String,
        viewers: Vec<String>,
    },
    ViewerDisconnected {
        viewer: String,
        viewers: Vec<String>,
    },
}
