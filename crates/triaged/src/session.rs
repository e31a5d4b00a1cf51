//! Recovery sessions and the per-step state machine.
//!
//! The session manager is the single authoritative owner of every plan
//! and viewer set; nothing mutates a step except through its transition
//! functions. Each transition is a pure `(state, event) -> state'`
//! decision plus a list of events for the broadcaster, so races reduce
//! to lock ordering: whoever takes the write lock first wins, and the
//! loser sees an idempotent no-op.

use chrono::{DateTime, Duration, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use tracing::{error, info, warn};
use triage_common::protocol::SessionSnapshot;
use triage_common::{
    ActionStatus, ActionStep, GateDecision, ProposedStep, SafetyGate, SessionEvent, TriageError,
};
use uuid::Uuid;

/// Events driving one step's state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum StepEvent {
    Gated(GateDecision),
    Approve,
    Reject,
    Start,
    Complete,
    Fail,
    StartRollback,
    RollbackSucceeded,
    RollbackFailed,
    /// Emergency stop or policy violation.
    Block,
}

/// The legal transition table. Returns `None` for anything else; states
/// only advance forward and terminal states admit nothing.
pub fn next_status(current: ActionStatus, event: &StepEvent) -> Option<ActionStatus> {
    use ActionStatus::*;
    match (current, event) {
        (Proposed, StepEvent::Gated(GateDecision::AutoExecute)) => Some(AutoExecute),
        (Proposed, StepEvent::Gated(GateDecision::NeedsApproval)) => Some(PendingApproval),
        (Proposed, StepEvent::Gated(GateDecision::Blocked { .. })) => Some(Blocked),
        (PendingApproval, StepEvent::Approve) => Some(Approved),
        (PendingApproval, StepEvent::Reject) => Some(Rejected),
        (AutoExecute | Approved, StepEvent::Start) => Some(Running),
        (Running, StepEvent::Complete) => Some(Completed),
        (Running, StepEvent::Fail) => Some(Failed),
        (Failed, StepEvent::StartRollback) => Some(RollingBack),
        (RollingBack, StepEvent::RollbackSucceeded) => Some(RolledBack),
        (RollingBack, StepEvent::RollbackFailed) => Some(RollbackFailed),
        // A running step is allowed to finish; everything else halts.
        (current, StepEvent::Block) if !current.is_terminal() && current != Running => {
            Some(Blocked)
        }
        _ => None,
    }
}

/// Aggregate counters for the daemon status surface.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SessionStats {
    pub sessions: usize,
    pub stopped: usize,
    pub viewers: usize,
}

/// Request to actually run a step, handed to the executor driver.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub session_id: String,
    pub step_id: String,
    pub command: String,
    pub rollback_command: Option<String>,
}

/// The scoped lifetime of one incident's recovery plan and viewers.
pub struct Session {
    pub session_id: String,
    pub token: String,
    pub service_name: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub plan: Vec<ActionStep>,
    pub viewers: HashSet<String>,
    /// Monotonic: once true, never reset within the session.
    pub emergency_stopped: bool,
    pub stopped_by: Option<String>,
    pub stopped_reason: Option<String>,
}

impl Session {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    fn step_mut(&mut self, step_id: &str) -> Result<&mut ActionStep, TriageError> {
        self.plan
            .iter_mut()
            .find(|s| s.step_id == step_id)
            .ok_or_else(|| TriageError::UnknownStep(step_id.to_string()))
    }

    fn roster(&self) -> Vec<String> {
        let mut viewers: Vec<String> = self.viewers.iter().cloned().collect();
        viewers.sort();
        viewers
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.session_id.clone(),
            service_name: self.service_name.clone(),
            created_at: self.created_at,
            expires_at: self.expires_at,
            plan: self.plan.clone(),
            viewers: self.roster(),
            emergency_stopped: self.emergency_stopped,
            stopped_by: self.stopped_by.clone(),
            stopped_reason: self.stopped_reason.clone(),
        }
    }
}

fn check_session(session: &Session, token: &str) -> Result<(), TriageError> {
    if session.token != token {
        return Err(TriageError::Auth(format!(
            "bad token for session {}",
            session.session_id
        )));
    }
    if session.is_expired(Utc::now()) {
        return Err(TriageError::StaleSession(session.session_id.clone()));
    }
    Ok(())
}

pub struct SessionManager {
    sessions: HashMap<String, Session>,
    session_duration: Duration,
}

impl SessionManager {
    pub fn new(session_duration_hours: i64) -> Self {
        Self {
            sessions: HashMap::new(),
            session_duration: Duration::hours(session_duration_hours.max(1)),
        }
    }

    /// Gate a planner proposal into a new session. Returns the session
    /// id/token, the events to broadcast, and the auto-executable steps
    /// in plan order.
    pub fn create_session(
        &mut self,
        service_name: &str,
        proposal: Vec<ProposedStep>,
        gate: &SafetyGate,
    ) -> Result<(String, String, Vec<SessionEvent>, Vec<ExecRequest>), TriageError> {
        if proposal.is_empty() {
            return Err(TriageError::Validation("empty plan".to_string()));
        }

        let session_id = Uuid::new_v4().to_string();
        let token: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(32)
            .map(char::from)
            .collect();
        let now = Utc::now();

        let mut plan = Vec::with_capacity(proposal.len());
        let mut events = Vec::new();
        let mut auto = Vec::new();

        for proposed in proposal {
            let mut step = ActionStep::new(&proposed.description, &proposed.command, proposed.risk);
            if let Some(rollback) = &proposed.rollback_command {
                step = step.with_rollback(rollback);
            }

            let decision = gate.gate(&step);
            step.requires_approval = matches!(decision, GateDecision::NeedsApproval);
            if let GateDecision::Blocked { reason } = &decision {
                warn!(
                    "Step {:?} blocked by policy: {}",
                    step.description, reason
                );
                step.error = Some(reason.clone());
            }
            // Gating a freshly proposed step cannot fail.
            step.status = next_status(step.status, &StepEvent::Gated(decision.clone()))
                .unwrap_or(ActionStatus::Blocked);

            match step.status {
                ActionStatus::AutoExecute => auto.push(ExecRequest {
                    session_id: session_id.clone(),
                    step_id: step.step_id.clone(),
                    command: step.command.clone(),
                    rollback_command: step.rollback_command.clone(),
                }),
                ActionStatus::PendingApproval => {
                    events.push(SessionEvent::ApprovalRequired { step: step.clone() })
                }
                _ => {}
            }
            events.push(SessionEvent::ActionUpdate { step: step.clone() });
            plan.push(step);
        }

        let session = Session {
            session_id: session_id.clone(),
            token: token.clone(),
            service_name: service_name.to_string(),
            created_at: now,
            expires_at: now + self.session_duration,
            plan,
            viewers: HashSet::new(),
            emergency_stopped: false,
            stopped_by: None,
            stopped_reason: None,
        };

        info!(
            "Created session {} for {} ({} steps, {} auto)",
            session_id,
            service_name,
            session.plan.len(),
            auto.len()
        );
        self.sessions.insert(session_id.clone(), session);
        Ok((session_id, token, events, auto))
    }

    /// Token check used by every session API call.
    pub fn authorize(&self, session_id: &str, token: &str) -> Result<&Session, TriageError> {
        let session = self
            .sessions
            .get(session_id)
            .ok_or_else(|| TriageError::UnknownSession(session_id.to_string()))?;
        check_session(session, token)?;
        Ok(session)
    }

    fn authorize_mut(
        &mut self,
        session_id: &str,
        token: &str,
    ) -> Result<&mut Session, TriageError> {
        let session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| TriageError::UnknownSession(session_id.to_string()))?;
        check_session(session, token)?;
        Ok(session)
    }

    /// Approve a pending step. Idempotent: approving a step that is
    /// already approved, running, or completed returns its current
    /// state without a second execution.
    pub fn approve(
        &mut self,
        session_id: &str,
        token: &str,
        step_id: &str,
        viewer: &str,
    ) -> Result<(ActionStep, Option<ExecRequest>, Vec<SessionEvent>), TriageError> {
        let session = self.authorize_mut(session_id, token)?;

        if session.emergency_stopped {
            return Err(TriageError::PolicyViolation(format!(
                "session {} is emergency stopped",
                session_id
            )));
        }

        let step = session.step_mut(step_id)?;
        match next_status(step.status, &StepEvent::Approve) {
            Some(next) => {
                step.status = next;
                step.approved_by = Some(viewer.to_string());
                info!("Step {} approved by {}", step_id, viewer);
                let request = ExecRequest {
                    session_id: session_id.to_string(),
                    step_id: step_id.to_string(),
                    command: step.command.clone(),
                    rollback_command: step.rollback_command.clone(),
                };
                let events = vec![SessionEvent::ActionUpdate { step: step.clone() }];
                Ok((step.clone(), Some(request), events))
            }
            None if matches!(
                step.status,
                ActionStatus::Approved | ActionStatus::Running | ActionStatus::Completed
            ) =>
            {
                // Concurrent admin clicks: no-op, current state back.
                Ok((step.clone(), None, Vec::new()))
            }
            None => Err(TriageError::Validation(format!(
                "step {} is {} and cannot be approved",
                step_id, step.status
            ))),
        }
    }

    /// Reject a pending step. Terminal for that step; idempotent for a
    /// step already rejected.
    pub fn reject(
        &mut self,
        session_id: &str,
        token: &str,
        step_id: &str,
        viewer: &str,
        reason: &str,
    ) -> Result<(ActionStep, Vec<SessionEvent>), TriageError> {
        let session = self.authorize_mut(session_id, token)?;

        if session.emergency_stopped {
            return Err(TriageError::PolicyViolation(format!(
                "session {} is emergency stopped",
                session_id
            )));
        }

        let step = session.step_mut(step_id)?;
        match next_status(step.status, &StepEvent::Reject) {
            Some(next) => {
                step.status = next;
                step.error = Some(format!("Rejected by {}: {}", viewer, reason));
                step.completed_at = Some(Utc::now());
                warn!("Step {} rejected by {}: {}", step_id, viewer, reason);
                let events = vec![SessionEvent::ActionUpdate { step: step.clone() }];
                Ok((step.clone(), events))
            }
            None if step.status == ActionStatus::Rejected => Ok((step.clone(), Vec::new())),
            None => Err(TriageError::Validation(format!(
                "step {} is {} and cannot be rejected",
                step_id, step.status
            ))),
        }
    }

    /// Raise the session-wide emergency stop. Monotonic and
    /// unconditional: it wins any race with a concurrent approval, and
    /// raising it twice is a no-op.
    pub fn emergency_stop(
        &mut self,
        session_id: &str,
        token: &str,
        viewer: &str,
        reason: &str,
    ) -> Result<Vec<SessionEvent>, TriageError> {
        let session = self.authorize_mut(session_id, token)?;

        if session.emergency_stopped {
            return Ok(Vec::new());
        }
        session.emergency_stopped = true;
        session.stopped_by = Some(viewer.to_string());
        session.stopped_reason = Some(reason.to_string());
        error!(
            "EMERGENCY STOP on session {} by {}: {}",
            session_id, viewer, reason
        );

        let mut events = vec![SessionEvent::EmergencyStopped {
            stopped_by: viewer.to_string(),
            reason: reason.to_string(),
        }];
        for step in &mut session.plan {
            if let Some(next) = next_status(step.status, &StepEvent::Block) {
                step.status = next;
                step.error = Some(format!("Emergency stop: {}", reason));
                step.completed_at = Some(Utc::now());
                events.push(SessionEvent::ActionUpdate { step: step.clone() });
            }
        }
        Ok(events)
    }

    /// Move an approved or auto-execute step to running, re-checking
    /// the stop flag last. Returns `None` when the stop won the race;
    /// the executor must not run the command in that case.
    pub fn begin_step(
        &mut self,
        session_id: &str,
        step_id: &str,
    ) -> Result<(Option<ActionStep>, Vec<SessionEvent>), TriageError> {
        let session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| TriageError::UnknownSession(session_id.to_string()))?;

        if session.emergency_stopped {
            let step = session.step_mut(step_id)?;
            let mut events = Vec::new();
            if let Some(next) = next_status(step.status, &StepEvent::Block) {
                step.status = next;
                step.error = Some("Emergency stop".to_string());
                events.push(SessionEvent::ActionUpdate { step: step.clone() });
            }
            return Ok((None, events));
        }

        let step = session.step_mut(step_id)?;
        match next_status(step.status, &StepEvent::Start) {
            Some(next) => {
                step.status = next;
                step.started_at = Some(Utc::now());
                let events = vec![SessionEvent::ActionUpdate { step: step.clone() }];
                Ok((Some(step.clone()), events))
            }
            None => Ok((None, Vec::new())),
        }
    }

    pub fn complete_step(
        &mut self,
        session_id: &str,
        step_id: &str,
        output: String,
    ) -> Result<Vec<SessionEvent>, TriageError> {
        self.finish(session_id, step_id, StepEvent::Complete, Some(output), None)
    }

    /// Mark a running step failed. Returns the events plus whether a
    /// rollback is declared for it.
    pub fn fail_step(
        &mut self,
        session_id: &str,
        step_id: &str,
        reason: String,
        output: Option<String>,
    ) -> Result<(bool, Vec<SessionEvent>), TriageError> {
        let events = self.finish(session_id, step_id, StepEvent::Fail, output, Some(reason))?;
        let has_rollback = self
            .sessions
            .get(session_id)
            .and_then(|s| s.plan.iter().find(|st| st.step_id == step_id))
            .map(|s| s.rollback_command.is_some())
            .unwrap_or(false);
        Ok((has_rollback, events))
    }

    /// Start the single rollback attempt for a failed step. The stop
    /// flag is not consulted here: a step that was already running when
    /// the stop fired may still fail, and its declared rollback still
    /// runs rather than leaving the action half-applied.
    pub fn begin_rollback(
        &mut self,
        session_id: &str,
        step_id: &str,
    ) -> Result<(Option<String>, Vec<SessionEvent>), TriageError> {
        let session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| TriageError::UnknownSession(session_id.to_string()))?;
        let step = session.step_mut(step_id)?;
        match next_status(step.status, &StepEvent::StartRollback) {
            Some(next) if step.rollback_command.is_some() => {
                step.status = next;
                let events = vec![SessionEvent::ActionUpdate { step: step.clone() }];
                Ok((step.rollback_command.clone(), events))
            }
            _ => Ok((None, Vec::new())),
        }
    }

    pub fn finish_rollback(
        &mut self,
        session_id: &str,
        step_id: &str,
        succeeded: bool,
        detail: String,
    ) -> Result<Vec<SessionEvent>, TriageError> {
        let event = if succeeded {
            StepEvent::RollbackSucceeded
        } else {
            StepEvent::RollbackFailed
        };
        self.finish(session_id, step_id, event, None, Some(detail))
    }

    fn finish(
        &mut self,
        session_id: &str,
        step_id: &str,
        event: StepEvent,
        output: Option<String>,
        reason: Option<String>,
    ) -> Result<Vec<SessionEvent>, TriageError> {
        let session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| TriageError::UnknownSession(session_id.to_string()))?;
        let step = session.step_mut(step_id)?;

        let next = match next_status(step.status, &event) {
            Some(next) => next,
            None => return Ok(Vec::new()),
        };
        step.status = next;
        step.completed_at = Some(Utc::now());
        if let Some(output) = output {
            step.output = Some(output);
        }
        if let Some(reason) = &reason {
            step.error = Some(reason.clone());
        }

        let events = match next {
            ActionStatus::Completed => vec![SessionEvent::ActionComplete { step: step.clone() }],
            ActionStatus::Failed | ActionStatus::RollbackFailed => {
                vec![SessionEvent::ActionFailed {
                    step: step.clone(),
                    reason: reason.unwrap_or_else(|| "execution failed".to_string()),
                }]
            }
            _ => vec![SessionEvent::ActionUpdate { step: step.clone() }],
        };
        Ok(events)
    }

    pub fn attach_viewer(
        &mut self,
        session_id: &str,
        token: &str,
        viewer: &str,
    ) -> Result<Vec<SessionEvent>, TriageError> {
        let session = self.authorize_mut(session_id, token)?;
        session.viewers.insert(viewer.to_string());
        info!("Viewer {} connected to session {}", viewer, session_id);
        Ok(vec![SessionEvent::ViewerConnected {
            viewer: viewer.to_string(),
            viewers: session.roster(),
        }])
    }

    /// Detach never fails: the socket is already gone.
    pub fn detach_viewer(&mut self, session_id: &str, viewer: &str) -> Vec<SessionEvent> {
        let Some(session) = self.sessions.get_mut(session_id) else {
            return Vec::new();
        };
        if !session.viewers.remove(viewer) {
            return Vec::new();
        }
        info!("Viewer {} disconnected from session {}", viewer, session_id);
        vec![SessionEvent::ViewerDisconnected {
            viewer: viewer.to_string(),
            viewers: session.roster(),
        }]
    }

    pub fn snapshot(&self, session_id: &str, token: &str) -> Result<SessionSnapshot, TriageError> {
        Ok(self.authorize(session_id, token)?.snapshot())
    }

    /// Append-only action list, in plan order.
    pub fn actions(&self, session_id: &str, token: &str) -> Result<Vec<ActionStep>, TriageError> {
        Ok(self.authorize(session_id, token)?.plan.clone())
    }

    pub fn close_session(&mut self, session_id: &str, token: &str) -> Result<(), TriageError> {
        self.authorize(session_id, token)?;
        self.sessions.remove(session_id);
        info!("Closed session {}", session_id);
        Ok(())
    }

    /// Remove expired sessions. A step already running is unaffected;
    /// its executor callbacks target a removed session and fall out as
    /// unknown-session, which is logged and dropped.
    pub fn sweep_expired(&mut self) -> usize {
        let now = Utc::now();
        let expired: Vec<String> = self
            .sessions
            .values()
            .filter(|s| s.is_expired(now))
            .map(|s| s.session_id.clone())
            .collect();
        for session_id in &expired {
            self.sessions.remove(session_id);
            info!("Expired session {}", session_id);
        }
        expired.len()
    }

    /// Current status of one step, without token auth. Used by the
    /// executor driver, which holds the execution request as proof of
    /// provenance.
    pub fn step_status(&self, session_id: &str, step_id: &str) -> Option<ActionStatus> {
        self.sessions
            .get(session_id)?
            .plan
            .iter()
            .find(|s| s.step_id == step_id)
            .map(|s| s.status)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            sessions: self.sessions.len(),
            stopped: self.sessions.values().filter(|s| s.emergency_stopped).count(),
            viewers: self.sessions.values().map(|s| s.viewers.len()).sum(),
        }
    }

    #[cfg(test)]
    pub(crate) fn session_mut(&mut self, session_id: &str) -> Option<&mut Session> {
        self.sessions.get_mut(session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use triage_common::{RiskTier, SafetyPolicy};

    fn gate() -> SafetyGate {
        SafetyGate::new(SafetyPolicy::default())
    }

    fn proposal() -> Vec<ProposedStep> {
        vec![
            ProposedStep {
                description: "check status".to_string(),
                command: "systemctl status nginx".to_string(),
                risk: RiskTier::Safe,
                rollback_command: None,
            },
            ProposedStep {
                description: "restart database".to_string(),
                command: "systemctl restart postgresql".to_string(),
                risk: RiskTier::High,
                rollback_command: Some("systemctl start postgresql".to_string()),
            },
        ]
    }

    fn manager_with_session() -> (SessionManager, String, String) {
        let mut manager = SessionManager::new(24);
        let (session_id, token, _, _) = manager
            .create_session("web-frontend", proposal(), &gate())
            .unwrap();
        (manager, session_id, token)
    }

    #[test]
    fn default_policy_gates_safe_auto_and_high_pending() {
        let mut manager = SessionManager::new(24);
        let (session_id, token, _, auto) = manager
            .create_session("web-frontend", proposal(), &gate())
            .unwrap();
        assert_eq!(auto.len(), 1);

        let snapshot = manager.snapshot(&session_id, &token).unwrap();
        assert_eq!(snapshot.plan[0].status, ActionStatus::AutoExecute);
        assert_eq!(snapshot.plan[1].status, ActionStatus::PendingApproval);
        assert!(snapshot.plan[1].requires_approval);
    }

    #[test]
    fn blocklisted_step_enters_blocked() {
        let mut manager = SessionManager::new(24);
        let steps = vec![ProposedStep {
            description: "wipe".to_string(),
            command: "rm -rf /var".to_string(),
            risk: RiskTier::Safe,
            rollback_command: None,
        }];
        let (session_id, token, events, auto) = manager
            .create_session("web-frontend", steps, &gate())
            .unwrap();
        assert!(auto.is_empty());
        let snapshot = manager.snapshot(&session_id, &token).unwrap();
        assert_eq!(snapshot.plan[0].status, ActionStatus::Blocked);
        assert!(snapshot.plan[0].error.is_some());
        // The forced block is visible as an event, never a silent drop.
        assert!(events
            .iter()
            .any(|e| matches!(e, SessionEvent::ActionUpdate { step } if step.status == ActionStatus::Blocked)));
    }

    #[test]
    fn approve_is_idempotent() {
        let (mut manager, session_id, token) = manager_with_session();
        let pending = manager.snapshot(&session_id, &token).unwrap().plan[1].clone();

        let (step, request, _) = manager
            .approve(&session_id, &token, &pending.step_id, "alice")
            .unwrap();
        assert_eq!(step.status, ActionStatus::Approved);
        assert!(request.is_some());

        // Second click: same state back, no second execution request.
        let (step, request, events) = manager
            .approve(&session_id, &token, &pending.step_id, "bob")
            .unwrap();
        assert_eq!(step.status, ActionStatus::Approved);
        assert_eq!(step.approved_by.as_deref(), Some("alice"));
        assert!(request.is_none());
        assert!(events.is_empty());
    }

    #[test]
    fn rejection_is_terminal() {
        let (mut manager, session_id, token) = manager_with_session();
        let pending = manager.snapshot(&session_id, &token).unwrap().plan[1].clone();

        manager
            .reject(&session_id, &token, &pending.step_id, "alice", "too risky")
            .unwrap();
        let err = manager
            .approve(&session_id, &token, &pending.step_id, "bob")
            .unwrap_err();
        assert!(matches!(err, TriageError::Validation(_)));
    }

    #[test]
    fn emergency_stop_blocks_all_future_approvals() {
        let (mut manager, session_id, token) = manager_with_session();
        let pending = manager.snapshot(&session_id, &token).unwrap().plan[1].clone();

        let events = manager
            .emergency_stop(&session_id, &token, "alice", "wrong host")
            .unwrap();
        assert!(matches!(events[0], SessionEvent::EmergencyStopped { .. }));

        let err = manager
            .approve(&session_id, &token, &pending.step_id, "bob")
            .unwrap_err();
        assert!(matches!(err, TriageError::PolicyViolation(_)));

        // Pending steps were forced to blocked.
        let snapshot = manager.snapshot(&session_id, &token).unwrap();
        assert_eq!(snapshot.plan[1].status, ActionStatus::Blocked);
        assert_eq!(snapshot.stopped_by.as_deref(), Some("alice"));
    }

    #[test]
    fn emergency_stop_is_idempotent_and_monotonic() {
        let (mut manager, session_id, token) = manager_with_session();
        manager
            .emergency_stop(&session_id, &token, "alice", "first")
            .unwrap();
        let events = manager
            .emergency_stop(&session_id, &token, "bob", "second")
            .unwrap();
        assert!(events.is_empty());
        let snapshot = manager.snapshot(&session_id, &token).unwrap();
        assert_eq!(snapshot.stopped_by.as_deref(), Some("alice"));
    }

    #[test]
    fn stop_wins_race_with_begin_step() {
        let (mut manager, session_id, token) = manager_with_session();
        let pending = manager.snapshot(&session_id, &token).unwrap().plan[1].clone();
        let (_, request, _) = manager
            .approve(&session_id, &token, &pending.step_id, "alice")
            .unwrap();
        let request = request.unwrap();

        manager
            .emergency_stop(&session_id, &token, "bob", "abort")
            .unwrap();

        // The executor driver re-checks before running.
        let (step, _) = manager
            .begin_step(&request.session_id, &request.step_id)
            .unwrap();
        assert!(step.is_none());
    }

    #[test]
    fn begin_step_starts_only_once() {
        let (mut manager, session_id, token) = manager_with_session();
        let pending = manager.snapshot(&session_id, &token).unwrap().plan[1].clone();
        manager
            .approve(&session_id, &token, &pending.step_id, "alice")
            .unwrap();

        let (first, _) = manager.begin_step(&session_id, &pending.step_id).unwrap();
        assert!(first.is_some());
        let (second, _) = manager.begin_step(&session_id, &pending.step_id).unwrap();
        assert!(second.is_none(), "a step must not start twice");
    }

    #[test]
    fn failed_step_with_rollback_walks_the_rollback_states() {
        let (mut manager, session_id, token) = manager_with_session();
        let pending = manager.snapshot(&session_id, &token).unwrap().plan[1].clone();
        manager
            .approve(&session_id, &token, &pending.step_id, "alice")
            .unwrap();
        manager.begin_step(&session_id, &pending.step_id).unwrap();

        let (has_rollback, events) = manager
            .fail_step(
                &session_id,
                &pending.step_id,
                "timeout after 300s".to_string(),
                None,
            )
            .unwrap();
        assert!(has_rollback);
        assert!(matches!(events[0], SessionEvent::ActionFailed { .. }));

        let (command, _) = manager.begin_rollback(&session_id, &pending.step_id).unwrap();
        assert_eq!(command.as_deref(), Some("systemctl start postgresql"));

        manager
            .finish_rollback(&session_id, &pending.step_id, true, "ok".to_string())
            .unwrap();
        let snapshot = manager.snapshot(&session_id, &token).unwrap();
        assert_eq!(snapshot.plan[1].status, ActionStatus::RolledBack);
    }

    #[test]
    fn running_step_failing_after_stop_still_rolls_back() {
        let (mut manager, session_id, token) = manager_with_session();
        let pending = manager.snapshot(&session_id, &token).unwrap().plan[1].clone();
        manager
            .approve(&session_id, &token, &pending.step_id, "alice")
            .unwrap();
        manager.begin_step(&session_id, &pending.step_id).unwrap();

        // Stop fires while the step is running; the run finishes on its
        // own and fails.
        manager
            .emergency_stop(&session_id, &token, "bob", "abort")
            .unwrap();
        let (has_rollback, _) = manager
            .fail_step(&session_id, &pending.step_id, "exit code 1".to_string(), None)
            .unwrap();
        assert!(has_rollback);

        let (command, _) = manager.begin_rollback(&session_id, &pending.step_id).unwrap();
        assert_eq!(command.as_deref(), Some("systemctl start postgresql"));
    }

    #[test]
    fn expired_session_rejects_operations() {
        let (mut manager, session_id, token) = manager_with_session();
        manager.session_mut(&session_id).unwrap().expires_at = Utc::now() - Duration::hours(1);

        let err = manager.snapshot(&session_id, &token).unwrap_err();
        assert!(matches!(err, TriageError::StaleSession(_)));

        assert_eq!(manager.sweep_expired(), 1);
        assert_eq!(manager.session_count(), 0);
    }

    #[test]
    fn bad_token_is_rejected() {
        let (manager, session_id, _) = manager_with_session();
        assert!(matches!(
            manager.snapshot(&session_id, "wrong-token"),
            Err(TriageError::Auth(_))
        ));
    }

    #[test]
    fn viewer_roster_events() {
        let (mut manager, session_id, token) = manager_with_session();
        let events = manager.attach_viewer(&session_id, &token, "alice").unwrap();
        assert!(matches!(
            &events[0],
            SessionEvent::ViewerConnected { viewer, viewers }
                if viewer == "alice" && viewers == &vec!["alice".to_string()]
        ));

        manager.attach_viewer(&session_id, &token, "bob").unwrap();
        let events = manager.detach_viewer(&session_id, "alice");
        assert!(matches!(
            &events[0],
            SessionEvent::ViewerDisconnected { viewers, .. }
                if viewers == &vec!["bob".to_string()]
        ));
    }

    #[test]
    fn transition_table_is_forward_only() {
        use ActionStatus::*;
        // No event leads anywhere from terminal states.
        for terminal in [Completed, Rejected, Blocked, RolledBack, RollbackFailed] {
            for event in [
                StepEvent::Approve,
                StepEvent::Reject,
                StepEvent::Start,
                StepEvent::Complete,
                StepEvent::Fail,
                StepEvent::StartRollback,
                StepEvent::Block,
            ] {
                assert_eq!(next_status(terminal, &event), None);
            }
        }
        // Running is not interrupted by a block; it finishes or fails.
        assert_eq!(next_status(Running, &StepEvent::Block), None);
        assert_eq!(next_status(Running, &StepEvent::Complete), Some(Completed));
    }
}
