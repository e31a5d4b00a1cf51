//! HTTP server for triaged

use crate::broadcast::Broadcaster;
use crate::config::DaemonConfig;
use crate::evidence_log::EvidenceLog;
use crate::executor;
use crate::ingress::Ingress;
use crate::routes;
use crate::session::{ExecRequest, SessionManager};
use anyhow::Result;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use triage_common::{SafetyGate, TriageError};

/// Application state shared across handlers
pub struct AppState {
    pub config: DaemonConfig,
    pub sessions: Arc<RwLock<SessionManager>>,
    pub evidence: Arc<RwLock<EvidenceLog>>,
    pub ingress: Ingress,
    pub broadcaster: Arc<RwLock<Broadcaster>>,
    pub gate: Arc<SafetyGate>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(config: DaemonConfig) -> Self {
        let gate = Arc::new(SafetyGate::new(config.policy.clone()));
        let sessions = Arc::new(RwLock::new(SessionManager::new(
            config.session_duration_hours,
        )));
        let evidence = Arc::new(RwLock::new(EvidenceLog::new(config.evidence_log_capacity)));
        let ingress = Ingress::new(&config);
        Self {
            config,
            sessions,
            evidence,
            ingress,
            broadcaster: Arc::new(RwLock::new(Broadcaster::new())),
            gate,
            start_time: Instant::now(),
        }
    }
}

/// Run the HTTP server plus the background session sweeper.
pub async fn run(state: AppState) -> Result<()> {
    let addr = state.config.listen_addr.clone();
    let state = Arc::new(state);

    let app = axum::Router::new()
        .merge(routes::agent_routes())
        .merge(routes::evidence_routes())
        .merge(routes::status_routes())
        .merge(routes::plan_routes())
        .merge(routes::session_routes())
        .with_state(state.clone())
        .layer(TraceLayer::new_for_http());

    tokio::spawn(sweep_loop(state));

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("  Listening on http://{}", addr);

    axum::serve(listener, app).await?;
    Ok(())
}

/// Periodically drop expired sessions and their event channels.
async fn sweep_loop(state: Arc<AppState>) {
    let mut interval = tokio::time::interval(Duration::from_secs(600));
    loop {
        interval.tick().await;
        let swept = state.sessions.write().await.sweep_expired();
        if swept > 0 {
            info!("Swept {} expired sessions", swept);
        }
    }
}

/// Run one approved or auto-execute step end to end: mark it running,
/// execute with timeout, then complete or fail it, attempting a single
/// rollback on failure. All state changes and events flow through the
/// session manager.
pub async fn drive_step(state: Arc<AppState>, request: ExecRequest) {
    let (step, events) = {
        let mut sessions = state.sessions.write().await;
        match sessions.begin_step(&request.session_id, &request.step_id) {
            Ok(pair) => pair,
            Err(e) => {
                warn!("Cannot start step {}: {}", request.step_id, e);
                return;
            }
        }
    };
    state
        .broadcaster
        .write()
        .await
        .publish(&request.session_id, &events);
    // None: the stop flag or a concurrent start won the race.
    if step.is_none() {
        return;
    }

    let result = executor::run_command(
        &request.command,
        state.config.step_timeout_secs,
        state.config.max_output_bytes,
    )
    .await;

    let (failed, events) = {
        let mut sessions = state.sessions.write().await;
        match result {
            Ok(outcome) if outcome.success() => {
                info!(
                    "Step {} completed in {}ms",
                    request.step_id, outcome.duration_ms
                );
                match sessions.complete_step(&request.session_id, &request.step_id, outcome.output)
                {
                    Ok(events) => (false, events),
                    Err(e) => {
                        warn!("Cannot complete step {}: {}", request.step_id, e);
                        return;
                    }
                }
            }
            Ok(outcome) => {
                let reason = format!("exit code {:?}", outcome.exit_code);
                fail(
                    &mut sessions,
                    &request,
                    reason,
                    Some(outcome.output),
                )
            }
            Err(TriageError::ExecutionTimeout(secs)) => {
                let reason = format!("timed out after {}s", secs);
                fail(&mut sessions, &request, reason, None)
            }
            Err(e) => fail(&mut sessions, &request, e.to_string(), None),
        }
    };
    state
        .broadcaster
        .write()
        .await
        .publish(&request.session_id, &events);

    if failed {
        drive_rollback(state, &request).await;
    }
}

fn fail(
    sessions: &mut SessionManager,
    request: &ExecRequest,
    reason: String,
    output: Option<String>,
) -> (bool, Vec<triage_common::SessionEvent>) {
    error!("Step {} failed: {}", request.step_id, reason);
    match sessions.fail_step(&request.session_id, &request.step_id, reason, output) {
        Ok((has_rollback, events)) => (has_rollback, events),
        Err(e) => {
            warn!("Cannot fail step {}: {}", request.step_id, e);
            (false, Vec::new())
        }
    }
}

/// One rollback attempt for a failed step. The rollback itself is never
/// retried or rolled back.
async fn drive_rollback(state: Arc<AppState>, request: &ExecRequest) {
    let (command, events) = {
        let mut sessions = state.sessions.write().await;
        match sessions.begin_rollback(&request.session_id, &request.step_id) {
            Ok(pair) => pair,
            Err(e) => {
                warn!("Cannot start rollback for {}: {}", request.step_id, e);
                return;
            }
        }
    };
    state
        .broadcaster
        .write()
        .await
        .publish(&request.session_id, &events);
    let Some(command) = command else {
        return;
    };

    info!("Rolling back step {}: {}", request.step_id, command);
    let result = executor::run_command(
        &command,
        state.config.step_timeout_secs,
        state.config.max_output_bytes,
    )
    .await;
    let (succeeded, detail) = match result {
        Ok(outcome) if outcome.success() => (true, outcome.output),
        Ok(outcome) => (false, format!("rollback exit code {:?}", outcome.exit_code)),
        Err(e) => (false, format!("rollback failed: {}", e)),
    };

    let events = {
        let mut sessions = state.sessions.write().await;
        match sessions.finish_rollback(&request.session_id, &request.step_id, succeeded, detail) {
            Ok(events) => events,
            Err(e) => {
                warn!("Cannot finish rollback for {}: {}", request.step_id, e);
                return;
            }
        }
    };
    state
        .broadcaster
        .write()
        .await
        .publish(&request.session_id, &events);
}

/// Run the auto-approved steps of a fresh plan in order, stopping at
/// the first step that does not complete.
pub async fn drive_auto(state: Arc<AppState>, requests: Vec<ExecRequest>) {
    for request in requests {
        let session_id = request.session_id.clone();
        let step_id = request.step_id.clone();
        drive_step(state.clone(), request).await;

        let completed = {
            let sessions = state.sessions.read().await;
            sessions
                .step_status(&session_id, &step_id)
                .map(|s| s == triage_common::ActionStatus::Completed)
                .unwrap_or(false)
        };
        if !completed {
            warn!(
                "Halting auto-execution for session {} at step {}",
                session_id, step_id
            );
            break;
        }
    }
}
