//! End-to-end session flows through the real executor, without HTTP.

use std::sync::Arc;
use triage_common::{ActionStatus, ProposedStep, RiskTier, SessionEvent};
use triaged::config::DaemonConfig;
use triaged::server::{self, AppState};

fn state_with(step_timeout_secs: u64) -> Arc<AppState> {
    let mut config = DaemonConfig::default();
    config.step_timeout_secs = step_timeout_secs;
    Arc::new(AppState::new(config))
}

fn step(description: &str, command: &str, rollback: Option<&str>) -> ProposedStep {
    ProposedStep {
        description: description.to_string(),
        command: command.to_string(),
        risk: RiskTier::Safe,
        rollback_command: rollback.map(String::from),
    }
}

async fn status_of(state: &Arc<AppState>, session_id: &str, step_id: &str) -> ActionStatus {
    state
        .sessions
        .read()
        .await
        .step_status(session_id, step_id)
        .unwrap()
}

#[tokio::test]
async fn auto_step_runs_to_completion_and_broadcasts() {
    let state = state_with(10);
    let (session_id, token, events, auto) = state
        .sessions
        .write()
        .await
        .create_session("web", vec![step("echo", "echo done", None)], &state.gate)
        .unwrap();
    state
        .broadcaster
        .write()
        .await
        .publish(&session_id, &events);
    let mut rx = state.broadcaster.write().await.subscribe(&session_id);

    server::drive_auto(state.clone(), auto).await;

    let snapshot = state
        .sessions
        .read()
        .await
        .snapshot(&session_id, &token)
        .unwrap();
    assert_eq!(snapshot.plan[0].status, ActionStatus::Completed);
    assert_eq!(snapshot.plan[0].output.as_deref().map(str::trim), Some("done"));

    // running -> completed, in order.
    let mut saw_running = false;
    let mut saw_complete = false;
    while let Ok(event) = rx.try_recv() {
        match event {
            SessionEvent::ActionUpdate { step } if step.status == ActionStatus::Running => {
                assert!(!saw_complete);
                saw_running = true;
            }
            SessionEvent::ActionComplete { .. } => saw_complete = true,
            _ => {}
        }
    }
    assert!(saw_running && saw_complete);
}

#[tokio::test]
async fn failed_step_rolls_back_once() {
    let state = state_with(10);
    let (session_id, token, _, auto) = state
        .sessions
        .write()
        .await
        .create_session(
            "db",
            vec![step("breaks", "exit 7", Some("echo undone"))],
            &state.gate,
        )
        .unwrap();

    server::drive_auto(state.clone(), auto).await;

    let snapshot = state
        .sessions
        .read()
        .await
        .snapshot(&session_id, &token)
        .unwrap();
    assert_eq!(snapshot.plan[0].status, ActionStatus::RolledBack);
    assert!(snapshot.plan[0].error.as_deref().unwrap().contains("7"));
}

#[tokio::test]
async fn timeout_kills_step_then_rolls_back() {
    let state = state_with(1);
    let (session_id, token, _, auto) = state
        .sessions
        .write()
        .await
        .create_session(
            "db",
            vec![step("hangs", "sleep 30", Some("echo undone"))],
            &state.gate,
        )
        .unwrap();

    server::drive_auto(state.clone(), auto).await;

    let snapshot = state
        .sessions
        .read()
        .await
        .snapshot(&session_id, &token)
        .unwrap();
    assert_eq!(snapshot.plan[0].status, ActionStatus::RolledBack);
    assert!(snapshot.plan[0]
        .error
        .as_deref()
        .unwrap()
        .contains("timed out"));
}

#[tokio::test]
async fn failed_step_without_rollback_stays_failed() {
    let state = state_with(10);
    let (session_id, token, _, auto) = state
        .sessions
        .write()
        .await
        .create_session("db", vec![step("breaks", "exit 1", None)], &state.gate)
        .unwrap();

    server::drive_auto(state.clone(), auto).await;

    let snapshot = state
        .sessions
        .read()
        .await
        .snapshot(&session_id, &token)
        .unwrap();
    assert_eq!(snapshot.plan[0].status, ActionStatus::Failed);
}

#[tokio::test]
async fn auto_execution_halts_at_first_failure() {
    let state = state_with(10);
    let (session_id, token, _, auto) = state
        .sessions
        .write()
        .await
        .create_session(
            "web",
            vec![
                step("first", "exit 1", None),
                step("second", "echo never", None),
            ],
            &state.gate,
        )
        .unwrap();
    assert_eq!(auto.len(), 2);

    server::drive_auto(state.clone(), auto).await;

    let snapshot = state
        .sessions
        .read()
        .await
        .snapshot(&session_id, &token)
        .unwrap();
    assert_eq!(snapshot.plan[0].status, ActionStatus::Failed);
    // Untouched: still waiting in auto_execute, never started.
    assert_eq!(snapshot.plan[1].status, ActionStatus::AutoExecute);
}

#[tokio::test]
async fn double_approve_executes_once() {
    let state = state_with(10);
    let (session_id, token, _, _) = state
        .sessions
        .write()
        .await
        .create_session(
            "db",
            vec![ProposedStep {
                description: "restart".to_string(),
                command: "echo restarted".to_string(),
                risk: RiskTier::High,
                rollback_command: None,
            }],
            &state.gate,
        )
        .unwrap();
    let step_id = state
        .sessions
        .read()
        .await
        .snapshot(&session_id, &token)
        .unwrap()
        .plan[0]
        .step_id
        .clone();

    let (first, second) = {
        let mut sessions = state.sessions.write().await;
        let (_, first, _) = sessions.approve(&session_id, &token, &step_id, "alice").unwrap();
        let (_, second, _) = sessions.approve(&session_id, &token, &step_id, "bob").unwrap();
        (first, second)
    };
    assert!(first.is_some());
    assert!(second.is_none(), "second approval must not execute again");

    server::drive_step(state.clone(), first.unwrap()).await;
    assert_eq!(
        status_of(&state, &session_id, &step_id).await,
        ActionStatus::Completed
    );
}

#[tokio::test]
async fn emergency_stop_prevents_pending_execution() {
    let state = state_with(10);
    let (session_id, token, _, _) = state
        .sessions
        .write()
        .await
        .create_session(
            "db",
            vec![ProposedStep {
                description: "restart".to_string(),
                command: "echo restarted".to_string(),
                risk: RiskTier::High,
                rollback_command: None,
            }],
            &state.gate,
        )
        .unwrap();
    let step_id = state
        .sessions
        .read()
        .await
        .snapshot(&session_id, &token)
        .unwrap()
        .plan[0]
        .step_id
        .clone();

    let request = {
        let mut sessions = state.sessions.write().await;
        let (_, request, _) = sessions.approve(&session_id, &token, &step_id, "alice").unwrap();
        sessions
            .emergency_stop(&session_id, &token, "bob", "wrong host")
            .unwrap();
        request.unwrap()
    };

    // The driver re-checks the stop flag and refuses to run.
    server::drive_step(state.clone(), request).await;
    assert_eq!(
        status_of(&state, &session_id, &step_id).await,
        ActionStatus::Blocked
    );
}
