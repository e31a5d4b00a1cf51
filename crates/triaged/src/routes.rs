//! API routes for triaged
//!
//! Producers push evidence batches over the agent routes. Planners open
//! recovery sessions over the plan routes. Human responders attach to a
//! session over the WebSocket route and drive approvals from there.

use crate::server::{self, AppState};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    http::{header, HeaderMap, StatusCode},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, warn};
use triage_common::protocol::{
    EvidenceBatch, Heartbeat, IngestResponse, PlanProposal, PlanResponse, SessionSnapshot,
    ViewerCommand, AGENT_HEADER,
};
use triage_common::{ActionStep, EvidenceRecord, TriageError};

type AppStateArc = Arc<AppState>;

fn reject(e: TriageError) -> (StatusCode, String) {
    let status = match &e {
        TriageError::Auth(_) => StatusCode::UNAUTHORIZED,
        TriageError::Validation(_) => StatusCode::BAD_REQUEST,
        TriageError::UnknownSession(_) | TriageError::UnknownStep(_) => StatusCode::NOT_FOUND,
        TriageError::StaleSession(_) => StatusCode::GONE,
        TriageError::PolicyViolation(_) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, e.to_string())
}

/// Producer identity and bearer credential from the request headers.
fn agent_credentials(headers: &HeaderMap) -> Result<(String, String), (StatusCode, String)> {
    let producer = headers
        .get(AGENT_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or((
            StatusCode::UNAUTHORIZED,
            format!("missing {} header", AGENT_HEADER),
        ))?;
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or((
            StatusCode::UNAUTHORIZED,
            "missing bearer credential".to_string(),
        ))?;
    Ok((producer.to_string(), token.to_string()))
}

// ============================================================================
// Agent Routes
// ============================================================================

pub fn agent_routes() -> Router<AppStateArc> {
    Router::new()
        .route("/api/agent/evidence", post(ingest_evidence))
        .route("/api/agent/heartbeat", post(heartbeat))
}

async fn ingest_evidence(
    State(state): State<AppStateArc>,
    headers: HeaderMap,
    Json(batch): Json<EvidenceBatch>,
) -> Result<Json<IngestResponse>, (StatusCode, String)> {
    let (producer, token) = agent_credentials(&headers)?;
    let mut log = state.evidence.write().await;
    let accepted = state
        .ingress
        .ingest(&mut log, &producer, &token, &batch.events)
        .map_err(reject)?;
    Ok(Json(IngestResponse { accepted }))
}

async fn heartbeat(
    State(state): State<AppStateArc>,
    headers: HeaderMap,
    Json(beat): Json<Heartbeat>,
) -> Result<StatusCode, (StatusCode, String)> {
    let (producer, token) = agent_credentials(&headers)?;
    state.ingress.authenticate(&producer, &token).map_err(reject)?;
    info!(
        "Heartbeat from {} (env={} version={})",
        producer, beat.env, beat.version
    );
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// Evidence Routes
// ============================================================================

pub fn evidence_routes() -> Router<AppStateArc> {
    Router::new().route("/api/evidence/tail", get(tail_evidence))
}

#[derive(Deserialize)]
struct TailParams {
    #[serde(default = "default_tail_limit")]
    limit: usize,
}

fn default_tail_limit() -> usize {
    100
}

async fn tail_evidence(
    State(state): State<AppStateArc>,
    Query(params): Query<TailParams>,
) -> Json<Vec<EvidenceRecord>> {
    let log = state.evidence.read().await;
    Json(log.tail(params.limit.min(1000)))
}

// ============================================================================
// Status Routes
// ============================================================================

pub fn status_routes() -> Router<AppStateArc> {
    Router::new().route("/api/status", get(get_status))
}

async fn get_status(State(state): State<AppStateArc>) -> Json<serde_json::Value> {
    let sessions = state.sessions.read().await.stats();
    let evidence = state.evidence.read().await;
    Json(serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "evidence": {
            "retained": evidence.len(),
            "total_ingested": evidence.total_ingested(),
        },
        "sessions": sessions,
    }))
}

// ============================================================================
// Plan Routes
// ============================================================================

pub fn plan_routes() -> Router<AppStateArc> {
    Router::new().route("/api/plan/propose", post(propose_plan))
}

async fn propose_plan(
    State(state): State<AppStateArc>,
    Json(proposal): Json<PlanProposal>,
) -> Result<Json<PlanResponse>, (StatusCode, String)> {
    let (session_id, token, events, auto) = {
        let mut sessions = state.sessions.write().await;
        sessions
            .create_session(&proposal.service_name, proposal.steps, &state.gate)
            .map_err(reject)?
    };
    state.broadcaster.write().await.publish(&session_id, &events);

    let snapshot = {
        let sessions = state.sessions.read().await;
        sessions.snapshot(&session_id, &token).map_err(reject)?
    };

    if !auto.is_empty() {
        tokio::spawn(server::drive_auto(state.clone(), auto));
    }

    Ok(Json(PlanResponse {
        session_id,
        token,
        expires_at: snapshot.expires_at,
        steps: snapshot.plan,
    }))
}

// ============================================================================
// Session Routes
// ============================================================================

pub fn session_routes() -> Router<AppStateArc> {
    Router::new()
        .route("/api/session/:id", get(get_session))
        .route("/api/session/:id/actions", get(get_actions))
        .route("/api/session/:id/close", post(close_session))
        .route("/ws/session/:id", get(ws_session))
}

#[derive(Deserialize)]
struct TokenParams {
    token: String,
}

async fn get_session(
    State(state): State<AppStateArc>,
    Path(session_id): Path<String>,
    Query(params): Query<TokenParams>,
) -> Result<Json<SessionSnapshot>, (StatusCode, String)> {
    let sessions = state.sessions.read().await;
    let snapshot = sessions.snapshot(&session_id, &params.token).map_err(reject)?;
    Ok(Json(snapshot))
}

async fn get_actions(
    State(state): State<AppStateArc>,
    Path(session_id): Path<String>,
    Query(params): Query<TokenParams>,
) -> Result<Json<Vec<ActionStep>>, (StatusCode, String)> {
    let sessions = state.sessions.read().await;
    let actions = sessions.actions(&session_id, &params.token).map_err(reject)?;
    Ok(Json(actions))
}

async fn close_session(
    State(state): State<AppStateArc>,
    Path(session_id): Path<String>,
    Query(params): Query<TokenParams>,
) -> Result<StatusCode, (StatusCode, String)> {
    {
        let mut sessions = state.sessions.write().await;
        sessions
            .close_session(&session_id, &params.token)
            .map_err(reject)?;
    }
    state.broadcaster.write().await.remove(&session_id);
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// Session WebSocket
// ============================================================================

#[derive(Deserialize)]
struct ViewerParams {
    token: String,
    viewer: String,
}

async fn ws_session(
    State(state): State<AppStateArc>,
    Path(session_id): Path<String>,
    Query(params): Query<ViewerParams>,
    ws: WebSocketUpgrade,
) -> Result<Response, (StatusCode, String)> {
    // Authenticate before upgrading so bad tokens get a plain 401.
    {
        let sessions = state.sessions.read().await;
        sessions.authorize(&session_id, &params.token).map_err(reject)?;
    }
    Ok(ws.on_upgrade(move |socket| {
        viewer_loop(state, socket, session_id, params.token, params.viewer)
    }))
}

/// One connected viewer: stream session events out, accept viewer
/// commands in, and keep the roster accurate on disconnect.
async fn viewer_loop(
    state: AppStateArc,
    mut socket: WebSocket,
    session_id: String,
    token: String,
    viewer: String,
) {
    let mut events = state.broadcaster.write().await.subscribe(&session_id);

    let attach = {
        let mut sessions = state.sessions.write().await;
        sessions.attach_viewer(&session_id, &token, &viewer)
    };
    let (snapshot, joined) = match attach {
        Ok(joined) => {
            let sessions = state.sessions.read().await;
            match sessions.snapshot(&session_id, &token) {
                Ok(snapshot) => (snapshot, joined),
                Err(e) => {
                    warn!("Snapshot failed for viewer {}: {}", viewer, e);
                    return;
                }
            }
        }
        Err(e) => {
            warn!("Viewer {} rejected on {}: {}", viewer, session_id, e);
            return;
        }
    };
    state.broadcaster.write().await.publish(&session_id, &joined);

    // Full state first, then the live stream.
    if send_json(&mut socket, &snapshot).await.is_err() {
        detach(&state, &session_id, &viewer).await;
        return;
    }

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    if send_json(&mut socket, &event).await.is_err() {
                        break;
                    }
                }
                // Lagged: skip to the oldest retained event.
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Viewer {} lagged {} events on {}", viewer, n, session_id);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
            message = socket.recv() => match message {
                Some(Ok(Message::Text(text))) => {
                    if let Err(e) =
                        handle_command(&state, &session_id, &token, &viewer, &text).await
                    {
                        let _ = send_json(
                            &mut socket,
                            &serde_json::json!({ "type": "error", "error": e.to_string() }),
                        )
                        .await;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("Socket error for viewer {}: {}", viewer, e);
                    break;
                }
            },
        }
    }

    detach(&state, &session_id, &viewer).await;
}

async fn detach(state: &AppStateArc, session_id: &str, viewer: &str) {
    let events = {
        let mut sessions = state.sessions.write().await;
        sessions.detach_viewer(session_id, viewer)
    };
    state.broadcaster.write().await.publish(session_id, &events);
}

async fn send_json<T: serde::Serialize>(socket: &mut WebSocket, value: &T) -> Result<(), ()> {
    let text = serde_json::to_string(value).map_err(|_| ())?;
    socket.send(Message::Text(text)).await.map_err(|_| ())
}

async fn handle_command(
    state: &AppStateArc,
    session_id: &str,
    token: &str,
    viewer: &str,
    text: &str,
) -> Result<(), TriageError> {
    let command: ViewerCommand = serde_json::from_str(text)
        .map_err(|e| TriageError::Validation(format!("bad command: {}", e)))?;

    match command {
        ViewerCommand::Approve { step_id } => {
            let (_, request, events) = {
                let mut sessions = state.sessions.write().await;
                sessions.approve(session_id, token, &step_id, viewer)?
            };
            state.broadcaster.write().await.publish(session_id, &events);
            if let Some(request) = request {
                tokio::spawn(server::drive_step(state.clone(), request));
            }
        }
        ViewerCommand::Reject { step_id, reason } => {
            let (_, events) = {
                let mut sessions = state.sessions.write().await;
                sessions.reject(session_id, token, &step_id, viewer, &reason)?
            };
            state.broadcaster.write().await.publish(session_id, &events);
        }
        ViewerCommand::EmergencyStop { reason } => {
            let events = {
                let mut sessions = state.sessions.write().await;
                sessions.emergency_stop(session_id, token, viewer, &reason)?
            };
            state.broadcaster.write().await.publish(session_id, &events);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_mapping_covers_client_faults() {
        assert_eq!(
            reject(TriageError::Auth("x".into())).0,
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            reject(TriageError::UnknownSession("x".into())).0,
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            reject(TriageError::StaleSession("x".into())).0,
            StatusCode::GONE
        );
        assert_eq!(
            reject(TriageError::PolicyViolation("x".into())).0,
            StatusCode::CONFLICT
        );
    }

    #[test]
    fn bearer_header_is_parsed() {
        let mut headers = HeaderMap::new();
        headers.insert(AGENT_HEADER, "agent:web-1".parse().unwrap());
        headers.insert(header::AUTHORIZATION, "Bearer s3cret".parse().unwrap());
        let (producer, token) = agent_credentials(&headers).unwrap();
        assert_eq!(producer, "agent:web-1");
        assert_eq!(token, "s3cret");
    }

    #[test]
    fn missing_headers_are_unauthorized() {
        let headers = HeaderMap::new();
        assert_eq!(
            agent_credentials(&headers).unwrap_err().0,
            StatusCode::UNAUTHORIZED
        );
    }
}
