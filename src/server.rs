//! HTTP/WebSocket front door: upgrade route, health check, origin
//! validation, and the per-connection read/write pumps (spec §5, §6).
//!
//! Grounded on `clawd::ipc::handle_connection`'s `tokio::select!` read
//! loop, rehomed onto `axum`'s native WebSocket extractor instead of
//! the teacher's manual HTTP/WS byte-peeking — the teacher already
//! depends on axum for its own REST surface, so this is the idiomatic
//! choice already present in the stack rather than a new one.

use crate::authz::Principal;
use crate::error::HubError;
use crate::hub::Hub;
use crate::protocol::{CloseFrame, InboundMessage, ServerMessage};
use futures_util::SinkExt;
use axum::{
    extract::{ws::{Message, WebSocket, WebSocketUpgrade}, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

pub struct AppState {
    pub hub: Arc<Hub>,
    pub config: Arc<crate::config::HubConfig>,
    pub started_at: Instant,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/threat_models/:threat_model_id/diagrams/:diagram_id/ws", get(ws_upgrade))
        // The WS upgrade itself is origin-checked in `origin_allowed`;
        // this only covers plain HTTP callers of /health.
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(serde::Serialize)]
struct Health {
    status: &'static str,
    active_sessions: usize,
    uptime_secs: u64,
}

async fn health(State(state): State<Arc<AppState>>) -> Json<Health> {
    let active_sessions = state.hub.diagram_ids().await.len();
    Json(Health { status: "ok", active_sessions, uptime_secs: state.started_at.elapsed().as_secs() })
}

#[derive(Deserialize)]
struct WsQuery {
    session_id: Option<Uuid>,
}

/// Identity injected by the upstream auth layer onto the request
/// (spec §6: "the core does not verify tokens"). Read here from
/// headers as a stand-in for whatever gateway sits in front of this
/// service in production.
fn principal_from_headers(headers: &HeaderMap) -> Principal {
    let get = |name: &str| headers.get(name).and_then(|v| v.to_str().ok()).map(|s| s.to_string());
    Principal {
        user_id: get("x-user-id").unwrap_or_default(),
        email: get("x-user-email"),
        name: get("x-user-name"),
        provider_id: get("x-user-provider-id"),
        internal_uuid: get("x-user-internal-uuid"),
        provider: get("x-user-provider"),
        groups: get("x-user-groups").map(|g| g.split(',').map(|s| s.trim().to_string()).collect()).unwrap_or_default(),
    }
}

/// Spec §5: reject cross-origin upgrades unless dev-mode, no Origin
/// header, or the origin matches the configured TLS subject, the
/// request's own Host, or localhost.
fn origin_allowed(headers: &HeaderMap, config: &crate::config::HubConfig) -> bool {
    if config.dev_mode {
        return true;
    }
    let Some(origin) = headers.get("origin").and_then(|v| v.to_str().ok()) else {
        return true;
    };
    let origin_host = origin.trim_start_matches("https://").trim_start_matches("http://").trim_end_matches('/');

    if origin_host.starts_with("localhost") || origin_host.starts_with("127.0.0.1") {
        return true;
    }
    if let Some(subject) = &config.tls_subject {
        if origin_host == subject {
            return true;
        }
    }
    if let Some(host) = headers.get("host").and_then(|v| v.to_str().ok()) {
        if origin_host == host {
            return true;
        }
    }
    false
}

async fn ws_upgrade(
    State(state): State<Arc<AppState>>,
    Path((threat_model_id, diagram_id)): Path<(String, String)>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let Ok(threat_model_id) = Uuid::parse_str(&threat_model_id) else {
        return (StatusCode::BAD_REQUEST, "invalid threat_model_id").into_response();
    };
    let Ok(diagram_id) = Uuid::parse_str(&diagram_id) else {
        return (StatusCode::BAD_REQUEST, "invalid diagram_id").into_response();
    };

    if !origin_allowed(&headers, &state.config) {
        return (StatusCode::FORBIDDEN, "origin not allowed").into_response();
    }

    let principal = principal_from_headers(&headers);

    ws.on_upgrade(move |socket| async move {
        handle_socket(socket, state, diagram_id, threat_model_id, principal, query.session_id).await;
    })
}

/// Drives one connection end to end: resolves/creates the session,
/// registers a participant, then runs the read/write pump until the
/// socket or the session closes (spec §5 "two tasks per connection" —
/// collapsed into one task here since axum's split socket already
/// multiplexes both directions without a second OS task).
async fn handle_socket(
    mut socket: WebSocket,
    state: Arc<AppState>,
    diagram_id: Uuid,
    threat_model_id: Uuid,
    principal: Principal,
    session_id_query: Option<Uuid>,
) {
    let handle = match state.hub.handle_upgrade(diagram_id, threat_model_id, principal.clone(), session_id_query).await {
        Ok(handle) => handle,
        Err(e) => {
            send_close_frame(&mut socket, &e).await;
            let _ = socket.close().await;
            return;
        }
    };

    let client_id = Uuid::new_v4();
    let (tx, mut rx) = tokio::sync::mpsc::channel::<ServerMessage>(state.config.send_queue_capacity);

    if let Err(e) = handle.register(client_id, principal, tx).await {
        send_close_frame(&mut socket, &e).await;
        let _ = socket.close().await;
        return;
    }

    let mut ping_interval = tokio::time::interval(state.config.ping_interval);

    loop {
        tokio::select! {
            outbound = rx.recv() => {
                match outbound {
                    Some(msg) => {
                        let Ok(text) = serde_json::to_string(&msg) else { continue };
                        if socket.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            inbound = tokio::time::timeout(state.config.read_deadline, socket.recv()) => {
                match inbound {
                    Ok(Some(Ok(Message::Text(text)))) => {
                        if text.len() > state.config.max_frame_bytes {
                            continue;
                        }
                        dispatch_inbound(&handle, client_id, text.as_bytes(), state.config.max_operation_bytes).await;
                    }
                    Ok(Some(Ok(Message::Pong(_)))) => {}
                    Ok(Some(Ok(Message::Close(_)))) | Ok(None) => break,
                    Ok(Some(Ok(_))) => {}
                    Ok(Some(Err(_))) | Err(_) => break,
                }
            }
            _ = ping_interval.tick() => {
                if socket.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }

    handle.unregister(client_id).await;
}

async fn dispatch_inbound(handle: &crate::session::SessionHandle, client_id: Uuid, raw: &[u8], max_operation_bytes: usize) {
    if raw.len() > max_operation_bytes {
        return;
    }
    match crate::protocol::parse_inbound(raw) {
        Some(InboundMessage::Typed(msg)) => handle.inbound(client_id, msg).await,
        Some(InboundMessage::Legacy(envelope)) => handle.legacy_inbound(client_id, envelope).await,
        None => tracing::debug!("dropped malformed inbound frame"),
    }
}

async fn send_close_frame(socket: &mut WebSocket, err: &HubError) {
    let frame = match err {
        HubError::SessionIdMismatch { canonical } => CloseFrame::SessionInvalid {
            error: "session_invalid",
            new_session_id: Uuid::parse_str(canonical).unwrap_or(Uuid::nil()),
        },
        HubError::Forbidden | HubError::Unauthenticated => {
            CloseFrame::Unauthorized { error: "unauthorized", message: err.to_string() }
        }
        HubError::SessionTerminated => CloseFrame::SessionTerminated { error: "session_terminated" },
        other => CloseFrame::Unauthorized { error: "unauthorized", message: other.to_string() },
    };
    if let Ok(text) = serde_json::to_string(&frame) {
        let _ = socket.send(Message::Text(text.into())).await;
    }
}
