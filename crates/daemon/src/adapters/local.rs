// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP/WebSocket surface for TUIs and diagnostics.
//!
//! Read-only observer: session listings, mesh view, and a WebSocket
//! fan-out of output events. Programmatic session control goes through
//! the tool socket; this adapter is the origin surface those sessions
//! are recorded under.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::activity::ActivityCache;
use crate::adapter::{Adapter, Capability};
use crate::error::{ErrorResponse, Fault};
use crate::hub::{Event, EventHub, EventKind};
use crate::registry::PeerRegistry;
use crate::store::{SessionFilter, SessionStatus, SessionStore, SessionSummary};

/// Shared handler state.
pub struct LocalState {
    pub hub: Arc<EventHub>,
    pub store: Arc<SessionStore>,
    pub registry: Arc<PeerRegistry>,
    pub activity: Arc<ActivityCache>,
}

pub struct LocalAdapter {
    state: Arc<LocalState>,
    host: String,
    port: Option<u16>,
    cancel: Mutex<Option<CancellationToken>>,
    started: AtomicBool,
}

impl LocalAdapter {
    pub fn new(state: Arc<LocalState>, host: &str, port: Option<u16>) -> Self {
        Self {
            state,
            host: host.to_owned(),
            port,
            cancel: Mutex::new(None),
            started: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Adapter for LocalAdapter {
    fn name(&self) -> &'static str {
        "local"
    }

    fn capabilities(&self) -> &'static [Capability] {
        &[Capability::Ui]
    }

    async fn start(&self) -> Result<(), Fault> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let Some(port) = self.port else {
            // Tool-socket-only deployments run without the HTTP listener.
            return Ok(());
        };
        let cancel = CancellationToken::new();
        *self.cancel.lock().await = Some(cancel.clone());

        let router = build_router(Arc::clone(&self.state));
        let addr = format!("{}:{port}", self.host);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| Fault::permanent(format!("bind {addr}: {e}")))?;
        info!(addr = %addr, "HTTP adapter listening");

        tokio::spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(cancel.cancelled_owned())
                .await;
            if let Err(e) = result {
                error!("HTTP server error: {e}");
            }
        });
        Ok(())
    }

    async fn stop(&self) {
        if let Some(cancel) = self.cancel.lock().await.take() {
            cancel.cancel();
        }
        self.started.store(false, Ordering::SeqCst);
    }
}

/// Build the axum router with all HTTP and WebSocket routes.
pub fn build_router(state: Arc<LocalState>) -> Router {
    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/computers", get(computers))
        .route("/api/v1/sessions", get(sessions))
        .route("/api/v1/sessions/{id}", get(session))
        .route("/api/v1/activity", get(activity))
        .route("/ws", get(ws_handler))
        .layer(tower_http::cors::CorsLayer::permissive())
        .with_state(state)
}

fn fault_response(fault: Fault) -> (StatusCode, Json<ErrorResponse>) {
    let status =
        StatusCode::from_u16(fault.kind.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(fault.into()))
}

async fn health(State(state): State<Arc<LocalState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "running",
        "computer": state.store.local_computer(),
    }))
}

async fn computers(State(state): State<Arc<LocalState>>) -> Json<serde_json::Value> {
    let peers = state.registry.list_all().await;
    Json(serde_json::json!({ "computers": peers }))
}

/// Fast, lock-light snapshot of recent activity (the cache, not the store).
async fn activity(State(state): State<Arc<LocalState>>) -> Json<serde_json::Value> {
    let sessions = state.activity.snapshot_sessions().await;
    Json(serde_json::json!({ "sessions": sessions }))
}

#[derive(Debug, Deserialize)]
struct SessionsQuery {
    computer: Option<String>,
    status: Option<String>,
}

async fn sessions(
    State(state): State<Arc<LocalState>>,
    Query(query): Query<SessionsQuery>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<ErrorResponse>)> {
    let filter = SessionFilter {
        computer: query.computer,
        status: query.status.as_deref().and_then(SessionStatus::parse),
        project_path: None,
    };
    let sessions: Vec<SessionSummary> = state
        .store
        .list_all(&filter)
        .map_err(fault_response)?
        .iter()
        .map(SessionSummary::from)
        .collect();
    Ok(Json(serde_json::json!({ "sessions": sessions })))
}

async fn session(
    State(state): State<Arc<LocalState>>,
    Path(id): Path<String>,
) -> Result<Json<SessionSummary>, (StatusCode, Json<ErrorResponse>)> {
    let record = state.store.get(&id).map_err(fault_response)?;
    Ok(Json(SessionSummary::from(&record)))
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    session_id: Option<String>,
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<LocalState>>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws_pump(socket, state, query.session_id))
}

/// Forward output events (and remote chunks) to one WebSocket client,
/// optionally filtered to a single session.
async fn ws_pump(mut socket: WebSocket, state: Arc<LocalState>, session_id: Option<String>) {
    let mut output = state.hub.subscribe(EventKind::OutputUpdated);
    let mut remote = state.hub.subscribe(EventKind::RemoteOutputChunk);
    let mut terminated = state.hub.subscribe(EventKind::SessionTerminated);

    let wanted = |id: &str| session_id.as_deref().map(|s| s == id).unwrap_or(true);

    loop {
        let frame = tokio::select! {
            event = output.recv() => match event {
                Ok(Event::OutputUpdated(update)) if wanted(&update.session_id) => {
                    serde_json::json!({
                        "type": "output",
                        "session_id": update.session_id,
                        "summary": update.summary,
                        "sequence": update.sequence,
                    })
                }
                Ok(_) => continue,
                Err(_) => break,
            },
            event = remote.recv() => match event {
                Ok(Event::RemoteOutputChunk(chunk)) if wanted(&chunk.session_id) => {
                    serde_json::json!({
                        "type": "remote_output",
                        "session_id": chunk.session_id,
                        "payload": chunk.payload,
                        "sequence": chunk.sequence,
                    })
                }
                Ok(_) => continue,
                Err(_) => break,
            },
            event = terminated.recv() => match event {
                Ok(Event::SessionTerminated { session_id: id }) if wanted(&id) => {
                    serde_json::json!({ "type": "session_terminated", "session_id": id })
                }
                Ok(_) => continue,
                Err(_) => break,
            },
            incoming = socket.recv() => match incoming {
                // Client frames are ignored; a close ends the pump.
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    debug!(err = %e, "ws receive error");
                    break;
                }
            },
        };

        let Ok(text) = serde_json::to_string(&frame) else { continue };
        if socket.send(WsMessage::Text(text.into())).await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
#[path = "local_tests.rs"]
mod tests;
