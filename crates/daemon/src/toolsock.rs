// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Agent tool surface: the RPC endpoint colocated CLIs speak to over a
//! Unix socket with length-prefixed JSON frames.
//!
//! Tools identify themselves on connect (`{origin, caller_session_id?}`)
//! and may then issue many RPCs over the one connection. Single results
//! and errors are one frame; streamed responses are one frame per chunk
//! ending with `{final: true}`. `send_message` streams for at most the
//! interest window, then emits the `interest_window_closed` sentinel and
//! returns while the session keeps running.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::Fault;
use crate::identity::CallOrigin;
use crate::lifecycle::{CreateSessionRequest, LifecycleCoordinator, RequesterSpec};
use crate::registry::PeerRegistry;
use crate::remote::RemoteExecutor;
use crate::store::{SessionFilter, SessionStatus, SessionSummary};
use crate::streams::StreamStore;
use crate::wire::{self, keys, CommandKind, WireEntry};

/// Frames above this size are refused (malformed or hostile peers).
const MAX_FRAME: u32 = 4 << 20;

/// Default interest window for `send_message`.
const DEFAULT_WINDOW_SECS: f64 = 15.0;

/// Cadence for polling the output stream while a window is open.
const STREAM_POLL: Duration = Duration::from_millis(100);

/// Read one length-prefixed JSON frame. `None` on clean EOF.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<serde_json::Value>, Fault> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(Fault::transient(format!("frame read: {e}"))),
    }
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME {
        return Err(Fault::permanent(format!("frame of {len} bytes exceeds limit")));
    }
    let mut payload = vec![0u8; len as usize];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| Fault::transient(format!("frame body read: {e}")))?;
    serde_json::from_slice(&payload)
        .map(Some)
        .map_err(|e| Fault::permanent(format!("malformed frame: {e}")))
}

/// Write one length-prefixed JSON frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    value: &serde_json::Value,
) -> Result<(), Fault> {
    let payload =
        serde_json::to_vec(value).map_err(|e| Fault::permanent(format!("frame encode: {e}")))?;
    let len = payload.len() as u32;
    writer
        .write_all(&len.to_be_bytes())
        .await
        .map_err(|e| Fault::transient(format!("frame write: {e}")))?;
    writer
        .write_all(&payload)
        .await
        .map_err(|e| Fault::transient(format!("frame write: {e}")))?;
    writer.flush().await.map_err(|e| Fault::transient(format!("frame flush: {e}")))?;
    Ok(())
}

#[derive(Debug, Clone, Deserialize)]
struct Hello {
    origin: CallOrigin,
    #[serde(default)]
    caller_session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "rpc", rename_all = "snake_case")]
enum RpcRequest {
    ListComputers {},
    ListProjects {
        computer: String,
    },
    ListSessions {
        #[serde(default)]
        filter: SessionFilter,
    },
    StartSession {
        computer: String,
        project_path: String,
        agent: String,
        #[serde(default)]
        thinking_mode: String,
        #[serde(default)]
        title: String,
        #[serde(default)]
        parent_session_id: Option<String>,
    },
    SendMessage {
        session_id: String,
        message: String,
        #[serde(default)]
        interest_window_seconds: Option<f64>,
    },
    GetSessionStatus {
        session_id: String,
        #[serde(default)]
        since_sequence: Option<u64>,
    },
    EndSession {
        session_id: String,
    },
    ObserveSession {
        session_id: String,
        #[serde(default)]
        from_sequence: Option<u64>,
        #[serde(default)]
        interest_window_seconds: Option<f64>,
    },
}

/// Everything the tool surface reaches into.
pub struct ToolDeps {
    pub lifecycle: Arc<LifecycleCoordinator>,
    pub registry: Arc<PeerRegistry>,
    pub streams: Arc<dyn StreamStore>,
    pub remote: Arc<RemoteExecutor>,
}

pub struct ToolSocket {
    path: PathBuf,
    deps: Arc<ToolDeps>,
}

impl ToolSocket {
    pub fn new(path: PathBuf, deps: Arc<ToolDeps>) -> Self {
        Self { path, deps }
    }

    /// Accept loop. One task per connected tool.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), Fault> {
        let _ = std::fs::remove_file(&self.path);
        if let Some(parent) = self.path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let listener = UnixListener::bind(&self.path)
            .map_err(|e| Fault::permanent(format!("bind {}: {e}", self.path.display())))?;
        info!(path = %self.path.display(), "tool socket listening");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = std::fs::remove_file(&self.path);
                    return Ok(());
                }
                accept = listener.accept() => {
                    match accept {
                        Ok((stream, _)) => {
                            let deps = Arc::clone(&self.deps);
                            let conn_cancel = cancel.child_token();
                            tokio::spawn(async move {
                                if let Err(e) = handle_conn(stream, deps, conn_cancel).await {
                                    debug!(err = %e, "tool connection ended with error");
                                }
                            });
                        }
                        Err(e) => debug!(err = %e, "tool socket accept error"),
                    }
                }
            }
        }
    }
}

async fn handle_conn(
    stream: tokio::net::UnixStream,
    deps: Arc<ToolDeps>,
    cancel: CancellationToken,
) -> Result<(), Fault> {
    let (mut reader, mut writer) = stream.into_split();

    // Handshake first.
    let hello: Hello = match read_frame(&mut reader).await? {
        Some(value) => serde_json::from_value(value)
            .map_err(|e| Fault::permanent(format!("bad handshake: {e}")))?,
        None => return Ok(()),
    };
    debug!(origin = hello.origin.as_str(), "tool connected");

    loop {
        let request = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            frame = read_frame(&mut reader) => match frame? {
                Some(value) => value,
                None => return Ok(()),
            },
        };

        let request: RpcRequest = match serde_json::from_value(request) {
            Ok(request) => request,
            Err(e) => {
                let fault = Fault::permanent(format!("unknown rpc: {e}"));
                write_error(&mut writer, &fault).await?;
                continue;
            }
        };

        if let Err(fault) = dispatch(&deps, &hello, request, &mut writer, &cancel).await {
            write_error(&mut writer, &fault).await?;
        }
    }
}

async fn write_error<W: AsyncWrite + Unpin>(writer: &mut W, fault: &Fault) -> Result<(), Fault> {
    let mut value = serde_json::to_value(crate::error::ErrorResponse::from(fault.clone()))
        .unwrap_or(serde_json::json!({"error": {"kind": "InternalInvariant"}}));
    value["final"] = serde_json::Value::Bool(true);
    write_frame(writer, &value).await
}

async fn write_result<W: AsyncWrite + Unpin>(
    writer: &mut W,
    result: serde_json::Value,
) -> Result<(), Fault> {
    write_frame(writer, &serde_json::json!({ "result": result, "final": true })).await
}

async fn dispatch<W: AsyncWrite + Unpin>(
    deps: &Arc<ToolDeps>,
    hello: &Hello,
    request: RpcRequest,
    writer: &mut W,
    cancel: &CancellationToken,
) -> Result<(), Fault> {
    match request {
        RpcRequest::ListComputers {} => {
            let computers = deps.registry.list_all().await;
            write_result(writer, serde_json::json!({ "computers": computers })).await
        }
        RpcRequest::ListProjects { computer } => {
            let sessions = deps.lifecycle.store().list_all(&SessionFilter {
                computer: Some(computer),
                ..Default::default()
            })?;
            let mut paths: Vec<String> =
                sessions.into_iter().map(|r| r.project_path).collect();
            paths.sort();
            paths.dedup();
            let projects: Vec<serde_json::Value> = paths
                .into_iter()
                .map(|path| {
                    let name = std::path::Path::new(&path)
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_else(|| path.clone());
                    serde_json::json!({ "name": name, "path": path })
                })
                .collect();
            write_result(writer, serde_json::json!({ "projects": projects })).await
        }
        RpcRequest::ListSessions { filter } => {
            let sessions: Vec<SessionSummary> = deps
                .lifecycle
                .store()
                .list_all(&filter)?
                .iter()
                .map(SessionSummary::from)
                .collect();
            write_result(writer, serde_json::json!({ "sessions": sessions })).await
        }
        RpcRequest::StartSession {
            computer,
            project_path,
            agent,
            thinking_mode,
            title,
            parent_session_id,
        } => {
            let local = deps.lifecycle.store().local_computer().to_owned();
            if computer == local {
                let requester = match parent_session_id {
                    Some(parent) => RequesterSpec::Relayed { initiator_session_id: parent },
                    None => RequesterSpec::Tool { origin: hello.origin },
                };
                let record = deps
                    .lifecycle
                    .create_session(CreateSessionRequest {
                        project_path: Some(project_path),
                        agent,
                        thinking_mode,
                        title,
                        origin_adapter: "local".to_owned(),
                        requester,
                    })
                    .await?;
                write_result(writer, serde_json::json!({ "session_id": record.session_id })).await
            } else {
                let result = deps
                    .remote
                    .send_command(
                        &computer,
                        CommandKind::StartSession,
                        serde_json::json!({
                            "project_path": project_path,
                            "agent": agent,
                            "thinking_mode": thinking_mode,
                            "title": title,
                            "parent_session_id": parent_session_id
                                .or(hello.caller_session_id.clone()),
                        }),
                    )
                    .await?;
                write_result(writer, result).await
            }
        }
        RpcRequest::SendMessage { session_id, message, interest_window_seconds } => {
            // An empty message performs no input and emits no chunks.
            if message.is_empty() {
                return write_result(writer, serde_json::json!({ "delivered": false })).await;
            }
            let window =
                Duration::from_secs_f64(interest_window_seconds.unwrap_or(DEFAULT_WINDOW_SECS));
            let key = keys::output(&session_id);
            let start = deps.streams.latest_sequence(&key).await?;

            deliver_message(deps, &session_id, &message).await?;
            stream_output(deps, writer, &session_id, start, Some(window), cancel).await
        }
        RpcRequest::GetSessionStatus { session_id, since_sequence } => {
            let record = deps.lifecycle.store().get(&session_id)?;
            let key = keys::output(&session_id);
            let checkpoint_key = format!("toolstat/{session_id}");
            let since = match since_sequence {
                Some(s) => s,
                None => deps.lifecycle.store().checkpoint(&checkpoint_key)?,
            };
            let batch = deps.streams.read_after(&key, since, 100).await?;
            let mut new_output = Vec::new();
            for entry in &batch.entries {
                if let Ok(WireEntry::Output(chunk)) = wire::decode(&entry.payload) {
                    new_output.push(serde_json::to_value(chunk).unwrap_or_default());
                }
            }
            deps.lifecycle.store().set_checkpoint(&checkpoint_key, batch.cursor)?;
            write_result(
                writer,
                serde_json::json!({
                    "status": record.status,
                    "new_output": new_output,
                    "next_sequence": batch.cursor,
                    "truncated": batch.truncated,
                }),
            )
            .await
        }
        RpcRequest::EndSession { session_id } => {
            let store = deps.lifecycle.store();
            let record = store.get(&session_id)?;
            deps.lifecycle.authorize_end(
                hello.origin,
                hello.caller_session_id.as_deref(),
                &record,
            )?;
            if record.computer == store.local_computer() {
                deps.lifecycle.end_session(&session_id).await?;
            } else {
                deps.remote
                    .send_command(
                        &record.computer,
                        CommandKind::EndSession,
                        serde_json::json!({ "session_id": session_id }),
                    )
                    .await?;
            }
            write_result(writer, serde_json::json!({ "ended": true })).await
        }
        RpcRequest::ObserveSession { session_id, from_sequence, interest_window_seconds } => {
            let window = interest_window_seconds.map(Duration::from_secs_f64);
            let from = from_sequence.unwrap_or(0);
            stream_output(deps, writer, &session_id, from, window, cancel).await
        }
    }
}

/// Route a message to the session's owning node.
async fn deliver_message(deps: &Arc<ToolDeps>, session_id: &str, message: &str) -> Result<(), Fault> {
    let store = deps.lifecycle.store();
    let record = store.get(session_id)?;
    if record.status == SessionStatus::Terminated {
        return Err(Fault::conflict(format!("session {session_id} is terminated")));
    }
    if record.computer == store.local_computer() {
        deps.lifecycle.send_input(session_id, message.as_bytes()).await
    } else {
        deps.remote
            .send_command(
                &record.computer,
                CommandKind::SendMessage,
                serde_json::json!({ "session_id": session_id, "message": message }),
            )
            .await
            .map(|_| ())
    }
}

/// Stream output chunks from a session's output stream until the
/// interest window closes (or forever when unbounded), then emit the
/// resume sentinel. The window timer is independent of the session's
/// life: expiry returns the stream but never cancels the session.
async fn stream_output<W: AsyncWrite + Unpin>(
    deps: &Arc<ToolDeps>,
    writer: &mut W,
    session_id: &str,
    from_sequence: u64,
    window: Option<Duration>,
    cancel: &CancellationToken,
) -> Result<(), Fault> {
    let key = keys::output(session_id);
    let mut cursor = from_sequence;
    let deadline = window.map(|w| tokio::time::Instant::now() + w);

    loop {
        let expired = match deadline {
            Some(deadline) => tokio::time::Instant::now() >= deadline,
            None => false,
        };
        if expired || cancel.is_cancelled() {
            return write_frame(
                writer,
                &serde_json::json!({
                    "kind": "interest_window_closed",
                    "next_sequence": cursor,
                    "final": true,
                }),
            )
            .await;
        }

        let batch = deps.streams.read_after(&key, cursor, 32).await?;
        if batch.truncated {
            write_frame(
                writer,
                &serde_json::json!({
                    "kind": "output_truncated",
                    "session_id": session_id,
                    "from_sequence": cursor,
                    "to_sequence": batch.entries.first().map(|e| e.sequence).unwrap_or(batch.cursor),
                }),
            )
            .await?;
        }
        for entry in &batch.entries {
            if let Ok(WireEntry::Output(chunk)) = wire::decode(&entry.payload) {
                let mut frame = serde_json::to_value(&chunk).unwrap_or_default();
                frame["kind"] = serde_json::Value::String("output".to_owned());
                write_frame(writer, &frame).await?;
            }
        }
        cursor = batch.cursor;

        let sleep = tokio::time::sleep(STREAM_POLL);
        match deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = sleep => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                    _ = cancel.cancelled() => {}
                }
            }
            None => {
                tokio::select! {
                    _ = sleep => {}
                    _ = cancel.cancelled() => {}
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "toolsock_tests.rs"]
mod tests;
