// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Remote execution protocol: command envelopes over per-node inbox
//! streams, replies over per-command reply streams, and checkpointed
//! observation of per-session output streams.
//!
//! Delivery is at-least-once; receivers deduplicate by correlation id
//! against the session store and replay the recorded reply, so applying
//! the same command twice is a no-op with the same result.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ErrorKind, Fault};
use crate::hub::{Event, EventHub};
use crate::lifecycle::{CreateSessionRequest, LifecycleCoordinator, RequesterSpec};
use crate::identity::CallOrigin;
use crate::registry::PeerRegistry;
use crate::store::{SessionFilter, SessionStore, SessionSummary};
use crate::streams::StreamStore;
use crate::wire::{
    self, keys, now_ms, CommandEnvelope, CommandKind, CommandReply, WireEntry,
};

/// How long a caller waits for a command reply before giving up.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Poll cadence for reply and inbox streams.
const REPLY_POLL: Duration = Duration::from_millis(100);
const INBOX_POLL: Duration = Duration::from_millis(250);

/// Concurrent command handlers per node.
const WORKER_PERMITS: usize = 8;

/// Client side: enqueue commands on a target node's inbox and await the
/// reply on a dedicated reply stream.
pub struct RemoteExecutor {
    streams: Arc<dyn StreamStore>,
    registry: Arc<PeerRegistry>,
    local: String,
    timeout: Duration,
}

impl RemoteExecutor {
    pub fn new(
        streams: Arc<dyn StreamStore>,
        registry: Arc<PeerRegistry>,
        local: &str,
    ) -> Self {
        Self { streams, registry, local: local.to_owned(), timeout: DEFAULT_COMMAND_TIMEOUT }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Send one command and await its reply. `NotFound` when the target
    /// is not online in the peer registry.
    pub async fn send_command(
        &self,
        target: &str,
        command: CommandKind,
        args: serde_json::Value,
    ) -> Result<serde_json::Value, Fault> {
        if !self.registry.is_online(target).await {
            return Err(Fault::not_found(format!("no online computer '{target}'")));
        }

        let id = uuid::Uuid::new_v4().to_string();
        let reply_stream = keys::reply(&id);
        let envelope = CommandEnvelope {
            id: id.clone(),
            command,
            target: target.to_owned(),
            args,
            reply_stream: reply_stream.clone(),
            ts: now_ms(),
            origin: self.local.clone(),
        };
        let payload = wire::encode(&WireEntry::Command(envelope))?;
        self.streams.append(&keys::inbox(target), payload).await?;
        debug!(target, command = command.as_str(), id = %id, "command enqueued");

        let deadline = tokio::time::Instant::now() + self.timeout;
        let mut cursor = 0u64;
        loop {
            if tokio::time::Instant::now() >= deadline {
                return Err(Fault::transient(format!(
                    "command {} to '{target}' timed out after {:?}",
                    command.as_str(),
                    self.timeout
                )));
            }
            let batch = self.streams.read_after(&reply_stream, cursor, 8).await?;
            cursor = batch.cursor;
            for entry in batch.entries {
                if let WireEntry::Reply(reply) = wire::decode(&entry.payload)? {
                    return reply_to_result(reply);
                }
            }
            tokio::time::sleep(REPLY_POLL).await;
        }
    }
}

fn reply_to_result(reply: CommandReply) -> Result<serde_json::Value, Fault> {
    if let Some(error) = reply.error {
        let kind = ErrorKind::parse(&error.kind).unwrap_or(ErrorKind::PermanentTransport);
        return Err(Fault::new(kind, error.message));
    }
    Ok(reply.result.unwrap_or(serde_json::Value::Null))
}

// -- server side --------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct StartSessionArgs {
    project_path: Option<String>,
    agent: String,
    #[serde(default)]
    thinking_mode: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    parent_session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SessionArgs {
    session_id: String,
    #[serde(default)]
    message: Option<String>,
}

/// Applies command envelopes through the same internal paths the local
/// adapters use.
pub struct CommandHandler {
    lifecycle: Arc<LifecycleCoordinator>,
    store: Arc<SessionStore>,
}

impl CommandHandler {
    pub fn new(lifecycle: Arc<LifecycleCoordinator>, store: Arc<SessionStore>) -> Self {
        Self { lifecycle, store }
    }

    pub async fn handle(&self, envelope: &CommandEnvelope) -> Result<serde_json::Value, Fault> {
        match envelope.command {
            CommandKind::StartSession => {
                let args: StartSessionArgs = parse_args(&envelope.args)?;
                // A relayed create inherits identity from the initiator
                // when its record (or mirror) is known here.
                let requester = match args.parent_session_id {
                    Some(ref parent) if self.store.get(parent).is_ok() => {
                        RequesterSpec::Relayed { initiator_session_id: parent.clone() }
                    }
                    _ => RequesterSpec::Tool { origin: CallOrigin::AgentOfSession },
                };
                let record = self
                    .lifecycle
                    .create_session(CreateSessionRequest {
                        project_path: args.project_path,
                        agent: args.agent,
                        thinking_mode: args.thinking_mode,
                        title: args.title,
                        // The stream transport is never a session's
                        // origin; relayed sessions are recorded under
                        // the local programmatic surface.
                        origin_adapter: "local".to_owned(),
                        requester,
                    })
                    .await?;
                Ok(serde_json::json!({ "session_id": record.session_id }))
            }
            CommandKind::SendMessage => {
                let args: SessionArgs = parse_args(&envelope.args)?;
                let message = args.message.unwrap_or_default();
                self.lifecycle.send_input(&args.session_id, message.as_bytes()).await?;
                Ok(serde_json::json!({ "delivered": true }))
            }
            CommandKind::EndSession => {
                let args: SessionArgs = parse_args(&envelope.args)?;
                self.lifecycle.end_session(&args.session_id).await?;
                Ok(serde_json::json!({ "ended": true }))
            }
            CommandKind::ListSessions => {
                let filter: SessionFilter =
                    serde_json::from_value(envelope.args.clone()).unwrap_or_default();
                let sessions: Vec<SessionSummary> = self
                    .store
                    .list_local(&filter)?
                    .iter()
                    .map(SessionSummary::from)
                    .collect();
                Ok(serde_json::json!({ "sessions": sessions }))
            }
            CommandKind::GetStatus => {
                let args: SessionArgs = parse_args(&envelope.args)?;
                let record = self.store.get(&args.session_id)?;
                Ok(serde_json::json!({ "session": SessionSummary::from(&record) }))
            }
        }
    }
}

fn parse_args<T: for<'de> Deserialize<'de>>(args: &serde_json::Value) -> Result<T, Fault> {
    serde_json::from_value(args.clone())
        .map_err(|e| Fault::permanent(format!("bad command args: {e}")))
}

/// Reads this node's inbox, deduplicates by correlation id, and runs
/// handlers on a bounded worker pool. The reply (or the recorded reply,
/// for a replay) is appended to the caller's reply stream.
pub struct InboxPump {
    streams: Arc<dyn StreamStore>,
    store: Arc<SessionStore>,
    handler: Arc<CommandHandler>,
    hub: Arc<EventHub>,
    local: String,
    workers: Arc<Semaphore>,
    /// Correlation ids currently executing. A duplicate arriving before
    /// the first execution records its reply is dropped; the one reply
    /// lands on the shared reply stream either way.
    in_flight: Arc<tokio::sync::Mutex<std::collections::HashSet<String>>>,
}

impl InboxPump {
    pub fn new(
        streams: Arc<dyn StreamStore>,
        store: Arc<SessionStore>,
        handler: Arc<CommandHandler>,
        hub: Arc<EventHub>,
        local: &str,
    ) -> Self {
        Self {
            streams,
            store,
            handler,
            hub,
            local: local.to_owned(),
            workers: Arc::new(Semaphore::new(WORKER_PERMITS)),
            in_flight: Arc::new(tokio::sync::Mutex::new(std::collections::HashSet::new())),
        }
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let inbox = keys::inbox(&self.local);
        let mut cursor = match self.store.checkpoint(&inbox) {
            Ok(c) => c,
            Err(e) => {
                warn!(err = %e, "inbox checkpoint unavailable, starting from latest");
                0
            }
        };
        // Dedup memory outlives the inbox retention by a wide margin.
        let mut last_prune = tokio::time::Instant::now();
        let prune_every = Duration::from_secs(600);
        info!(inbox = %inbox, cursor, "inbox pump started");

        loop {
            if cancel.is_cancelled() {
                return;
            }
            let batch = match self.streams.read_after(&inbox, cursor, 16).await {
                Ok(batch) => batch,
                Err(e) if e.kind.is_transient() => {
                    debug!(err = %e, "inbox read failed, backing off");
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(1)) => continue,
                        _ = cancel.cancelled() => return,
                    }
                }
                Err(e) => {
                    warn!(err = %e, "inbox read failed permanently");
                    return;
                }
            };
            if batch.truncated {
                // Commands past the horizon are gone; idempotent callers
                // retry anything still relevant.
                warn!(inbox = %inbox, "inbox trimmed past checkpoint");
            }

            let had_entries = !batch.entries.is_empty();
            for entry in batch.entries {
                match wire::decode(&entry.payload) {
                    Ok(WireEntry::Command(envelope)) => self.dispatch(envelope).await,
                    Ok(other) => debug!("ignoring non-command inbox entry: {other:?}"),
                    Err(e) => debug!(err = %e, "dropping malformed inbox entry"),
                }
            }
            cursor = batch.cursor;
            if let Err(e) = self.store.set_checkpoint(&inbox, cursor) {
                warn!(err = %e, "inbox checkpoint write failed");
            }

            if last_prune.elapsed() >= prune_every {
                last_prune = tokio::time::Instant::now();
                match self.store.prune_commands(24 * 3600 * 1000) {
                    Ok(n) if n > 0 => debug!(pruned = n, "command dedup entries pruned"),
                    Ok(_) => {}
                    Err(e) => debug!(err = %e, "dedup prune failed"),
                }
            }

            if !had_entries {
                tokio::select! {
                    _ = tokio::time::sleep(INBOX_POLL) => {}
                    _ = cancel.cancelled() => return,
                }
            }
        }
    }

    async fn dispatch(&self, envelope: CommandEnvelope) {
        self.hub.emit(Event::RemoteCommandReceived(envelope.clone()));

        // Dedup before applying any state change; replays re-emit the
        // recorded reply verbatim.
        match self.store.seen_command(&envelope.id) {
            Ok(Some(recorded)) => {
                debug!(id = %envelope.id, "replaying recorded reply for duplicate command");
                let _ = self.streams.append(&envelope.reply_stream, recorded.into_bytes()).await;
                return;
            }
            Ok(None) => {}
            Err(e) => {
                warn!(err = %e, "dedup check failed, refusing command");
                return;
            }
        }
        {
            let mut in_flight = self.in_flight.lock().await;
            if !in_flight.insert(envelope.id.clone()) {
                debug!(id = %envelope.id, "duplicate command already executing");
                return;
            }
        }

        let permit = match Arc::clone(&self.workers).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };
        let handler = Arc::clone(&self.handler);
        let streams = Arc::clone(&self.streams);
        let store = Arc::clone(&self.store);
        let in_flight = Arc::clone(&self.in_flight);
        let local = self.local.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let result = handler.handle(&envelope).await;
            let reply = CommandReply {
                id: envelope.id.clone(),
                result: result.as_ref().ok().cloned(),
                error: result.as_ref().err().map(|e| e.to_body()),
                ts: now_ms(),
                origin: local,
            };
            if let Ok(payload) = wire::encode(&WireEntry::Reply(reply)) {
                if let Err(e) =
                    store.record_command(&envelope.id, &String::from_utf8_lossy(&payload))
                {
                    warn!(id = %envelope.id, err = %e, "reply record failed");
                }
                if let Err(e) = streams.append(&envelope.reply_stream, payload).await {
                    warn!(id = %envelope.id, err = %e, "reply append failed");
                }
            }
            in_flight.lock().await.remove(&envelope.id);
        });
    }
}

/// Checkpointed consumer of one remote session's output stream.
///
/// Emits each chunk as `remote_output_chunk` on the hub, advances the
/// persisted checkpoint after processing, and reports a gap exactly once
/// per fall-behind via `output_truncated`.
pub struct ObserverPump {
    streams: Arc<dyn StreamStore>,
    store: Arc<SessionStore>,
    hub: Arc<EventHub>,
    session_id: String,
    poll: Duration,
}

impl ObserverPump {
    pub fn new(
        streams: Arc<dyn StreamStore>,
        store: Arc<SessionStore>,
        hub: Arc<EventHub>,
        session_id: &str,
    ) -> Self {
        Self {
            streams,
            store,
            hub,
            session_id: session_id.to_owned(),
            poll: Duration::from_millis(200),
        }
    }

    pub fn with_poll(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }

    pub async fn run(self, cancel: CancellationToken) {
        let key = keys::output(&self.session_id);
        let mut cursor = self.store.checkpoint(&key).unwrap_or(0);
        debug!(session = %self.session_id, cursor, "observer pump started");

        loop {
            if cancel.is_cancelled() {
                return;
            }
            let batch = match self.streams.read_after(&key, cursor, 32).await {
                Ok(batch) => batch,
                Err(e) => {
                    debug!(session = %self.session_id, err = %e, "observer read failed");
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(1)) => continue,
                        _ = cancel.cancelled() => return,
                    }
                }
            };

            if batch.truncated {
                let resumed_at =
                    batch.entries.first().map(|e| e.sequence).unwrap_or(batch.cursor);
                self.hub.emit(Event::OutputTruncated {
                    session_id: self.session_id.clone(),
                    from_sequence: cursor,
                    to_sequence: resumed_at,
                });
            }

            let had_entries = !batch.entries.is_empty();
            for entry in &batch.entries {
                if let Ok(WireEntry::Output(chunk)) = wire::decode(&entry.payload) {
                    self.hub.emit(Event::RemoteOutputChunk(chunk));
                }
            }
            if batch.cursor != cursor {
                cursor = batch.cursor;
                if let Err(e) = self.store.set_checkpoint(&key, cursor) {
                    debug!(err = %e, "observer checkpoint write failed");
                }
            }

            if !had_entries {
                tokio::select! {
                    _ = tokio::time::sleep(self.poll) => {}
                    _ = cancel.cancelled() => return,
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "remote_tests.rs"]
mod tests;
