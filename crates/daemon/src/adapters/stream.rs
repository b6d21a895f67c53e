// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Stream-store transport adapter (`ui = false`, never origin).
//!
//! Owns everything that touches the shared stream store: the heartbeat
//! emitter and watcher (discovery), this node's inbox pump (remote
//! execution), the single writer of every local session's output
//! stream, interest-routed push notices to peers, and the pumps that
//! mirror remote sessions locally.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::activity::ActivityCache;
use crate::adapter::{Adapter, Capability};
use crate::error::Fault;
use crate::hub::{Event, EventHub, EventKind};
use crate::lifecycle::LifecycleCoordinator;
use crate::registry::PeerRegistry;
use crate::remote::{CommandHandler, InboxPump, ObserverPump};
use crate::store::{SessionStore, SessionSummary};
use crate::streams::StreamStore;
use crate::wire::{self, keys, now_ms, ChunkKind, HeartbeatRecord, OutputChunk, SessionNotice, WireEntry};

/// Interest class for session lifecycle traffic.
const SESSIONS_TOPIC: &str = "sessions";

/// Error chunks allowed per session per minute.
const ERROR_BUDGET: u32 = 10;

/// Minimum gap between `updated` push notices per session.
const NOTICE_GAP: Duration = Duration::from_secs(2);

struct StreamInner {
    streams: Arc<dyn StreamStore>,
    store: Arc<SessionStore>,
    hub: Arc<EventHub>,
    registry: Arc<PeerRegistry>,
    activity: Arc<ActivityCache>,
    lifecycle: OnceLock<Arc<LifecycleCoordinator>>,
    local: String,
    capabilities: Vec<String>,
    interests: Vec<String>,
    heartbeat_interval: Duration,
    heartbeat_ttl: Duration,
    /// Next output sequence per local session, seeded from the store.
    sequences: Mutex<HashMap<String, u64>>,
    /// Sliding error-chunk budget per session.
    error_budget: Mutex<HashMap<String, (Instant, u32)>>,
    /// Throttle clock for `updated` push notices per session.
    notice_clock: Mutex<HashMap<String, Instant>>,
    /// Observer pumps for mirrored remote sessions.
    observers: Mutex<HashMap<String, CancellationToken>>,
    cancel: Mutex<Option<CancellationToken>>,
    started: AtomicBool,
}

pub struct StreamAdapter {
    inner: Arc<StreamInner>,
}

impl StreamAdapter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        streams: Arc<dyn StreamStore>,
        store: Arc<SessionStore>,
        hub: Arc<EventHub>,
        registry: Arc<PeerRegistry>,
        activity: Arc<ActivityCache>,
        local: &str,
        interests: Vec<String>,
        heartbeat_interval: Duration,
        heartbeat_ttl: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(StreamInner {
                streams,
                store,
                hub,
                registry,
                activity,
                lifecycle: OnceLock::new(),
                local: local.to_owned(),
                capabilities: vec![SESSIONS_TOPIC.to_owned()],
                interests,
                heartbeat_interval,
                heartbeat_ttl,
                sequences: Mutex::new(HashMap::new()),
                error_budget: Mutex::new(HashMap::new()),
                notice_clock: Mutex::new(HashMap::new()),
                observers: Mutex::new(HashMap::new()),
                cancel: Mutex::new(None),
                started: AtomicBool::new(false),
            }),
        }
    }

    /// Bind the lifecycle coordinator. The adapter is registered before
    /// the coordinator exists, so the handle arrives late but must be
    /// set before `start()`.
    pub fn set_lifecycle(&self, lifecycle: Arc<LifecycleCoordinator>) {
        let _ = self.inner.lifecycle.set(lifecycle);
    }

    /// The store this adapter publishes through (shared with the tool
    /// surface so checkpointed reads see the same data).
    pub fn streams(&self) -> Arc<dyn StreamStore> {
        Arc::clone(&self.inner.streams)
    }
}

#[async_trait]
impl Adapter for StreamAdapter {
    fn name(&self) -> &'static str {
        "stream"
    }

    fn capabilities(&self) -> &'static [Capability] {
        &[Capability::RemoteExecution, Capability::Discovery]
    }

    async fn start(&self) -> Result<(), Fault> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let lifecycle = self
            .inner
            .lifecycle
            .get()
            .cloned()
            .ok_or_else(|| Fault::invariant("stream adapter started without a lifecycle"))?;

        let cancel = CancellationToken::new();
        *self.inner.cancel.lock().await = Some(cancel.clone());

        tokio::spawn(heartbeat_loop(Arc::clone(&self.inner), cancel.clone()));
        tokio::spawn(watcher_loop(Arc::clone(&self.inner), cancel.clone()));
        tokio::spawn(publisher_loop(Arc::clone(&self.inner), cancel.clone()));
        tokio::spawn(push_pump_loop(Arc::clone(&self.inner), cancel.clone()));

        let handler =
            Arc::new(CommandHandler::new(lifecycle, Arc::clone(&self.inner.store)));
        let pump = Arc::new(InboxPump::new(
            Arc::clone(&self.inner.streams),
            Arc::clone(&self.inner.store),
            handler,
            Arc::clone(&self.inner.hub),
            &self.inner.local,
        ));
        tokio::spawn(pump.run(cancel));

        info!(computer = %self.inner.local, "stream adapter started");
        Ok(())
    }

    async fn stop(&self) {
        if let Some(cancel) = self.inner.cancel.lock().await.take() {
            cancel.cancel();
        }
        for (_, cancel) in self.inner.observers.lock().await.drain() {
            cancel.cancel();
        }
        self.inner.started.store(false, Ordering::SeqCst);
    }

    async fn provision_session(
        &self,
        session: &crate::store::SessionRecord,
    ) -> Result<Option<serde_json::Value>, Fault> {
        Ok(Some(serde_json::json!({
            "inbox_key": keys::inbox(&self.inner.local),
            "output_stream_key": keys::output(&session.session_id),
        })))
    }
}

/// Emit this node's heartbeat at the configured cadence.
async fn heartbeat_loop(inner: Arc<StreamInner>, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(inner.heartbeat_interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = interval.tick() => {}
        }
        let record = HeartbeatRecord {
            computer: inner.local.clone(),
            caps: inner.capabilities.clone(),
            interests: inner.interests.clone(),
            ts: now_ms(),
        };
        let Ok(payload) = wire::encode(&WireEntry::Heartbeat(record.clone())) else {
            continue;
        };
        if let Err(e) = inner
            .streams
            .put_expiring(&keys::heartbeat(&inner.local), payload, inner.heartbeat_ttl)
            .await
        {
            debug!(err = %e, "heartbeat write failed");
        }
        inner.registry.upsert(record).await;
    }
}

/// Observe peer heartbeats, feeding the registry and activity cache.
async fn watcher_loop(inner: Arc<StreamInner>, cancel: CancellationToken) {
    let tick = (inner.heartbeat_interval / 2).max(Duration::from_millis(100));
    let mut interval = tokio::time::interval(tick);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = interval.tick() => {}
        }
        let entries = match inner.streams.list_expiring(keys::HEARTBEAT_PREFIX).await {
            Ok(entries) => entries,
            Err(e) => {
                debug!(err = %e, "heartbeat scan failed");
                continue;
            }
        };
        for (_, payload) in entries {
            let Ok(WireEntry::Heartbeat(record)) = wire::decode(&payload) else {
                continue;
            };
            if record.computer == inner.local {
                continue;
            }
            inner.hub.emit(Event::HeartbeatReceived(record.clone()));
            inner.activity.put_heartbeat(record.clone()).await;
            inner.registry.upsert(record).await;
        }
    }
}

/// Single writer of `output/<session_id>` for local sessions, and the
/// interest-routed push fan-out for session notices.
async fn publisher_loop(inner: Arc<StreamInner>, cancel: CancellationToken) {
    let mut output = inner.hub.subscribe(EventKind::OutputUpdated);
    let mut tool_use = inner.hub.subscribe(EventKind::AgentToolUse);
    let mut tool_done = inner.hub.subscribe(EventKind::AgentToolDone);
    let mut stop = inner.hub.subscribe(EventKind::AgentStop);
    let mut idle = inner.hub.subscribe(EventKind::AgentIdle);
    let mut started = inner.hub.subscribe(EventKind::SessionStarted);
    let mut terminated = inner.hub.subscribe(EventKind::SessionTerminated);
    let mut errors = inner.hub.subscribe(EventKind::ErrorRaised);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            event = output.recv() => {
                if let Ok(Event::OutputUpdated(update)) = event {
                    publish_chunk(&inner, &update.session_id, ChunkKind::Chunk, &update.summary).await;
                    push_notice(&inner, &update.session_id, "updated", true).await;
                    inner.activity.put_session(summary_of(&inner, &update.session_id).await).await;
                }
            }
            event = tool_use.recv() => {
                if let Ok(Event::AgentToolUse { session_id, tool }) = event {
                    publish_chunk(&inner, &session_id, ChunkKind::ToolUse, &tool).await;
                }
            }
            event = tool_done.recv() => {
                if let Ok(Event::AgentToolDone { session_id, tool }) = event {
                    publish_chunk(&inner, &session_id, ChunkKind::ToolDone, &tool).await;
                }
            }
            event = stop.recv() => {
                if let Ok(Event::AgentStop { session_id }) = event {
                    publish_chunk(&inner, &session_id, ChunkKind::AgentStop, "").await;
                }
            }
            event = idle.recv() => {
                if let Ok(Event::AgentIdle { session_id }) = event {
                    publish_chunk(&inner, &session_id, ChunkKind::AgentNotification, "idle").await;
                }
            }
            event = started.recv() => {
                if let Ok(Event::SessionStarted { session_id, .. }) = event {
                    push_notice(&inner, &session_id, "started", false).await;
                }
            }
            event = terminated.recv() => {
                if let Ok(Event::SessionTerminated { session_id }) = event {
                    push_notice(&inner, &session_id, "terminated", false).await;
                }
            }
            event = errors.recv() => {
                if let Ok(Event::ErrorRaised { session_id, kind, message }) = event {
                    if error_allowed(&inner, &session_id).await {
                        let payload = format!("{kind}: {message}");
                        publish_chunk(&inner, &session_id, ChunkKind::Error, &payload).await;
                    }
                }
            }
        }
    }
}

/// Append one chunk with the session's next sequence, persisting the
/// counter so restarts keep the stream strictly increasing.
async fn publish_chunk(inner: &Arc<StreamInner>, session_id: &str, kind: ChunkKind, payload: &str) {
    let seq_key = format!("outseq/{session_id}");
    let sequence = {
        let mut sequences = inner.sequences.lock().await;
        let next = match sequences.get(session_id) {
            Some(n) => n + 1,
            None => inner.store.checkpoint(&seq_key).unwrap_or(0) + 1,
        };
        sequences.insert(session_id.to_owned(), next);
        next
    };
    if let Err(e) = inner.store.set_checkpoint(&seq_key, sequence) {
        debug!(err = %e, "sequence persist failed");
    }

    let chunk = OutputChunk {
        session_id: session_id.to_owned(),
        sequence,
        chunk_kind: kind,
        payload: payload.to_owned(),
        ts: now_ms(),
        origin: inner.local.clone(),
    };
    let Ok(bytes) = wire::encode(&WireEntry::Output(chunk)) else { return };
    if let Err(e) = inner.streams.append(&keys::output(session_id), bytes).await {
        warn!(session = %session_id, err = %e, "output append failed");
    }
}

async fn summary_of(inner: &Arc<StreamInner>, session_id: &str) -> SessionSummary {
    match inner.store.get(session_id) {
        Ok(record) => SessionSummary::from(&record),
        Err(_) => SessionSummary {
            session_id: session_id.to_owned(),
            computer: inner.local.clone(),
            project_path: String::new(),
            agent: String::new(),
            thinking_mode: String::new(),
            status: crate::store::SessionStatus::Running,
            title: String::new(),
            last_output_summary: None,
            last_activity_at: now_ms(),
        },
    }
}

/// Forward a session notice to every online peer whose interests cover
/// the sessions class. Uninterested peers generate no traffic.
async fn push_notice(inner: &Arc<StreamInner>, session_id: &str, event: &str, throttled: bool) {
    if throttled {
        let mut clock = inner.notice_clock.lock().await;
        let due = clock
            .get(session_id)
            .map(|t| t.elapsed() >= NOTICE_GAP)
            .unwrap_or(true);
        if !due {
            return;
        }
        clock.insert(session_id.to_owned(), Instant::now());
    }

    let Ok(record) = inner.store.get(session_id) else { return };
    if record.computer != inner.local {
        return;
    }
    let notice = SessionNotice {
        event: event.to_owned(),
        session: SessionSummary::from(&record),
        ts: now_ms(),
        origin: inner.local.clone(),
    };
    let Ok(payload) = wire::encode(&WireEntry::Session(notice)) else { return };

    for peer in inner.registry.list_online(None).await {
        if peer.name == inner.local || !peer.interests.iter().any(|i| i == SESSIONS_TOPIC) {
            continue;
        }
        let key = keys::push(&peer.name, SESSIONS_TOPIC);
        if let Err(e) = inner.streams.append(&key, payload.clone()).await {
            debug!(peer = %peer.name, err = %e, "push append failed");
        }
    }
}

async fn error_allowed(inner: &Arc<StreamInner>, session_id: &str) -> bool {
    let mut budget = inner.error_budget.lock().await;
    let entry = budget.entry(session_id.to_owned()).or_insert((Instant::now(), 0));
    if entry.0.elapsed() >= Duration::from_secs(60) {
        *entry = (Instant::now(), 0);
    }
    if entry.1 >= ERROR_BUDGET {
        return false;
    }
    entry.1 += 1;
    true
}

/// Consume this node's push stream: mirror remote sessions into the
/// store/cache and manage one observer pump per live remote session.
async fn push_pump_loop(inner: Arc<StreamInner>, cancel: CancellationToken) {
    let key = keys::push(&inner.local, SESSIONS_TOPIC);
    let mut cursor = inner.store.checkpoint(&key).unwrap_or(0);

    loop {
        if cancel.is_cancelled() {
            return;
        }
        let batch = match inner.streams.read_after(&key, cursor, 32).await {
            Ok(batch) => batch,
            Err(e) => {
                debug!(err = %e, "push read failed");
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(1)) => continue,
                    _ = cancel.cancelled() => return,
                }
            }
        };

        let had_entries = !batch.entries.is_empty();
        for entry in &batch.entries {
            let Ok(WireEntry::Session(notice)) = wire::decode(&entry.payload) else {
                continue;
            };
            if notice.session.computer == inner.local {
                continue;
            }
            if let Err(e) = inner.store.upsert_remote_session(&notice.session) {
                debug!(err = %e, "remote mirror upsert failed");
            }
            inner.activity.put_session(notice.session.clone()).await;

            match notice.event.as_str() {
                "started" => spawn_observer(&inner, &notice.session.session_id, &cancel).await,
                "terminated" => {
                    if let Some(c) =
                        inner.observers.lock().await.remove(&notice.session.session_id)
                    {
                        c.cancel();
                    }
                }
                _ => {}
            }
        }

        if batch.cursor != cursor {
            cursor = batch.cursor;
            if let Err(e) = inner.store.set_checkpoint(&key, cursor) {
                debug!(err = %e, "push checkpoint write failed");
            }
        }
        if !had_entries {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(250)) => {}
                _ = cancel.cancelled() => return,
            }
        }
    }
}

async fn spawn_observer(inner: &Arc<StreamInner>, session_id: &str, parent: &CancellationToken) {
    let mut observers = inner.observers.lock().await;
    if observers.contains_key(session_id) {
        return;
    }
    let cancel = parent.child_token();
    observers.insert(session_id.to_owned(), cancel.clone());
    let pump = ObserverPump::new(
        Arc::clone(&inner.streams),
        Arc::clone(&inner.store),
        Arc::clone(&inner.hub),
        session_id,
    );
    tokio::spawn(pump.run(cancel));
    debug!(session = %session_id, "observer pump spawned");
}

#[cfg(test)]
#[path = "stream_tests.rs"]
mod tests;
