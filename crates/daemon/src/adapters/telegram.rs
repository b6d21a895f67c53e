// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Telegram supergroup adapter.
//!
//! One supergroup is the mesh rendezvous: a control topic carries the
//! pinned per-node roster, every session gets its own forum topic, and
//! DMs from known people route a session's output into the DM chat.
//! Streaming output is rendered by editing a small set of live messages
//! per session rather than flooding the chat.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::{MessageId, ThreadId};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapter::{Adapter, Capability};
use crate::error::Fault;
use crate::hub::{ChatUser, Event, EventHub, EventKind};
use crate::store::{SessionRecord, SessionStore};

/// Minimum interval between edits of one live message, to stay inside
/// chat API limits.
const EDIT_THROTTLE: Duration = Duration::from_millis(500);

/// Telegram message size ceiling, with headroom for the code fence.
const MAX_TEXT: usize = 3900;

/// Compose a session topic title: `[computer] agent/mode — title`.
pub fn topic_title(record: &SessionRecord) -> String {
    let mode = if record.thinking_mode.is_empty() {
        record.agent.clone()
    } else {
        format!("{}/{}", record.agent, record.thinking_mode)
    };
    let mut title = format!("[{}] {}", record.computer, mode);
    if !record.title.is_empty() {
        title.push_str(" — ");
        title.push_str(&record.title);
    }
    title
}

/// Render the live output body for a session topic.
pub fn render_output(summary: &str) -> String {
    let mut body = summary.to_owned();
    if body.len() > MAX_TEXT {
        let cut = body
            .char_indices()
            .map(|(i, _)| i)
            .take_while(|&i| i <= MAX_TEXT)
            .last()
            .unwrap_or(0);
        body.truncate(cut);
        body.insert_str(0, "…");
    }
    if body.is_empty() {
        "(no output yet)".to_owned()
    } else {
        body
    }
}

/// Render the pinned roster for one node's view of the mesh.
pub fn render_roster(local: &str, peers: &[(String, bool)]) -> String {
    let mut lines = vec![format!("TeleClaude roster — reported by {local}")];
    let mut sorted: Vec<&(String, bool)> = peers.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));
    for (name, online) in sorted {
        let dot = if *online { "●" } else { "○" };
        lines.push(format!("{dot} {name}"));
    }
    lines.join("\n")
}

/// Find the session owning a forum thread in the adapter metadata.
pub fn session_for_thread(sessions: &[SessionRecord], thread: i32) -> Option<&SessionRecord> {
    sessions.iter().find(|record| {
        record.adapter_meta["telegram"]["topic_id"].as_i64() == Some(thread as i64)
    })
}

/// Find the session bound to a DM user.
pub fn session_for_dm_user<'a>(
    sessions: &'a [SessionRecord],
    user_id: &str,
) -> Option<&'a SessionRecord> {
    sessions.iter().find(|record| {
        record.status != crate::store::SessionStatus::Terminated
            && record.adapter_meta["telegram"]["dm_user_id"].as_str() == Some(user_id)
    })
}

struct LiveMessage {
    chat: ChatId,
    thread: Option<ThreadId>,
    message: Option<MessageId>,
    last_edit: Option<Instant>,
    pending: Option<String>,
}

struct TgInner {
    bot: Bot,
    chat: ChatId,
    control_thread: Option<ThreadId>,
    hub: Arc<EventHub>,
    store: Arc<SessionStore>,
    local: String,
    /// DM chat ids learned from the incoming pump, keyed by user id.
    dm_chats: Mutex<HashMap<String, i64>>,
    /// The DM user whose next provisioned session binds to their chat.
    pending_dm: Mutex<Option<(String, i64)>>,
    live: Mutex<HashMap<String, LiveMessage>>,
    roster_message: Mutex<Option<MessageId>>,
    peers_seen: Mutex<HashMap<String, bool>>,
    cancel: Mutex<Option<CancellationToken>>,
    started: AtomicBool,
}

pub struct TelegramAdapter {
    inner: Arc<TgInner>,
}

impl TelegramAdapter {
    pub fn new(
        token: &str,
        chat_id: i64,
        control_topic_id: Option<i32>,
        hub: Arc<EventHub>,
        store: Arc<SessionStore>,
        local: &str,
    ) -> Self {
        Self {
            inner: Arc::new(TgInner {
                bot: Bot::new(token),
                chat: ChatId(chat_id),
                control_thread: control_topic_id.map(|id| ThreadId(MessageId(id))),
                hub,
                store,
                local: local.to_owned(),
                dm_chats: Mutex::new(HashMap::new()),
                pending_dm: Mutex::new(None),
                live: Mutex::new(HashMap::new()),
                roster_message: Mutex::new(None),
                peers_seen: Mutex::new(HashMap::new()),
                cancel: Mutex::new(None),
                started: AtomicBool::new(false),
            }),
        }
    }
}

#[async_trait]
impl Adapter for TelegramAdapter {
    fn name(&self) -> &'static str {
        "telegram"
    }

    fn capabilities(&self) -> &'static [Capability] {
        &[Capability::Ui, Capability::Discovery]
    }

    async fn start(&self) -> Result<(), Fault> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let cancel = CancellationToken::new();
        *self.inner.cancel.lock().await = Some(cancel.clone());

        let inner = Arc::clone(&self.inner);
        tokio::spawn(run_dispatcher(inner, cancel.clone()));

        let inner = Arc::clone(&self.inner);
        tokio::spawn(run_renderer(inner, cancel.clone()));

        let inner = Arc::clone(&self.inner);
        tokio::spawn(run_roster(inner, cancel));

        info!(chat = self.inner.chat.0, "telegram adapter started");
        Ok(())
    }

    async fn stop(&self) {
        if let Some(cancel) = self.inner.cancel.lock().await.take() {
            cancel.cancel();
        }
        self.inner.started.store(false, Ordering::SeqCst);
    }

    /// A DM-initiated session binds to the requesting user's DM chat;
    /// anything else gets its own forum topic.
    async fn provision_session(
        &self,
        session: &SessionRecord,
    ) -> Result<Option<serde_json::Value>, Fault> {
        if let Some((user_id, chat_id)) = self.inner.pending_dm.lock().await.take() {
            return Ok(Some(serde_json::json!({
                "dm_chat_id": chat_id,
                "dm_user_id": user_id,
            })));
        }

        let title = topic_title(session);
        match self
            .inner
            .bot
            .create_forum_topic(self.inner.chat, &title, 0u32, String::new())
            .await
        {
            Ok(topic) => Ok(Some(serde_json::json!({
                "topic_id": topic.thread_id.0 .0,
                "chat_id": self.inner.chat.0,
            }))),
            Err(e) => Err(Fault::transient(format!("create_forum_topic: {e}"))),
        }
    }

    async fn finalize_session(&self, session: &SessionRecord) {
        self.inner.live.lock().await.remove(&session.session_id);
        if let Some(topic) = session.adapter_meta["telegram"]["topic_id"].as_i64() {
            let thread = ThreadId(MessageId(topic as i32));
            if let Err(e) = self.inner.bot.close_forum_topic(self.inner.chat, thread).await {
                debug!(session = %session.session_id, err = %e, "close_forum_topic failed");
            }
        }
    }
}

/// Incoming pump: supergroup topic messages route to their session, DMs
/// route to (or create) the user's DM session.
async fn run_dispatcher(inner: Arc<TgInner>, cancel: CancellationToken) {
    let bot = inner.bot.clone();
    let handler = Update::filter_message().endpoint({
        let inner = Arc::clone(&inner);
        move |_bot: Bot, msg: Message| {
            let inner = Arc::clone(&inner);
            async move {
                handle_message(&inner, &msg).await;
                anyhow::Ok(())
            }
        }
    });

    let mut dispatcher = Dispatcher::builder(bot, handler).build();
    tokio::select! {
        _ = dispatcher.dispatch() => {}
        _ = cancel.cancelled() => {
            debug!("telegram dispatcher shutting down");
        }
    }
}

async fn handle_message(inner: &Arc<TgInner>, msg: &Message) {
    let Some(text) = msg.text() else { return };
    let user = msg.from.as_ref();
    let user_id = user.map(|u| u.id.0.to_string()).unwrap_or_default();

    if msg.chat.is_private() {
        inner.dm_chats.lock().await.insert(user_id.clone(), msg.chat.id.0);

        let sessions = inner.store.list_local(&Default::default()).unwrap_or_default();
        let session_id = session_for_dm_user(&sessions, &user_id).map(|r| r.session_id.clone());
        if session_id.is_none() {
            // The lifecycle will call provision_session while this is set.
            *inner.pending_dm.lock().await = Some((user_id.clone(), msg.chat.id.0));
        }
        inner.hub.emit(Event::InputReceived {
            origin_adapter: "telegram".to_owned(),
            session_id,
            user: Some(ChatUser {
                adapter_user_id: user_id,
                display_name: user.map(|u| u.full_name()),
            }),
            text: format!("{text}\r"),
        });
        return;
    }

    if msg.chat.id != inner.chat {
        return;
    }

    // Control-topic commands.
    if msg.thread_id == inner.control_thread && text.starts_with("/sessions") {
        let sessions = inner.store.list_all(&Default::default()).unwrap_or_default();
        let mut lines: Vec<String> = sessions
            .iter()
            .map(|r| format!("{} [{}] {} — {}", r.session_id, r.computer, r.agent, r.status.as_str()))
            .collect();
        if lines.is_empty() {
            lines.push("no sessions".to_owned());
        }
        let mut reply = inner.bot.send_message(inner.chat, lines.join("\n"));
        if let Some(thread) = msg.thread_id {
            reply = reply.message_thread_id(thread);
        }
        if let Err(e) = reply.await {
            debug!(err = %e, "control reply failed");
        }
        return;
    }

    // Topic message → session input. "/interrupt" becomes the double
    // Ctrl-C the lifecycle delivers as a spaced signal pair.
    let Some(thread) = msg.thread_id else { return };
    let payload = if text.trim() == "/interrupt" {
        "\u{3}\u{3}".to_owned()
    } else {
        format!("{text}\r")
    };
    let sessions = inner.store.list_local(&Default::default()).unwrap_or_default();
    match session_for_thread(&sessions, thread.0 .0) {
        Some(record) => {
            inner.hub.emit(Event::InputReceived {
                origin_adapter: "telegram".to_owned(),
                session_id: Some(record.session_id.clone()),
                user: Some(ChatUser {
                    adapter_user_id: user_id,
                    display_name: user.map(|u| u.full_name()),
                }),
                text: payload,
            });
        }
        None => debug!(thread = thread.0 .0, "message in unowned topic"),
    }
}

/// Rendering pump: maintains one live, edit-throttled message per
/// session and flushes pending content on the next update.
async fn run_renderer(inner: Arc<TgInner>, cancel: CancellationToken) {
    let mut output = inner.hub.subscribe(EventKind::OutputUpdated);
    let mut errors = inner.hub.subscribe(EventKind::ErrorRaised);
    let mut flush = tokio::time::interval(EDIT_THROTTLE);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            event = output.recv() => {
                if let Ok(Event::OutputUpdated(update)) = event {
                    render_session(&inner, &update.session_id, render_output(&update.summary)).await;
                }
            }
            event = errors.recv() => {
                if let Ok(Event::ErrorRaised { session_id, kind, message }) = event {
                    render_session(&inner, &session_id, format!("⚠ {kind}: {message}")).await;
                }
            }
            _ = flush.tick() => {
                flush_pending(&inner).await;
            }
        }
    }
}

async fn render_session(inner: &Arc<TgInner>, session_id: &str, body: String) {
    let mut live = inner.live.lock().await;
    if !live.contains_key(session_id) {
        let Ok(record) = inner.store.get(session_id) else { return };
        let meta = &record.adapter_meta["telegram"];
        let (chat, thread) = if let Some(dm) = meta["dm_chat_id"].as_i64() {
            (ChatId(dm), None)
        } else if let Some(topic) = meta["topic_id"].as_i64() {
            (inner.chat, Some(ThreadId(MessageId(topic as i32))))
        } else {
            return;
        };
        live.insert(
            session_id.to_owned(),
            LiveMessage { chat, thread, message: None, last_edit: None, pending: None },
        );
    }
    let Some(entry) = live.get_mut(session_id) else { return };

    let due = entry.last_edit.map(|t| t.elapsed() >= EDIT_THROTTLE).unwrap_or(true);
    if !due {
        entry.pending = Some(body);
        return;
    }
    push_live(inner, entry, body).await;
}

async fn flush_pending(inner: &Arc<TgInner>) {
    let mut live = inner.live.lock().await;
    for entry in live.values_mut() {
        let due = entry.last_edit.map(|t| t.elapsed() >= EDIT_THROTTLE).unwrap_or(true);
        if due {
            if let Some(body) = entry.pending.take() {
                push_live(inner, entry, body).await;
            }
        }
    }
}

async fn push_live(inner: &Arc<TgInner>, entry: &mut LiveMessage, body: String) {
    entry.last_edit = Some(Instant::now());
    match entry.message {
        Some(message) => {
            if let Err(e) = inner.bot.edit_message_text(entry.chat, message, &body).await {
                debug!(err = %e, "live edit failed");
            }
        }
        None => {
            let mut send = inner.bot.send_message(entry.chat, &body);
            if let Some(thread) = entry.thread {
                send = send.message_thread_id(thread);
            }
            match send.await {
                Ok(sent) => entry.message = Some(sent.id),
                Err(e) => warn!(err = %e, "live send failed"),
            }
        }
    }
}

/// Roster pump: mirrors peer liveness into a pinned control-topic
/// message. Presentation only — the registry never reads it back.
async fn run_roster(inner: Arc<TgInner>, cancel: CancellationToken) {
    let mut seen = inner.hub.subscribe(EventKind::PeerSeen);
    let mut lost = inner.hub.subscribe(EventKind::PeerLost);
    let mut refresh = tokio::time::interval(Duration::from_secs(60));

    loop {
        let dirty = tokio::select! {
            _ = cancel.cancelled() => return,
            event = seen.recv() => {
                if let Ok(Event::PeerSeen { computer }) = event {
                    inner.peers_seen.lock().await.insert(computer, true);
                }
                true
            }
            event = lost.recv() => {
                if let Ok(Event::PeerLost { computer }) = event {
                    inner.peers_seen.lock().await.insert(computer, false);
                }
                true
            }
            _ = refresh.tick() => true,
        };
        if dirty {
            update_roster(&inner).await;
        }
    }
}

async fn update_roster(inner: &Arc<TgInner>) {
    let peers: Vec<(String, bool)> = {
        let map = inner.peers_seen.lock().await;
        map.iter().map(|(k, v)| (k.clone(), *v)).collect()
    };
    let text = render_roster(&inner.local, &peers);

    let mut roster = inner.roster_message.lock().await;
    match *roster {
        Some(message) => {
            if let Err(e) = inner.bot.edit_message_text(inner.chat, message, &text).await {
                debug!(err = %e, "roster edit failed");
            }
        }
        None => {
            let mut send = inner.bot.send_message(inner.chat, &text);
            if let Some(thread) = inner.control_thread {
                send = send.message_thread_id(thread);
            }
            match send.await {
                Ok(sent) => {
                    if let Err(e) = inner.bot.pin_chat_message(inner.chat, sent.id).await {
                        debug!(err = %e, "roster pin failed");
                    }
                    *roster = Some(sent.id);
                }
                Err(e) => debug!(err = %e, "roster send failed"),
            }
        }
    }
}

#[cfg(test)]
#[path = "telegram_tests.rs"]
mod tests;
