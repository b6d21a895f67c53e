// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! In-process event hub: named events over per-event broadcast channels.
//!
//! Components emit and subscribe without holding references to each
//! other. Emission is non-blocking and never fails the emitter; delivery
//! to each individual subscriber preserves emission order. There is no
//! cross-subscriber ordering guarantee.

use std::collections::HashMap;

use bytes::Bytes;
use tokio::sync::broadcast;
use tracing::trace;

use crate::wire::{CommandEnvelope, HeartbeatRecord, OutputChunk};

/// Names of the events carried by the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    InputReceived,
    OutputUpdated,
    SessionStarted,
    SessionTerminated,
    AgentToolUse,
    AgentToolDone,
    AgentStop,
    AgentIdle,
    HeartbeatReceived,
    PeerSeen,
    PeerLost,
    RemoteCommandReceived,
    RemoteOutputChunk,
    OutputTruncated,
    ErrorRaised,
}

impl EventKind {
    /// All event names, used to build the channel table once at startup.
    pub const ALL: &'static [EventKind] = &[
        Self::InputReceived,
        Self::OutputUpdated,
        Self::SessionStarted,
        Self::SessionTerminated,
        Self::AgentToolUse,
        Self::AgentToolDone,
        Self::AgentStop,
        Self::AgentIdle,
        Self::HeartbeatReceived,
        Self::PeerSeen,
        Self::PeerLost,
        Self::RemoteCommandReceived,
        Self::RemoteOutputChunk,
        Self::OutputTruncated,
        Self::ErrorRaised,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InputReceived => "input_received",
            Self::OutputUpdated => "output_updated",
            Self::SessionStarted => "session_started",
            Self::SessionTerminated => "session_terminated",
            Self::AgentToolUse => "agent_tool_use",
            Self::AgentToolDone => "agent_tool_done",
            Self::AgentStop => "agent_stop",
            Self::AgentIdle => "agent_idle",
            Self::HeartbeatReceived => "heartbeat_received",
            Self::PeerSeen => "peer_seen",
            Self::PeerLost => "peer_lost",
            Self::RemoteCommandReceived => "remote_command_received",
            Self::RemoteOutputChunk => "remote_output_chunk",
            Self::OutputTruncated => "output_truncated",
            Self::ErrorRaised => "error_raised",
        }
    }
}

/// A chat-adapter user attached to an incoming input event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatUser {
    /// Adapter-scoped user id (e.g. the Telegram numeric id as a string).
    pub adapter_user_id: String,
    pub display_name: Option<String>,
}

/// New output produced by a local session since the last poll tick.
#[derive(Debug, Clone)]
pub struct OutputUpdate {
    pub session_id: String,
    /// Strictly increasing per session; also used as the output-stream
    /// chunk sequence.
    pub sequence: u64,
    pub bytes: Bytes,
    /// Short rendering of the newest output (last non-empty line or tail).
    pub summary: String,
    /// Bridge cursor after this read, for resuming.
    pub cursor: u64,
}

/// Events delivered through the hub.
#[derive(Debug, Clone)]
pub enum Event {
    InputReceived {
        origin_adapter: String,
        /// `None` when the input should start a new session (e.g. a fresh DM).
        session_id: Option<String>,
        user: Option<ChatUser>,
        text: String,
    },
    OutputUpdated(OutputUpdate),
    SessionStarted { session_id: String, computer: String },
    SessionTerminated { session_id: String },
    AgentToolUse { session_id: String, tool: String },
    AgentToolDone { session_id: String, tool: String },
    AgentStop { session_id: String },
    AgentIdle { session_id: String },
    HeartbeatReceived(HeartbeatRecord),
    PeerSeen { computer: String },
    PeerLost { computer: String },
    RemoteCommandReceived(CommandEnvelope),
    RemoteOutputChunk(OutputChunk),
    OutputTruncated { session_id: String, from_sequence: u64, to_sequence: u64 },
    /// A failure adapters should display, rendered uniformly as an
    /// `error` chunk on the session's output stream.
    ErrorRaised { session_id: String, kind: crate::error::ErrorKind, message: String },
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::InputReceived { .. } => EventKind::InputReceived,
            Self::OutputUpdated(_) => EventKind::OutputUpdated,
            Self::SessionStarted { .. } => EventKind::SessionStarted,
            Self::SessionTerminated { .. } => EventKind::SessionTerminated,
            Self::AgentToolUse { .. } => EventKind::AgentToolUse,
            Self::AgentToolDone { .. } => EventKind::AgentToolDone,
            Self::AgentStop { .. } => EventKind::AgentStop,
            Self::AgentIdle { .. } => EventKind::AgentIdle,
            Self::HeartbeatReceived(_) => EventKind::HeartbeatReceived,
            Self::PeerSeen { .. } => EventKind::PeerSeen,
            Self::PeerLost { .. } => EventKind::PeerLost,
            Self::RemoteCommandReceived(_) => EventKind::RemoteCommandReceived,
            Self::RemoteOutputChunk(_) => EventKind::RemoteOutputChunk,
            Self::OutputTruncated { .. } => EventKind::OutputTruncated,
            Self::ErrorRaised { .. } => EventKind::ErrorRaised,
        }
    }
}

/// The hub itself: one broadcast channel per event name, built once.
///
/// Emitting and subscribing are constant-time and never suspend.
pub struct EventHub {
    channels: HashMap<EventKind, broadcast::Sender<Event>>,
}

impl EventHub {
    /// Build the channel table with the given per-event buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let mut channels = HashMap::with_capacity(EventKind::ALL.len());
        for kind in EventKind::ALL {
            let (tx, _) = broadcast::channel(capacity);
            channels.insert(*kind, tx);
        }
        Self { channels }
    }

    /// Emit an event to every current subscriber of its name.
    ///
    /// A missing subscriber is not an error; a lagging subscriber drops
    /// its oldest buffered events (the receiver observes the lag).
    pub fn emit(&self, event: Event) {
        let kind = event.kind();
        if let Some(tx) = self.channels.get(&kind) {
            let delivered = tx.send(event).unwrap_or(0);
            trace!(event = kind.as_str(), subscribers = delivered, "hub emit");
        }
    }

    /// Subscribe to one event name.
    pub fn subscribe(&self, kind: EventKind) -> broadcast::Receiver<Event> {
        match self.channels.get(&kind) {
            Some(tx) => tx.subscribe(),
            // ALL covers every kind; this arm is unreachable but cheap.
            None => broadcast::channel(1).1,
        }
    }

    /// Number of live subscribers for one event name.
    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.channels.get(&kind).map(|tx| tx.receiver_count()).unwrap_or(0)
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
#[path = "hub_tests.rs"]
mod tests;
