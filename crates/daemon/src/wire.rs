// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Wire format for the shared stream store: command envelopes, output
//! chunks, and heartbeat records, plus the stream key grammar.
//!
//! Every entry is a JSON object with a `kind` discriminator, a `ts`
//! (epoch milliseconds at the producing node), and an `origin`
//! (producing computer). Encoding then decoding any entry yields the
//! original value.

use serde::{Deserialize, Serialize};

use crate::error::Fault;

/// Commands a node accepts on its inbox stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    StartSession,
    SendMessage,
    EndSession,
    ListSessions,
    GetStatus,
}

impl CommandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StartSession => "start_session",
            Self::SendMessage => "send_message",
            Self::EndSession => "end_session",
            Self::ListSessions => "list_sessions",
            Self::GetStatus => "get_status",
        }
    }
}

/// Classification of a single entry on a session's output stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkKind {
    Chunk,
    ToolUse,
    ToolDone,
    AgentStop,
    AgentNotification,
    Error,
    InterestWindowClosed,
}

/// A command enqueued on a target node's inbox stream.
///
/// `id` is the correlation id: the receiver deduplicates by it when the
/// stream is re-read, and replays record the original reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub id: String,
    pub command: CommandKind,
    pub target: String,
    pub args: serde_json::Value,
    pub reply_stream: String,
    pub ts: u64,
    pub origin: String,
}

/// One entry on a session's output stream. `sequence` is strictly
/// increasing within the stream; the owning node is the only writer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputChunk {
    pub session_id: String,
    pub sequence: u64,
    pub chunk_kind: ChunkKind,
    pub payload: String,
    pub ts: u64,
    pub origin: String,
}

/// Liveness advertisement stored under `heartbeat/<computer>` with a TTL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatRecord {
    pub computer: String,
    #[serde(default)]
    pub caps: Vec<String>,
    #[serde(default)]
    pub interests: Vec<String>,
    pub ts: u64,
}

/// Reply to a command, appended to the caller-supplied reply stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandReply {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<crate::error::ErrorBody>,
    pub ts: u64,
    pub origin: String,
}

/// A session lifecycle notice forwarded to interested peers on their
/// push streams.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionNotice {
    /// `started`, `updated`, or `terminated`.
    pub event: String,
    pub session: crate::store::SessionSummary,
    pub ts: u64,
    pub origin: String,
}

/// Any entry that can appear on a stream-store key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WireEntry {
    Command(CommandEnvelope),
    Output(OutputChunk),
    Heartbeat(HeartbeatRecord),
    Reply(CommandReply),
    Session(SessionNotice),
}

/// Encode a wire entry to JSON bytes.
pub fn encode(entry: &WireEntry) -> Result<Vec<u8>, Fault> {
    serde_json::to_vec(entry).map_err(|e| Fault::permanent(format!("encode failed: {e}")))
}

/// Decode JSON bytes into a wire entry.
pub fn decode(bytes: &[u8]) -> Result<WireEntry, Fault> {
    serde_json::from_slice(bytes).map_err(|e| Fault::permanent(format!("malformed wire entry: {e}")))
}

/// Current time as epoch milliseconds.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Stream key grammar. Keys are logically owned: an inbox by its target
/// node, an output stream by the session's node.
pub mod keys {
    /// Per-node command inbox.
    pub fn inbox(computer: &str) -> String {
        format!("inbox/{computer}")
    }

    /// Per-session output stream.
    pub fn output(session_id: &str) -> String {
        format!("output/{session_id}")
    }

    /// Expiring heartbeat key for one node.
    pub fn heartbeat(computer: &str) -> String {
        format!("heartbeat/{computer}")
    }

    /// Prefix scanned when collecting all live heartbeats.
    pub const HEARTBEAT_PREFIX: &str = "heartbeat/";

    /// Per-peer interest push stream.
    pub fn push(computer: &str, topic: &str) -> String {
        format!("push/{computer}/{topic}")
    }

    /// Reply stream for one command invocation.
    pub fn reply(correlation_id: &str) -> String {
        format!("reply/{correlation_id}")
    }

    /// Extract the computer name from a heartbeat key.
    pub fn heartbeat_computer(key: &str) -> Option<&str> {
        key.strip_prefix(HEARTBEAT_PREFIX).filter(|s| !s.is_empty())
    }
}

#[cfg(test)]
#[path = "wire_tests.rs"]
mod tests;
