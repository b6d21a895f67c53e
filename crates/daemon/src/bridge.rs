// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Terminal bridge: one named tmux session per logical session,
//! persisting across daemon restarts.
//!
//! The bridge shells out to tmux for every operation. Reads are
//! capture-based: each `read_since` captures the pane, diffs against the
//! previous capture, and appends the delta to a bounded per-handle tail
//! buffer. Cursors index the total bytes ever appended; a cursor that
//! has fallen behind the retained tail comes back `truncated`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{ErrorKind, Fault};

/// Name prefix for tmux sessions owned by the daemon.
pub const SESSION_PREFIX: &str = "tc-";

/// Attempts for a transient tmux invocation before giving up.
const TMUX_RETRIES: u32 = 3;

/// Opaque reference to one live multiplexer session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalHandle {
    pub session_id: String,
    pub tmux_name: String,
}

impl TerminalHandle {
    pub fn for_session(session_id: &str) -> Self {
        Self { session_id: session_id.to_owned(), tmux_name: format!("{SESSION_PREFIX}{session_id}") }
    }

    /// Reconstruct a handle from a tmux session name left by a prior run.
    pub fn from_tmux_name(name: &str) -> Option<Self> {
        let session_id = name.strip_prefix(SESSION_PREFIX)?;
        if session_id.is_empty() {
            return None;
        }
        Some(Self { session_id: session_id.to_owned(), tmux_name: name.to_owned() })
    }
}

/// Result of a `read_since` call.
#[derive(Debug, Clone)]
pub struct ReadChunk {
    pub bytes: Bytes,
    /// Cursor to pass to the next read.
    pub cursor: u64,
    /// True when the requested cursor had fallen behind the retained
    /// tail; `bytes` is the largest suffix still available.
    pub truncated: bool,
}

/// Signals deliverable to the session's foreground process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeSignal {
    /// Single Ctrl-C.
    Interrupt,
    /// Two Ctrl-C presses spaced by a short delay, to defeat input-mode
    /// capture by full-screen programs.
    InterruptTwice,
}

/// Failures surfaced by [`TerminalBridge::create`].
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeError {
    /// The multiplexer is missing or persistently unreachable.
    Unavailable(String),
    /// A session with this name already exists and is not claimable.
    NameCollision(String),
    /// The child process exited within the warm-up window.
    StartupFailed(String),
}

impl std::fmt::Display for BridgeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unavailable(m) => write!(f, "bridge unavailable: {m}"),
            Self::NameCollision(m) => write!(f, "name collision: {m}"),
            Self::StartupFailed(m) => write!(f, "startup failed: {m}"),
        }
    }
}

impl std::error::Error for BridgeError {}

impl From<BridgeError> for Fault {
    fn from(err: BridgeError) -> Self {
        match &err {
            BridgeError::Unavailable(m) => Fault::bridge(m.clone()),
            BridgeError::NameCollision(m) => Fault::conflict(m.clone()),
            BridgeError::StartupFailed(m) => Fault::new(ErrorKind::BridgeUnavailable, m.clone()),
        }
    }
}

/// Abstraction over the terminal multiplexer so the lifecycle and
/// polling coordinators are testable without tmux.
#[async_trait]
pub trait TerminalBridge: Send + Sync {
    async fn create(
        &self,
        session_id: &str,
        project_path: &Path,
        command: &[String],
        width: u16,
        height: u16,
    ) -> Result<TerminalHandle, BridgeError>;

    /// Append keystrokes. Newline handling is literal — callers decide
    /// whether to send CR.
    async fn write(&self, handle: &TerminalHandle, bytes: &[u8]) -> Result<(), Fault>;

    async fn read_since(&self, handle: &TerminalHandle, cursor: u64) -> Result<ReadChunk, Fault>;

    async fn resize(&self, handle: &TerminalHandle, width: u16, height: u16) -> Result<(), Fault>;

    async fn signal(&self, handle: &TerminalHandle, signal: BridgeSignal) -> Result<(), Fault>;

    /// Enumerate sessions left over from prior runs.
    async fn list(&self) -> Result<Vec<TerminalHandle>, Fault>;

    /// Best-effort kill of the multiplexer session.
    async fn close(&self, handle: &TerminalHandle) -> Result<(), Fault>;

    async fn is_alive(&self, handle: &TerminalHandle) -> bool;
}

/// Compute the byte delta between the previous and current pane capture.
///
/// Returns `None` when nothing changed. A capture that no longer extends
/// the previous one (scrolled, cleared, redrawn) is emitted as a full
/// frame prefixed by a home+clear sequence so downstream terminals
/// repaint cleanly.
pub fn capture_delta(last: &str, capture: &str) -> Option<Vec<u8>> {
    if capture == last {
        return None;
    }
    if capture.len() > last.len() && capture.starts_with(last) {
        return Some(capture.as_bytes()[last.len()..].to_vec());
    }
    let mut frame = b"\x1b[H\x1b[2J".to_vec();
    frame.extend_from_slice(capture.as_bytes());
    Some(frame)
}

/// Bounded append-only tail: retains the newest `cap` bytes together
/// with the absolute offset of its first retained byte.
#[derive(Debug)]
pub struct TailBuffer {
    buf: Vec<u8>,
    base: u64,
    cap: usize,
}

impl TailBuffer {
    pub fn new(cap: usize) -> Self {
        Self { buf: Vec::new(), base: 0, cap }
    }

    /// Total bytes ever appended.
    pub fn total(&self) -> u64 {
        self.base + self.buf.len() as u64
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
        if self.buf.len() > self.cap {
            let drop = self.buf.len() - self.cap;
            self.buf.drain(..drop);
            self.base += drop as u64;
        }
    }

    /// Bytes from `cursor` to the end. A cursor behind `base` returns the
    /// whole retained tail flagged as truncated; a cursor beyond the end
    /// clamps to empty.
    pub fn read_from(&self, cursor: u64) -> (Vec<u8>, bool) {
        if cursor < self.base {
            return (self.buf.clone(), true);
        }
        let start = (cursor - self.base) as usize;
        if start >= self.buf.len() {
            return (Vec::new(), false);
        }
        (self.buf[start..].to_vec(), false)
    }
}

/// Per-handle capture bookkeeping.
struct PaneTail {
    last_capture: String,
    tail: TailBuffer,
}

/// tmux-backed bridge. An isolated server socket (`-S`) keeps tests and
/// parallel daemons from colliding with the user's default server.
pub struct TmuxBridge {
    socket: Option<PathBuf>,
    warmup: Duration,
    tail_capacity: usize,
    panes: Mutex<HashMap<String, PaneTail>>,
}

impl TmuxBridge {
    pub fn new() -> Self {
        Self::with_socket(None)
    }

    pub fn with_socket(socket: Option<PathBuf>) -> Self {
        Self {
            socket,
            warmup: Duration::from_millis(400),
            tail_capacity: 1 << 20,
            panes: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_warmup(mut self, warmup: Duration) -> Self {
        self.warmup = warmup;
        self
    }

    fn tmux(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new("tmux");
        if let Some(ref s) = self.socket {
            cmd.arg("-S").arg(s);
        }
        cmd
    }

    /// Run a tmux invocation, retrying transient failures with bounded
    /// backoff. A missing binary is permanent and reported immediately.
    async fn run_tmux(&self, args: &[&str]) -> Result<std::process::Output, Fault> {
        let mut delay = Duration::from_millis(50);
        let mut last_err = String::new();
        for attempt in 0..TMUX_RETRIES {
            match self.tmux().args(args).output().await {
                Ok(out) => return Ok(out),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(Fault::bridge("tmux is not installed or not in PATH"));
                }
                Err(e) => {
                    last_err = e.to_string();
                    debug!(attempt, err = %last_err, "tmux invocation failed, retrying");
                    let jitter = rand::rng().random_range(0..20);
                    tokio::time::sleep(delay + Duration::from_millis(jitter)).await;
                    delay *= 2;
                }
            }
        }
        Err(Fault::bridge(format!("tmux failed after {TMUX_RETRIES} attempts: {last_err}")))
    }

    async fn has_session(&self, name: &str) -> Result<bool, Fault> {
        let out = self.run_tmux(&["has-session", "-t", name]).await?;
        Ok(out.status.success())
    }
}

impl Default for TmuxBridge {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TerminalBridge for TmuxBridge {
    async fn create(
        &self,
        session_id: &str,
        project_path: &Path,
        command: &[String],
        width: u16,
        height: u16,
    ) -> Result<TerminalHandle, BridgeError> {
        let handle = TerminalHandle::for_session(session_id);

        match self.has_session(&handle.tmux_name).await {
            Ok(true) => {
                return Err(BridgeError::NameCollision(format!(
                    "tmux session '{}' already exists",
                    handle.tmux_name
                )));
            }
            Ok(false) => {}
            Err(e) => return Err(BridgeError::Unavailable(e.message)),
        }

        let width_s = width.to_string();
        let height_s = height.to_string();
        let dir = project_path.to_string_lossy().into_owned();
        let mut args: Vec<&str> = vec![
            "new-session",
            "-d",
            "-s",
            &handle.tmux_name,
            "-x",
            &width_s,
            "-y",
            &height_s,
            "-c",
            &dir,
        ];
        for part in command {
            args.push(part);
        }

        let out = self
            .run_tmux(&args)
            .await
            .map_err(|e| BridgeError::Unavailable(e.message))?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr).trim().to_owned();
            return Err(BridgeError::Unavailable(format!("tmux new-session failed: {stderr}")));
        }

        // Warm-up window: the child must survive long enough to be
        // considered started.
        tokio::time::sleep(self.warmup).await;
        match self.has_session(&handle.tmux_name).await {
            Ok(true) => {}
            Ok(false) => {
                return Err(BridgeError::StartupFailed(format!(
                    "child of '{}' exited within the warm-up window",
                    handle.tmux_name
                )));
            }
            Err(e) => return Err(BridgeError::Unavailable(e.message)),
        }

        self.panes.lock().await.insert(
            handle.tmux_name.clone(),
            PaneTail { last_capture: String::new(), tail: TailBuffer::new(self.tail_capacity) },
        );

        Ok(handle)
    }

    async fn write(&self, handle: &TerminalHandle, bytes: &[u8]) -> Result<(), Fault> {
        if bytes.is_empty() {
            return Ok(());
        }
        let text = String::from_utf8_lossy(bytes).into_owned();
        let out =
            self.run_tmux(&["send-keys", "-l", "-t", &handle.tmux_name, "--", &text]).await?;
        if !out.status.success() {
            return Err(Fault::bridge(format!(
                "tmux send-keys failed for '{}'",
                handle.tmux_name
            )));
        }
        Ok(())
    }

    async fn read_since(&self, handle: &TerminalHandle, cursor: u64) -> Result<ReadChunk, Fault> {
        let out = self
            .run_tmux(&["capture-pane", "-p", "-e", "-J", "-t", &handle.tmux_name])
            .await?;
        if !out.status.success() {
            return Err(Fault::bridge(format!(
                "tmux capture-pane failed for '{}'",
                handle.tmux_name
            )));
        }
        let capture = String::from_utf8_lossy(&out.stdout).into_owned();

        let mut panes = self.panes.lock().await;
        let pane = panes.entry(handle.tmux_name.clone()).or_insert_with(|| PaneTail {
            last_capture: String::new(),
            tail: TailBuffer::new(self.tail_capacity),
        });

        if let Some(delta) = capture_delta(&pane.last_capture, &capture) {
            pane.tail.push(&delta);
            pane.last_capture = capture;
        }

        let (bytes, truncated) = pane.tail.read_from(cursor);
        let chunk =
            ReadChunk { bytes: Bytes::from(bytes), cursor: pane.tail.total(), truncated };
        Ok(chunk)
    }

    async fn resize(&self, handle: &TerminalHandle, width: u16, height: u16) -> Result<(), Fault> {
        let out = self
            .run_tmux(&[
                "resize-window",
                "-t",
                &handle.tmux_name,
                "-x",
                &width.to_string(),
                "-y",
                &height.to_string(),
            ])
            .await?;
        if !out.status.success() {
            return Err(Fault::bridge(format!("tmux resize failed for '{}'", handle.tmux_name)));
        }
        Ok(())
    }

    async fn signal(&self, handle: &TerminalHandle, signal: BridgeSignal) -> Result<(), Fault> {
        let send = || async {
            self.run_tmux(&["send-keys", "-t", &handle.tmux_name, "C-c"]).await.map(|out| {
                if !out.status.success() {
                    warn!(session = %handle.session_id, "tmux C-c delivery failed");
                }
            })
        };
        send().await?;
        if signal == BridgeSignal::InterruptTwice {
            tokio::time::sleep(Duration::from_millis(150)).await;
            send().await?;
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<TerminalHandle>, Fault> {
        let out = self.run_tmux(&["list-sessions", "-F", "#{session_name}"]).await?;
        if !out.status.success() {
            // No server running means no sessions, not an error.
            return Ok(Vec::new());
        }
        let names = String::from_utf8_lossy(&out.stdout);
        Ok(names.lines().filter_map(TerminalHandle::from_tmux_name).collect())
    }

    async fn close(&self, handle: &TerminalHandle) -> Result<(), Fault> {
        let _ = self.run_tmux(&["kill-session", "-t", &handle.tmux_name]).await?;
        self.panes.lock().await.remove(&handle.tmux_name);
        Ok(())
    }

    async fn is_alive(&self, handle: &TerminalHandle) -> bool {
        self.has_session(&handle.tmux_name).await.unwrap_or(false)
    }
}

#[cfg(test)]
#[path = "bridge_tests.rs"]
mod tests;
