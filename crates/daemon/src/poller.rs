// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Polling coordinator: one loop per local session reading the terminal
//! bridge at a fixed tick, grooming new bytes through the output screen,
//! and emitting `output_updated` plus agent-marker and idle events.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bridge::{TerminalBridge, TerminalHandle};
use crate::hub::{Event, EventHub, OutputUpdate};
use crate::screen::OutputScreen;
use crate::store::{SessionStatus, SessionStore};
use crate::wire::now_ms;

/// Tuning for one poll loop.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub tick: Duration,
    pub cols: u16,
    pub rows: u16,
    /// Lines of groomed tail carried as the output summary.
    pub summary_tail: usize,
    /// Quiet time before a single `agent_idle` is emitted.
    pub idle_after: Duration,
    /// Consecutive bridge failures before the session goes headless.
    pub headless_after: u32,
    /// Minimum gap between opportunistic store writes.
    pub store_write_gap: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(100),
            cols: 200,
            rows: 50,
            summary_tail: 3,
            idle_after: Duration::from_secs(30),
            headless_after: 10,
            store_write_gap: Duration::from_secs(2),
        }
    }
}

/// Agent activity markers recognized in groomed output lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Marker {
    ToolUse(String),
    ToolDone(String),
}

/// Stateful marker scanner pairing tool-use lines with their completion.
#[derive(Debug, Default)]
pub struct MarkerScan {
    pending_tool: Option<String>,
}

impl MarkerScan {
    /// Scan newly groomed lines for tool markers.
    pub fn scan(&mut self, lines: &[String]) -> Vec<Marker> {
        let mut markers = Vec::new();
        for line in lines {
            let trimmed = line.trim_start();
            if let Some(rest) = trimmed.strip_prefix("⏺ ") {
                if let Some(name) = tool_name(rest) {
                    if let Some(prev) = self.pending_tool.take() {
                        markers.push(Marker::ToolDone(prev));
                    }
                    self.pending_tool = Some(name.clone());
                    markers.push(Marker::ToolUse(name));
                }
            } else if trimmed.starts_with("⎿") {
                if let Some(prev) = self.pending_tool.take() {
                    markers.push(Marker::ToolDone(prev));
                }
            }
        }
        markers
    }
}

/// Extract `Name` from a `Name(args…)` tool-call rendering.
fn tool_name(rest: &str) -> Option<String> {
    let open = rest.find('(')?;
    let name = rest[..open].trim();
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return None;
    }
    Some(name.to_owned())
}

/// Whether a groomed line looks like an interactive prompt awaiting input.
pub fn looks_like_prompt(line: &str) -> bool {
    let t = line.trim_end();
    t.ends_with('❯') || t.ends_with('›') || t.ends_with('>') || t.ends_with('$')
}

/// One poll loop. Runs until cancelled (the session terminated) or the
/// terminal disappears for good.
pub struct OutputPoller {
    session_id: String,
    handle: TerminalHandle,
    bridge: Arc<dyn TerminalBridge>,
    hub: Arc<EventHub>,
    store: Arc<SessionStore>,
    config: PollerConfig,
}

impl OutputPoller {
    pub fn new(
        session_id: &str,
        bridge: Arc<dyn TerminalBridge>,
        hub: Arc<EventHub>,
        store: Arc<SessionStore>,
        config: PollerConfig,
    ) -> Self {
        Self {
            session_id: session_id.to_owned(),
            handle: TerminalHandle::for_session(session_id),
            bridge,
            hub,
            store,
            config,
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut screen = OutputScreen::new(self.config.cols, self.config.rows);
        let mut markers = MarkerScan::default();
        let mut cursor: u64 = 0;
        let mut sequence: u64 = 0;
        let mut last_lines: Vec<String> = Vec::new();
        let mut failures: u32 = 0;
        let mut headless = false;
        let mut first_tick = true;
        let mut last_activity = Instant::now();
        let mut idle_emitted = false;
        let mut stopped_emitted = false;
        let mut last_store_write: Option<Instant> = None;

        let mut interval = tokio::time::interval(self.config.tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(session = %self.session_id, "poller cancelled");
                    return;
                }
                _ = interval.tick() => {}
            }

            let chunk = match self.bridge.read_since(&self.handle, cursor).await {
                Ok(chunk) => chunk,
                Err(e) => {
                    failures += 1;
                    if failures == self.config.headless_after {
                        warn!(session = %self.session_id, err = %e, "bridge unreachable, marking headless");
                        headless = true;
                        if let Err(e) = self.store.update_status(&self.session_id, SessionStatus::Headless) {
                            debug!(session = %self.session_id, err = %e, "headless transition refused");
                        }
                    }
                    continue;
                }
            };

            failures = 0;
            if headless {
                headless = false;
                if let Err(e) = self.store.update_status(&self.session_id, SessionStatus::Running) {
                    debug!(session = %self.session_id, err = %e, "recovery transition refused");
                }
            }
            if first_tick {
                first_tick = false;
                if let Err(e) = self.store.update_status(&self.session_id, SessionStatus::Running) {
                    debug!(session = %self.session_id, err = %e, "running transition refused");
                }
            }

            if chunk.truncated {
                debug!(session = %self.session_id, "bridge tail truncated, resuming from suffix");
            }
            cursor = chunk.cursor;

            if chunk.bytes.is_empty() {
                if !idle_emitted && last_activity.elapsed() >= self.config.idle_after {
                    idle_emitted = true;
                    self.hub.emit(Event::AgentIdle { session_id: self.session_id.clone() });
                    let last_line = last_lines.iter().rev().find(|l| !l.trim().is_empty());
                    if !stopped_emitted && last_line.map(|l| looks_like_prompt(l)).unwrap_or(false)
                    {
                        stopped_emitted = true;
                        self.hub.emit(Event::AgentStop { session_id: self.session_id.clone() });
                    }
                }
                continue;
            }

            screen.feed(&chunk.bytes);
            let lines = screen.lines();
            if lines == last_lines {
                continue;
            }

            sequence += 1;
            let summary = screen.summary(self.config.summary_tail);
            self.hub.emit(Event::OutputUpdated(OutputUpdate {
                session_id: self.session_id.clone(),
                sequence,
                bytes: chunk.bytes.clone(),
                summary: summary.clone(),
                cursor,
            }));

            for marker in markers.scan(changed_lines(&last_lines, &lines)) {
                match marker {
                    Marker::ToolUse(tool) => self.hub.emit(Event::AgentToolUse {
                        session_id: self.session_id.clone(),
                        tool,
                    }),
                    Marker::ToolDone(tool) => self.hub.emit(Event::AgentToolDone {
                        session_id: self.session_id.clone(),
                        tool,
                    }),
                }
            }

            last_lines = lines;
            last_activity = Instant::now();
            idle_emitted = false;
            stopped_emitted = false;

            if last_store_write.map(|t| t.elapsed() >= self.config.store_write_gap).unwrap_or(true) {
                last_store_write = Some(Instant::now());
                if let Err(e) = self.store.append_output_summary(&self.session_id, &summary, now_ms())
                {
                    debug!(session = %self.session_id, err = %e, "summary write failed");
                }
            }
        }
    }
}

/// The suffix of `now` not shared with `prev` — the lines worth scanning
/// for fresh markers.
fn changed_lines<'a>(prev: &[String], now: &'a [String]) -> &'a [String] {
    let common = prev.iter().zip(now.iter()).take_while(|(a, b)| a == b).count();
    &now[common..]
}

#[cfg(test)]
#[path = "poller_tests.rs"]
mod tests;
