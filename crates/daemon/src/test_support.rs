// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared test fixtures: an in-memory terminal bridge and record builders.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Mutex;

use crate::bridge::{
    BridgeError, BridgeSignal, ReadChunk, TailBuffer, TerminalBridge, TerminalHandle,
};
use crate::error::Fault;
use crate::store::{SessionRecord, SessionRole, SessionStatus};
use crate::wire::now_ms;

struct FakeTerm {
    output: TailBuffer,
    input: Vec<u8>,
    signals: Vec<BridgeSignal>,
    alive: bool,
    size: (u16, u16),
}

/// In-memory [`TerminalBridge`] with scriptable output and failure
/// injection, so the poller and lifecycle are testable without tmux.
pub struct MemoryBridge {
    terms: Mutex<HashMap<String, FakeTerm>>,
    fail_reads: AtomicU32,
    fail_create: Mutex<Option<BridgeError>>,
}

impl MemoryBridge {
    pub fn new() -> Self {
        Self {
            terms: Mutex::new(HashMap::new()),
            fail_reads: AtomicU32::new(0),
            fail_create: Mutex::new(None),
        }
    }

    /// Simulate child output appearing on the terminal.
    pub async fn push_output(&self, session_id: &str, bytes: &[u8]) {
        let mut terms = self.terms.lock().await;
        if let Some(term) = terms.get_mut(session_id) {
            term.output.push(bytes);
        }
    }

    /// Everything written to the terminal so far.
    pub async fn written(&self, session_id: &str) -> Vec<u8> {
        let terms = self.terms.lock().await;
        terms.get(session_id).map(|t| t.input.clone()).unwrap_or_default()
    }

    pub async fn signals(&self, session_id: &str) -> Vec<BridgeSignal> {
        let terms = self.terms.lock().await;
        terms.get(session_id).map(|t| t.signals.clone()).unwrap_or_default()
    }

    pub async fn size(&self, session_id: &str) -> Option<(u16, u16)> {
        let terms = self.terms.lock().await;
        terms.get(session_id).map(|t| t.size)
    }

    pub async fn kill(&self, session_id: &str) {
        let mut terms = self.terms.lock().await;
        if let Some(term) = terms.get_mut(session_id) {
            term.alive = false;
        }
    }

    /// Make the next `n` reads fail as bridge-unavailable.
    pub fn fail_next_reads(&self, n: u32) {
        self.fail_reads.store(n, Ordering::SeqCst);
    }

    /// Make the next create fail with the given error.
    pub async fn fail_next_create(&self, err: BridgeError) {
        *self.fail_create.lock().await = Some(err);
    }
}

impl Default for MemoryBridge {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TerminalBridge for MemoryBridge {
    async fn create(
        &self,
        session_id: &str,
        _project_path: &Path,
        _command: &[String],
        width: u16,
        height: u16,
    ) -> Result<TerminalHandle, BridgeError> {
        if let Some(err) = self.fail_create.lock().await.take() {
            return Err(err);
        }
        let mut terms = self.terms.lock().await;
        if terms.contains_key(session_id) {
            return Err(BridgeError::NameCollision(format!("session {session_id} exists")));
        }
        terms.insert(
            session_id.to_owned(),
            FakeTerm {
                output: TailBuffer::new(1 << 16),
                input: Vec::new(),
                signals: Vec::new(),
                alive: true,
                size: (width, height),
            },
        );
        Ok(TerminalHandle::for_session(session_id))
    }

    async fn write(&self, handle: &TerminalHandle, bytes: &[u8]) -> Result<(), Fault> {
        let mut terms = self.terms.lock().await;
        let term = terms
            .get_mut(&handle.session_id)
            .filter(|t| t.alive)
            .ok_or_else(|| Fault::bridge(format!("no live term {}", handle.session_id)))?;
        term.input.extend_from_slice(bytes);
        Ok(())
    }

    async fn read_since(&self, handle: &TerminalHandle, cursor: u64) -> Result<ReadChunk, Fault> {
        let pending = self.fail_reads.load(Ordering::SeqCst);
        if pending > 0 {
            self.fail_reads.store(pending - 1, Ordering::SeqCst);
            return Err(Fault::bridge("injected read failure"));
        }
        let terms = self.terms.lock().await;
        let term = terms
            .get(&handle.session_id)
            .filter(|t| t.alive)
            .ok_or_else(|| Fault::bridge(format!("no live term {}", handle.session_id)))?;
        let (bytes, truncated) = term.output.read_from(cursor);
        Ok(ReadChunk { bytes: Bytes::from(bytes), cursor: term.output.total(), truncated })
    }

    async fn resize(&self, handle: &TerminalHandle, width: u16, height: u16) -> Result<(), Fault> {
        let mut terms = self.terms.lock().await;
        if let Some(term) = terms.get_mut(&handle.session_id) {
            term.size = (width, height);
        }
        Ok(())
    }

    async fn signal(&self, handle: &TerminalHandle, signal: BridgeSignal) -> Result<(), Fault> {
        let mut terms = self.terms.lock().await;
        if let Some(term) = terms.get_mut(&handle.session_id) {
            term.signals.push(signal);
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<TerminalHandle>, Fault> {
        let terms = self.terms.lock().await;
        Ok(terms
            .iter()
            .filter(|(_, t)| t.alive)
            .map(|(id, _)| TerminalHandle::for_session(id))
            .collect())
    }

    async fn close(&self, handle: &TerminalHandle) -> Result<(), Fault> {
        let mut terms = self.terms.lock().await;
        terms.remove(&handle.session_id);
        Ok(())
    }

    async fn is_alive(&self, handle: &TerminalHandle) -> bool {
        let terms = self.terms.lock().await;
        terms.get(&handle.session_id).map(|t| t.alive).unwrap_or(false)
    }
}

/// A plausible local session record for tests.
pub fn sample_session(id: &str, computer: &str, origin_adapter: &str) -> SessionRecord {
    SessionRecord {
        session_id: id.to_owned(),
        computer: computer.to_owned(),
        project_path: "/tmp/project".to_owned(),
        agent: "claude".to_owned(),
        thinking_mode: String::new(),
        status: SessionStatus::Starting,
        role: SessionRole::Human,
        initiator_session_id: None,
        human_identity: None,
        origin_adapter: origin_adapter.to_owned(),
        title: "test".to_owned(),
        adapter_meta: serde_json::json!({}),
        last_output_summary: None,
        created_at: now_ms(),
        last_activity_at: now_ms(),
        terminated_at: None,
    }
}
