// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! In-memory activity cache: last known session summaries and
//! heartbeats with per-entry TTLs. Read-mostly; writers take a short
//! lock and notify subscribers outside it.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, RwLock};

use crate::store::SessionSummary;
use crate::wire::HeartbeatRecord;

struct Entry<T> {
    value: T,
    stored: Instant,
}

/// A change notification naming the touched cache key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheChange {
    Session(String),
    Heartbeat(String),
}

pub struct ActivityCache {
    sessions: RwLock<HashMap<String, Entry<SessionSummary>>>,
    heartbeats: RwLock<HashMap<String, Entry<HeartbeatRecord>>>,
    ttl: Duration,
    changed: broadcast::Sender<CacheChange>,
}

impl ActivityCache {
    pub fn new(ttl: Duration) -> Self {
        let (changed, _) = broadcast::channel(64);
        Self {
            sessions: RwLock::new(HashMap::new()),
            heartbeats: RwLock::new(HashMap::new()),
            ttl,
            changed,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheChange> {
        self.changed.subscribe()
    }

    pub async fn put_session(&self, summary: SessionSummary) {
        let key = summary.session_id.clone();
        {
            let mut sessions = self.sessions.write().await;
            sessions.insert(key.clone(), Entry { value: summary, stored: Instant::now() });
        }
        let _ = self.changed.send(CacheChange::Session(key));
    }

    pub async fn session(&self, session_id: &str) -> Option<SessionSummary> {
        let sessions = self.sessions.read().await;
        sessions
            .get(session_id)
            .filter(|e| e.stored.elapsed() <= self.ttl)
            .map(|e| e.value.clone())
    }

    /// Stable snapshot of all unexpired session summaries.
    pub async fn snapshot_sessions(&self) -> Vec<SessionSummary> {
        let sessions = self.sessions.read().await;
        sessions
            .values()
            .filter(|e| e.stored.elapsed() <= self.ttl)
            .map(|e| e.value.clone())
            .collect()
    }

    pub async fn put_heartbeat(&self, record: HeartbeatRecord) {
        let key = record.computer.clone();
        {
            let mut heartbeats = self.heartbeats.write().await;
            heartbeats.insert(key.clone(), Entry { value: record, stored: Instant::now() });
        }
        let _ = self.changed.send(CacheChange::Heartbeat(key));
    }

    pub async fn heartbeat(&self, computer: &str) -> Option<HeartbeatRecord> {
        let heartbeats = self.heartbeats.read().await;
        heartbeats
            .get(computer)
            .filter(|e| e.stored.elapsed() <= self.ttl)
            .map(|e| e.value.clone())
    }

    /// Drop expired entries. Called opportunistically by long-lived readers.
    pub async fn prune(&self) {
        let ttl = self.ttl;
        self.sessions.write().await.retain(|_, e| e.stored.elapsed() <= ttl);
        self.heartbeats.write().await.retain(|_, e| e.stored.elapsed() <= ttl);
    }
}

#[cfg(test)]
#[path = "activity_tests.rs"]
mod tests;
