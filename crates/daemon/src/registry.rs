// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Peer registry: heartbeat-driven liveness map of the mesh.
//!
//! An entry is online while a heartbeat has been seen within the
//! freshness window (3x the heartbeat cadence by default). Transitions
//! emit `peer_seen` / `peer_lost` exactly once per edge; continued
//! absence emits nothing further until the peer returns.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::hub::{Event, EventHub};
use crate::wire::{now_ms, HeartbeatRecord};

/// Snapshot of one mesh node served to adapters and the tool surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub name: String,
    pub status: PeerStatus,
    pub last_seen_at: u64,
    pub capabilities: Vec<String>,
    pub interests: Vec<String>,
    pub is_local: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerStatus {
    Online,
    Offline,
}

struct PeerEntry {
    record: HeartbeatRecord,
    last_seen: Instant,
    last_seen_at: u64,
    online: bool,
}

/// The mesh view. Computers are created on first observed heartbeat and
/// never deleted; they only go offline.
pub struct PeerRegistry {
    peers: RwLock<HashMap<String, PeerEntry>>,
    hub: Arc<EventHub>,
    freshness: Duration,
    local: String,
}

impl PeerRegistry {
    pub fn new(hub: Arc<EventHub>, freshness: Duration, local: &str) -> Self {
        Self { peers: RwLock::new(HashMap::new()), hub, freshness, local: local.to_owned() }
    }

    pub fn local_name(&self) -> &str {
        &self.local
    }

    /// Record a heartbeat. Emits `peer_seen` when the peer was unknown
    /// or offline. The local node's own heartbeat is tracked silently.
    pub async fn upsert(&self, record: HeartbeatRecord) {
        let name = record.computer.clone();
        let newly_online = {
            let mut peers = self.peers.write().await;
            let entry = peers.entry(name.clone());
            match entry {
                std::collections::hash_map::Entry::Occupied(mut o) => {
                    let e = o.get_mut();
                    let was_online = e.online;
                    e.record = record;
                    e.last_seen = Instant::now();
                    e.last_seen_at = now_ms();
                    e.online = true;
                    !was_online
                }
                std::collections::hash_map::Entry::Vacant(v) => {
                    v.insert(PeerEntry {
                        record,
                        last_seen: Instant::now(),
                        last_seen_at: now_ms(),
                        online: true,
                    });
                    true
                }
            }
        };
        if newly_online && name != self.local {
            info!(peer = %name, "peer online");
            self.hub.emit(Event::PeerSeen { computer: name });
        }
    }

    pub async fn get(&self, name: &str) -> Option<PeerInfo> {
        let peers = self.peers.read().await;
        peers.get(name).map(|e| self.info(name, e))
    }

    /// All peers currently online, optionally narrowed to a tighter
    /// recency window than the freshness default.
    pub async fn list_online(&self, within: Option<Duration>) -> Vec<PeerInfo> {
        let window = within.unwrap_or(self.freshness);
        let peers = self.peers.read().await;
        peers
            .iter()
            .filter(|(_, e)| e.online && e.last_seen.elapsed() <= window)
            .map(|(name, e)| self.info(name, e))
            .collect()
    }

    pub async fn list_all(&self) -> Vec<PeerInfo> {
        let peers = self.peers.read().await;
        peers.iter().map(|(name, e)| self.info(name, e)).collect()
    }

    pub async fn is_online(&self, name: &str) -> bool {
        if name == self.local {
            return true;
        }
        let peers = self.peers.read().await;
        peers.get(name).map(|e| e.online && e.last_seen.elapsed() <= self.freshness).unwrap_or(false)
    }

    /// Whether a peer advertises interest in an event class.
    pub async fn interested(&self, name: &str, topic: &str) -> bool {
        let peers = self.peers.read().await;
        peers
            .get(name)
            .map(|e| e.record.interests.iter().any(|i| i == topic))
            .unwrap_or(false)
    }

    /// Flip stale entries offline, emitting `peer_lost` once per edge.
    pub async fn sweep(&self) {
        let mut lost: Vec<String> = Vec::new();
        {
            let mut peers = self.peers.write().await;
            for (name, entry) in peers.iter_mut() {
                if entry.online && entry.last_seen.elapsed() > self.freshness {
                    entry.online = false;
                    if *name != self.local {
                        lost.push(name.clone());
                    }
                }
            }
        }
        for name in lost {
            info!(peer = %name, "peer offline");
            self.hub.emit(Event::PeerLost { computer: name });
        }
    }

    /// Periodic liveness sweep between heartbeats.
    pub async fn run_sweeper(self: Arc<Self>, cancel: CancellationToken) {
        let tick = (self.freshness / 3).max(Duration::from_millis(200));
        let mut interval = tokio::time::interval(tick);
        loop {
            tokio::select! {
                _ = interval.tick() => self.sweep().await,
                _ = cancel.cancelled() => {
                    debug!("peer sweeper shutting down");
                    return;
                }
            }
        }
    }

    fn info(&self, name: &str, entry: &PeerEntry) -> PeerInfo {
        let online = entry.online && entry.last_seen.elapsed() <= self.freshness;
        PeerInfo {
            name: name.to_owned(),
            status: if online { PeerStatus::Online } else { PeerStatus::Offline },
            last_seen_at: entry.last_seen_at,
            capabilities: entry.record.caps.clone(),
            interests: entry.record.interests.clone(),
            is_local: name == self.local,
        }
    }
}

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;
