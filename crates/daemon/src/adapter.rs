// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Adapter contract and registry.
//!
//! An adapter is a boundary surface wired to the hub. It declares its
//! capabilities as data at registration time; the daemon dispatches by
//! tag lookup, never by downcasting. Exactly one adapter is the origin
//! of any session — failures there are returned to the caller — while
//! the rest observe with failures logged only.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Fault;
use crate::store::SessionRecord;

/// Capability tags an adapter may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Has a human surface.
    Ui,
    /// Can carry a command to another node.
    RemoteExecution,
    /// Can emit/observe peer liveness.
    Discovery,
}

/// A boundary surface: chat, stream transport, HTTP/local socket, ...
#[async_trait]
pub trait Adapter: Send + Sync {
    fn name(&self) -> &'static str;

    fn capabilities(&self) -> &'static [Capability];

    /// Open resources and subscribe to the hub.
    async fn start(&self) -> Result<(), Fault>;

    /// Release resources. Must be idempotent.
    async fn stop(&self);

    /// Provision this adapter's per-session channel (e.g. create a chat
    /// topic) and return the metadata blob to record under the
    /// adapter's name. `None` means the adapter keeps no metadata.
    async fn provision_session(
        &self,
        _session: &SessionRecord,
    ) -> Result<Option<serde_json::Value>, Fault> {
        Ok(None)
    }

    /// Tear down the per-session channel after termination. Best-effort.
    async fn finalize_session(&self, _session: &SessionRecord) {}
}

/// Immutable adapter set, built once at startup.
pub struct AdapterRegistry {
    adapters: Vec<Arc<dyn Adapter>>,
}

impl AdapterRegistry {
    pub fn new(adapters: Vec<Arc<dyn Adapter>>) -> Self {
        Self { adapters }
    }

    pub fn all(&self) -> &[Arc<dyn Adapter>] {
        &self.adapters
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Adapter>> {
        self.adapters.iter().find(|a| a.name() == name).cloned()
    }

    pub fn with_capability(&self, capability: Capability) -> Vec<Arc<dyn Adapter>> {
        self.adapters.iter().filter(|a| a.capabilities().contains(&capability)).cloned().collect()
    }

    /// The adapter whose users can submit input to this session.
    pub fn origin_of(&self, session: &SessionRecord) -> Option<Arc<dyn Adapter>> {
        self.get(&session.origin_adapter)
    }

    /// Every registered adapter except the session's origin.
    pub fn observers_of(&self, session: &SessionRecord) -> Vec<Arc<dyn Adapter>> {
        self.adapters.iter().filter(|a| a.name() != session.origin_adapter).cloned().collect()
    }
}

#[cfg(test)]
#[path = "adapter_tests.rs"]
mod tests;
