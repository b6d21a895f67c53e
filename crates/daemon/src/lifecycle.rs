// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session lifecycle coordinator.
//!
//! Owns the per-session state machine: resolves the requester's
//! identity, asks each participating adapter to provision its channel,
//! starts the terminal bridge and the poll loop, and tears everything
//! down on termination. Operations are serialized per session id so
//! rapid input/terminate races resolve deterministically.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapter::AdapterRegistry;
use crate::bridge::{BridgeSignal, TerminalBridge, TerminalHandle};
use crate::error::Fault;
use crate::hub::{Event, EventHub, EventKind};
use crate::identity::{CallOrigin, IdentityResolver, Requester};
use crate::poller::{OutputPoller, PollerConfig};
use crate::store::{SessionRecord, SessionStatus, SessionStore};
use crate::wire::now_ms;

/// Who is asking for a session, in owned form.
#[derive(Debug, Clone)]
pub enum RequesterSpec {
    Chat { adapter: String, user_id: String },
    Tool { origin: CallOrigin },
    Relayed { initiator_session_id: String },
}

/// A request to create a session on this node.
#[derive(Debug, Clone)]
pub struct CreateSessionRequest {
    /// Working directory wish; identity routing may override it.
    pub project_path: Option<String>,
    pub agent: String,
    pub thinking_mode: String,
    pub title: String,
    pub origin_adapter: String,
    pub requester: RequesterSpec,
}

pub struct LifecycleCoordinator {
    store: Arc<SessionStore>,
    bridge: Arc<dyn TerminalBridge>,
    hub: Arc<EventHub>,
    identity: IdentityResolver,
    adapters: Arc<AdapterRegistry>,
    poller_config: PollerConfig,
    flights: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    pollers: Mutex<HashMap<String, CancellationToken>>,
    root_cancel: CancellationToken,
}

impl LifecycleCoordinator {
    pub fn new(
        store: Arc<SessionStore>,
        bridge: Arc<dyn TerminalBridge>,
        hub: Arc<EventHub>,
        identity: IdentityResolver,
        adapters: Arc<AdapterRegistry>,
        poller_config: PollerConfig,
        root_cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            bridge,
            hub,
            identity,
            adapters,
            poller_config,
            flights: Mutex::new(HashMap::new()),
            pollers: Mutex::new(HashMap::new()),
            root_cancel,
        }
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// Per-session single-flight lock.
    async fn flight(&self, session_id: &str) -> Arc<Mutex<()>> {
        let mut flights = self.flights.lock().await;
        Arc::clone(flights.entry(session_id.to_owned()).or_default())
    }

    /// Create a local session end to end and emit `session_started`.
    pub async fn create_session(
        &self,
        req: CreateSessionRequest,
    ) -> Result<SessionRecord, Fault> {
        // Resolve identity. A relayed requester names its initiator by id.
        let initiator_record;
        let requester = match &req.requester {
            RequesterSpec::Chat { adapter, user_id } => {
                Requester::Chat { adapter: adapter.as_str(), user_id: user_id.as_str() }
            }
            RequesterSpec::Tool { origin } => Requester::Tool { origin: *origin },
            RequesterSpec::Relayed { initiator_session_id } => {
                initiator_record = self.store.get(initiator_session_id)?;
                Requester::Relayed { initiator: &initiator_record }
            }
        };
        let resolution = self.identity.resolve(&self.store, &requester)?;

        let project_path = match resolution
            .project_path_override
            .clone()
            .or_else(|| req.project_path.as_ref().map(PathBuf::from))
        {
            Some(p) => p,
            None => return Err(Fault::permanent("project_path is required")),
        };
        // Confined profiles may not escape their jail.
        let project_path = match &resolution.profile.confine_to {
            Some(jail) if !project_path.starts_with(jail) => jail.clone(),
            _ => project_path,
        };

        let session_id = uuid::Uuid::new_v4().to_string();
        let record = SessionRecord {
            session_id: session_id.clone(),
            computer: self.store.local_computer().to_owned(),
            project_path: project_path.to_string_lossy().into_owned(),
            agent: req.agent.clone(),
            thinking_mode: req.thinking_mode.clone(),
            status: SessionStatus::Starting,
            role: resolution.role,
            initiator_session_id: resolution.initiator_session_id.clone(),
            human_identity: resolution.human_identity.clone(),
            origin_adapter: req.origin_adapter.clone(),
            title: req.title.clone(),
            adapter_meta: serde_json::json!({}),
            last_output_summary: None,
            created_at: now_ms(),
            last_activity_at: now_ms(),
            terminated_at: None,
        };
        self.store.insert_session(&record)?;

        // Origin adapter provisions first; its failure fails the create.
        if let Some(origin) = self.adapters.origin_of(&record) {
            match origin.provision_session(&record).await {
                Ok(Some(meta)) => {
                    self.store.update_metadata(&session_id, origin.name(), meta)?;
                }
                Ok(None) => {}
                Err(e) => {
                    let _ = self.store.update_status(&session_id, SessionStatus::Terminated);
                    return Err(e);
                }
            }
        }
        // Observers are best-effort.
        for observer in self.adapters.observers_of(&record) {
            match observer.provision_session(&record).await {
                Ok(Some(meta)) => {
                    if let Err(e) = self.store.update_metadata(&session_id, observer.name(), meta) {
                        warn!(adapter = observer.name(), err = %e, "observer metadata write failed");
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(adapter = observer.name(), err = %e, "observer provisioning failed");
                }
            }
        }

        // Start the terminal.
        let command = resolution.profile.command_for(&req.agent);
        if let Err(e) = self
            .bridge
            .create(
                &session_id,
                std::path::Path::new(&record.project_path),
                &command,
                self.poller_config.cols,
                self.poller_config.rows,
            )
            .await
        {
            let _ = self.store.update_status(&session_id, SessionStatus::Terminated);
            let fault: Fault = e.into();
            self.hub.emit(Event::ErrorRaised {
                session_id: session_id.clone(),
                kind: fault.kind,
                message: fault.message.clone(),
            });
            return Err(fault);
        }

        self.spawn_poller(&session_id).await;

        let record = self.store.get(&session_id)?;
        info!(session = %session_id, agent = %record.agent, path = %record.project_path, "session started");
        self.hub.emit(Event::SessionStarted {
            session_id: session_id.clone(),
            computer: record.computer.clone(),
        });
        Ok(record)
    }

    async fn spawn_poller(&self, session_id: &str) {
        let cancel = self.root_cancel.child_token();
        self.pollers.lock().await.insert(session_id.to_owned(), cancel.clone());
        let poller = OutputPoller::new(
            session_id,
            Arc::clone(&self.bridge),
            Arc::clone(&self.hub),
            Arc::clone(&self.store),
            self.poller_config.clone(),
        );
        tokio::spawn(poller.run(cancel));
    }

    /// Write input to a local session. Bytes are literal.
    pub async fn send_input(&self, session_id: &str, bytes: &[u8]) -> Result<(), Fault> {
        let flight = self.flight(session_id).await;
        let _guard = flight.lock().await;

        let record = self.store.get(session_id)?;
        if record.status == SessionStatus::Terminated {
            return Err(Fault::conflict(format!("session {session_id} is terminated")));
        }
        if record.computer != self.store.local_computer() {
            return Err(Fault::conflict(format!(
                "session {session_id} is owned by {}",
                record.computer
            )));
        }
        if bytes.is_empty() {
            return Ok(());
        }
        let handle = TerminalHandle::for_session(session_id);
        self.bridge.write(&handle, bytes).await?;
        self.store.update_activity(session_id, now_ms())?;
        Ok(())
    }

    /// Deliver an interrupt to a local session.
    pub async fn signal_session(
        &self,
        session_id: &str,
        signal: BridgeSignal,
    ) -> Result<(), Fault> {
        let record = self.store.get(session_id)?;
        if record.status == SessionStatus::Terminated {
            return Err(Fault::conflict(format!("session {session_id} is terminated")));
        }
        let handle = TerminalHandle::for_session(session_id);
        self.bridge.signal(&handle, signal).await
    }

    /// Terminate a local session: stop the poller, kill the terminal,
    /// let adapters finalize their channels, emit `session_terminated`.
    /// Ending an already-terminated session is a no-op.
    pub async fn end_session(&self, session_id: &str) -> Result<(), Fault> {
        let flight = self.flight(session_id).await;
        let _guard = flight.lock().await;

        let record = self.store.get(session_id)?;
        if record.computer != self.store.local_computer() {
            return Err(Fault::conflict(format!(
                "session {session_id} is owned by {}",
                record.computer
            )));
        }
        if record.status == SessionStatus::Terminated {
            return Ok(());
        }

        if let Some(cancel) = self.pollers.lock().await.remove(session_id) {
            cancel.cancel();
        }
        let handle = TerminalHandle::for_session(session_id);
        if let Err(e) = self.bridge.close(&handle).await {
            debug!(session = %session_id, err = %e, "bridge close failed");
        }
        self.store.update_status(session_id, SessionStatus::Terminated)?;

        let record = self.store.get(session_id)?;
        for adapter in self.adapters.all() {
            adapter.finalize_session(&record).await;
        }

        info!(session = %session_id, "session terminated");
        self.hub.emit(Event::SessionTerminated { session_id: session_id.to_owned() });
        Ok(())
    }

    /// Gate session termination by caller origin. The decision uses
    /// session records, never caller-supplied claims.
    pub fn authorize_end(
        &self,
        origin: CallOrigin,
        caller_session_id: Option<&str>,
        record: &SessionRecord,
    ) -> Result<(), Fault> {
        match origin {
            CallOrigin::LocalTui => Ok(()),
            CallOrigin::AgentOfSession => {
                let caller = caller_session_id.unwrap_or("");
                let owns = caller == record.session_id
                    || record.initiator_session_id.as_deref() == Some(caller);
                if owns {
                    Ok(())
                } else {
                    Err(Fault::denied(format!(
                        "origin agent_of_session may not end session {}",
                        record.session_id
                    )))
                }
            }
            CallOrigin::ChatUser => {
                let chat_origin = self
                    .adapters
                    .get(&record.origin_adapter)
                    .map(|a| a.capabilities().contains(&crate::adapter::Capability::Ui))
                    .unwrap_or(false);
                if chat_origin {
                    Ok(())
                } else {
                    Err(Fault::denied(format!(
                        "origin chat_user may not end session {}",
                        record.session_id
                    )))
                }
            }
        }
    }

    /// Route hub input events into sessions. A fresh DM (no session id)
    /// creates one via identity routing first.
    pub async fn run_input_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut rx = self.hub.subscribe(EventKind::InputReceived);
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => return,
                event = rx.recv() => event,
            };
            match event {
                Ok(Event::InputReceived { origin_adapter, session_id, user, text }) => {
                    let result = match session_id {
                        // Double Ctrl-C is delivered as a spaced signal
                        // pair so full-screen children in raw input mode
                        // still see the interrupt.
                        Some(ref id) if text == "\u{3}\u{3}" => {
                            self.signal_session(id, BridgeSignal::InterruptTwice).await
                        }
                        Some(ref id) => self.send_input(id, text.as_bytes()).await,
                        None => {
                            let user_id =
                                user.as_ref().map(|u| u.adapter_user_id.clone()).unwrap_or_default();
                            let title = user
                                .as_ref()
                                .and_then(|u| u.display_name.clone())
                                .unwrap_or_else(|| "direct message".to_owned());
                            match self
                                .create_session(CreateSessionRequest {
                                    project_path: None,
                                    agent: "claude".to_owned(),
                                    thinking_mode: String::new(),
                                    title,
                                    origin_adapter: origin_adapter.clone(),
                                    requester: RequesterSpec::Chat {
                                        adapter: origin_adapter.clone(),
                                        user_id,
                                    },
                                })
                                .await
                            {
                                Ok(record) => {
                                    self.send_input(&record.session_id, text.as_bytes()).await
                                }
                                Err(e) => Err(e),
                            }
                        }
                    };
                    if let Err(e) = result {
                        warn!(adapter = %origin_adapter, err = %e, "input routing failed");
                        if let Some(id) = session_id {
                            self.hub.emit(Event::ErrorRaised {
                                session_id: id,
                                kind: e.kind,
                                message: e.message,
                            });
                        }
                    }
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!(lagged = n, "input loop lagged");
                }
                Err(_) => return,
            }
        }
    }

    /// Reconcile leftover terminals after a daemon restart.
    ///
    /// Store sessions whose tmux session survived are re-bound and
    /// polled again; sessions whose terminal is verifiably gone are
    /// terminated; when the multiplexer itself is unreachable everything
    /// open goes headless instead. Orphan terminals with no store record
    /// are killed so at most one terminal exists per session.
    pub async fn reconcile_startup(&self) -> Result<(), Fault> {
        let open = self.store.list_local(&Default::default())?;
        let open: Vec<_> =
            open.into_iter().filter(|r| r.status != SessionStatus::Terminated).collect();

        let alive = match self.bridge.list().await {
            Ok(handles) => handles,
            Err(e) => {
                warn!(err = %e, "multiplexer unreachable at startup, marking sessions headless");
                for record in &open {
                    let _ = self.store.update_status(&record.session_id, SessionStatus::Headless);
                }
                return Ok(());
            }
        };

        let alive_ids: std::collections::HashSet<&str> =
            alive.iter().map(|h| h.session_id.as_str()).collect();

        for record in &open {
            if alive_ids.contains(record.session_id.as_str()) {
                debug!(session = %record.session_id, "re-binding surviving terminal");
                let _ = self.store.update_status(&record.session_id, SessionStatus::Running);
                self.spawn_poller(&record.session_id).await;
            } else {
                info!(session = %record.session_id, "terminal gone, terminating record");
                let _ = self.store.update_status(&record.session_id, SessionStatus::Terminated);
                self.hub.emit(Event::SessionTerminated { session_id: record.session_id.clone() });
            }
        }

        let known: std::collections::HashSet<String> =
            self.store.list_local(&Default::default())?.into_iter().map(|r| r.session_id).collect();
        for handle in alive {
            if !known.contains(&handle.session_id) {
                warn!(tmux = %handle.tmux_name, "killing orphan terminal");
                let _ = self.bridge.close(&handle).await;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "lifecycle_tests.rs"]
mod tests;
