// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use super::*;
use crate::store::{SessionRole, SessionStatus};

struct StubAdapter {
    name: &'static str,
    caps: &'static [Capability],
    stops: AtomicU32,
}

impl StubAdapter {
    fn new(name: &'static str, caps: &'static [Capability]) -> Arc<Self> {
        Arc::new(Self { name, caps, stops: AtomicU32::new(0) })
    }
}

#[async_trait]
impl Adapter for StubAdapter {
    fn name(&self) -> &'static str {
        self.name
    }

    fn capabilities(&self) -> &'static [Capability] {
        self.caps
    }

    async fn start(&self) -> Result<(), Fault> {
        Ok(())
    }

    async fn stop(&self) {
        self.stops.fetch_add(1, Ordering::Relaxed);
    }
}

fn session(origin: &str) -> SessionRecord {
    SessionRecord {
        session_id: "s-1".to_owned(),
        computer: "laptop".to_owned(),
        project_path: "/tmp".to_owned(),
        agent: "claude".to_owned(),
        thinking_mode: String::new(),
        status: SessionStatus::Running,
        role: SessionRole::Human,
        initiator_session_id: None,
        human_identity: None,
        origin_adapter: origin.to_owned(),
        title: String::new(),
        adapter_meta: serde_json::json!({}),
        last_output_summary: None,
        created_at: 0,
        last_activity_at: 0,
        terminated_at: None,
    }
}

fn registry() -> (Arc<StubAdapter>, Arc<StubAdapter>, Arc<StubAdapter>, AdapterRegistry) {
    let telegram = StubAdapter::new("telegram", &[Capability::Ui]);
    let stream = StubAdapter::new(
        "stream",
        &[Capability::RemoteExecution, Capability::Discovery],
    );
    let local = StubAdapter::new("local", &[Capability::Ui]);
    let registry = AdapterRegistry::new(vec![
        Arc::clone(&telegram) as Arc<dyn Adapter>,
        Arc::clone(&stream) as Arc<dyn Adapter>,
        Arc::clone(&local) as Arc<dyn Adapter>,
    ]);
    (telegram, stream, local, registry)
}

#[test]
fn lookup_by_name_and_capability() {
    let (_t, _s, _l, registry) = registry();

    assert!(registry.get("telegram").is_some());
    assert!(registry.get("missing").is_none());

    let ui: Vec<&str> = registry.with_capability(Capability::Ui).iter().map(|a| a.name()).collect();
    assert_eq!(ui, vec!["telegram", "local"]);

    let remote = registry.with_capability(Capability::RemoteExecution);
    assert_eq!(remote.len(), 1);
    assert_eq!(remote[0].name(), "stream");
}

#[test]
fn origin_and_observers_split() {
    let (_t, _s, _l, registry) = registry();
    let session = session("telegram");

    let origin = registry.origin_of(&session);
    assert_eq!(origin.map(|a| a.name()), Some("telegram"));

    let observers: Vec<&str> =
        registry.observers_of(&session).iter().map(|a| a.name()).collect();
    assert_eq!(observers, vec!["stream", "local"]);
}

#[tokio::test]
async fn stop_is_observable_per_call() {
    let (telegram, _s, _l, registry) = registry();
    if let Some(adapter) = registry.get("telegram") {
        adapter.stop().await;
        adapter.stop().await;
    }
    // Stop ran twice without error — idempotence is on the adapter.
    assert_eq!(telegram.stops.load(Ordering::Relaxed), 2);
}

#[tokio::test]
async fn default_provisioning_is_empty() -> anyhow::Result<()> {
    let (_t, _s, _l, registry) = registry();
    let session = session("telegram");
    if let Some(adapter) = registry.get("local") {
        assert!(adapter.provision_session(&session).await?.is_none());
        adapter.finalize_session(&session).await;
    }
    Ok(())
}
