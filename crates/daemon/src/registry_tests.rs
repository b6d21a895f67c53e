// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;
use std::time::Duration;

use super::*;
use crate::hub::EventKind;

fn beat(name: &str) -> HeartbeatRecord {
    HeartbeatRecord {
        computer: name.to_owned(),
        caps: vec!["sessions".to_owned()],
        interests: vec!["sessions".to_owned()],
        ts: now_ms(),
    }
}

fn registry(freshness: Duration) -> (Arc<EventHub>, PeerRegistry) {
    let hub = Arc::new(EventHub::new(16));
    let registry = PeerRegistry::new(Arc::clone(&hub), freshness, "laptop");
    (hub, registry)
}

#[tokio::test]
async fn first_heartbeat_creates_online_peer() -> anyhow::Result<()> {
    let (hub, registry) = registry(Duration::from_secs(90));
    let mut seen = hub.subscribe(EventKind::PeerSeen);

    registry.upsert(beat("workstation")).await;

    let info = registry.get("workstation").await;
    assert_eq!(info.as_ref().map(|p| p.status), Some(PeerStatus::Online));
    assert_eq!(info.map(|p| p.is_local), Some(false));
    assert!(registry.is_online("workstation").await);

    let event = seen.recv().await?;
    assert!(matches!(event, Event::PeerSeen { ref computer } if computer == "workstation"));
    Ok(())
}

#[tokio::test]
async fn repeated_heartbeats_do_not_reemit_peer_seen() -> anyhow::Result<()> {
    let (hub, registry) = registry(Duration::from_secs(90));
    let mut seen = hub.subscribe(EventKind::PeerSeen);

    registry.upsert(beat("workstation")).await;
    registry.upsert(beat("workstation")).await;
    registry.upsert(beat("workstation")).await;

    let _ = seen.recv().await?;
    assert!(seen.try_recv().is_err());
    Ok(())
}

#[tokio::test]
async fn stale_peer_is_lost_exactly_once() -> anyhow::Result<()> {
    let (hub, registry) = registry(Duration::from_millis(40));
    let mut lost = hub.subscribe(EventKind::PeerLost);

    registry.upsert(beat("workstation")).await;
    tokio::time::sleep(Duration::from_millis(60)).await;

    registry.sweep().await;
    registry.sweep().await;
    registry.sweep().await;

    let event = lost.recv().await?;
    assert!(matches!(event, Event::PeerLost { ref computer } if computer == "workstation"));
    assert!(lost.try_recv().is_err());

    assert!(!registry.is_online("workstation").await);
    assert_eq!(
        registry.get("workstation").await.map(|p| p.status),
        Some(PeerStatus::Offline)
    );
    Ok(())
}

#[tokio::test]
async fn returning_peer_reemits_seen_after_lost() -> anyhow::Result<()> {
    let (hub, registry) = registry(Duration::from_millis(40));
    let mut seen = hub.subscribe(EventKind::PeerSeen);

    registry.upsert(beat("workstation")).await;
    let _ = seen.recv().await?;

    tokio::time::sleep(Duration::from_millis(60)).await;
    registry.sweep().await;

    registry.upsert(beat("workstation")).await;
    let event = seen.recv().await?;
    assert!(matches!(event, Event::PeerSeen { ref computer } if computer == "workstation"));
    Ok(())
}

#[tokio::test]
async fn list_online_filters_by_window() {
    let (_hub, registry) = registry(Duration::from_secs(90));
    registry.upsert(beat("a")).await;
    registry.upsert(beat("b")).await;

    assert_eq!(registry.list_online(None).await.len(), 2);
    assert_eq!(registry.list_online(Some(Duration::from_secs(1))).await.len(), 2);
    assert_eq!(registry.list_all().await.len(), 2);
}

#[tokio::test]
async fn interest_lookup() {
    let (_hub, registry) = registry(Duration::from_secs(90));
    registry.upsert(beat("workstation")).await;

    assert!(registry.interested("workstation", "sessions").await);
    assert!(!registry.interested("workstation", "preparation").await);
    assert!(!registry.interested("ghost", "sessions").await);
}

#[tokio::test]
async fn local_node_is_always_online_and_silent() {
    let (hub, registry) = registry(Duration::from_millis(10));
    let mut seen = hub.subscribe(EventKind::PeerSeen);
    let mut lost = hub.subscribe(EventKind::PeerLost);

    registry.upsert(beat("laptop")).await;
    assert!(registry.is_online("laptop").await);

    tokio::time::sleep(Duration::from_millis(30)).await;
    registry.sweep().await;

    assert!(seen.try_recv().is_err());
    assert!(lost.try_recv().is_err());
    assert!(registry.is_online("laptop").await);
}
