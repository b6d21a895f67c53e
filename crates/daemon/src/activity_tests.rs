// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::time::Duration;

use super::*;
use crate::store::SessionStatus;
use crate::wire::now_ms;

fn summary(id: &str) -> SessionSummary {
    SessionSummary {
        session_id: id.to_owned(),
        computer: "laptop".to_owned(),
        project_path: "/tmp".to_owned(),
        agent: "claude".to_owned(),
        thinking_mode: String::new(),
        status: SessionStatus::Running,
        title: String::new(),
        last_output_summary: Some("ok".to_owned()),
        last_activity_at: now_ms(),
    }
}

#[tokio::test]
async fn put_then_read_back() {
    let cache = ActivityCache::new(Duration::from_secs(60));
    cache.put_session(summary("s-1")).await;

    let got = cache.session("s-1").await;
    assert_eq!(got.map(|s| s.session_id), Some("s-1".to_owned()));
    assert!(cache.session("s-2").await.is_none());
}

#[tokio::test]
async fn entries_expire_after_ttl() {
    let cache = ActivityCache::new(Duration::from_millis(30));
    cache.put_session(summary("s-1")).await;
    cache
        .put_heartbeat(HeartbeatRecord {
            computer: "laptop".to_owned(),
            caps: vec![],
            interests: vec![],
            ts: now_ms(),
        })
        .await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(cache.session("s-1").await.is_none());
    assert!(cache.heartbeat("laptop").await.is_none());
    assert!(cache.snapshot_sessions().await.is_empty());

    cache.prune().await;
}

#[tokio::test]
async fn snapshot_is_a_stable_copy() {
    let cache = ActivityCache::new(Duration::from_secs(60));
    cache.put_session(summary("s-1")).await;

    let snapshot = cache.snapshot_sessions().await;
    cache.put_session(summary("s-2")).await;

    // The earlier snapshot is unaffected by later writes.
    assert_eq!(snapshot.len(), 1);
    assert_eq!(cache.snapshot_sessions().await.len(), 2);
}

#[tokio::test]
async fn subscribers_are_notified_outside_the_lock() -> anyhow::Result<()> {
    let cache = ActivityCache::new(Duration::from_secs(60));
    let mut rx = cache.subscribe();

    cache.put_session(summary("s-1")).await;
    assert_eq!(rx.recv().await?, CacheChange::Session("s-1".to_owned()));

    cache
        .put_heartbeat(HeartbeatRecord {
            computer: "workstation".to_owned(),
            caps: vec![],
            interests: vec![],
            ts: now_ms(),
        })
        .await;
    assert_eq!(rx.recv().await?, CacheChange::Heartbeat("workstation".to_owned()));
    Ok(())
}
