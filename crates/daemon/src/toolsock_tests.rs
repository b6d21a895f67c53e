// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UnixStream;

use super::*;
use crate::adapter::AdapterRegistry;
use crate::bridge::TerminalBridge;
use crate::hub::EventHub;
use crate::identity::IdentityResolver;
use crate::poller::PollerConfig;
use crate::store::SessionStore;
use crate::streams::MemoryStreamStore;
use crate::test_support::MemoryBridge;
use crate::wire::{now_ms, ChunkKind, HeartbeatRecord, OutputChunk};

struct Rig {
    path: PathBuf,
    deps: Arc<ToolDeps>,
    bridge: Arc<MemoryBridge>,
    store: Arc<SessionStore>,
    streams: Arc<MemoryStreamStore>,
    cancel: CancellationToken,
    _dir: tempfile::TempDir,
}

async fn rig() -> anyhow::Result<Rig> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("tc.sock");

    let hub = Arc::new(EventHub::new(64));
    let store = Arc::new(
        SessionStore::open_in_memory("laptop").map_err(|e| anyhow::anyhow!("store: {e}"))?,
    );
    let registry = Arc::new(PeerRegistry::new(Arc::clone(&hub), Duration::from_secs(90), "laptop"));
    let streams = Arc::new(MemoryStreamStore::new());
    let bridge = Arc::new(MemoryBridge::new());
    let cancel = CancellationToken::new();

    let lifecycle = Arc::new(LifecycleCoordinator::new(
        Arc::clone(&store),
        Arc::clone(&bridge) as Arc<dyn TerminalBridge>,
        Arc::clone(&hub),
        IdentityResolver::new(PathBuf::from("/srv/help-desk")),
        Arc::new(AdapterRegistry::new(vec![])),
        PollerConfig { tick: Duration::from_millis(20), ..Default::default() },
        cancel.clone(),
    ));
    let remote = Arc::new(RemoteExecutor::new(
        Arc::clone(&streams) as Arc<dyn StreamStore>,
        Arc::clone(&registry),
        "laptop",
    ));
    let deps = Arc::new(ToolDeps {
        lifecycle,
        registry: Arc::clone(&registry),
        streams: Arc::clone(&streams) as Arc<dyn StreamStore>,
        remote,
    });

    registry
        .upsert(HeartbeatRecord {
            computer: "laptop".to_owned(),
            caps: vec!["sessions".to_owned()],
            interests: vec![],
            ts: now_ms(),
        })
        .await;

    let socket = ToolSocket::new(path.clone(), Arc::clone(&deps));
    let accept_cancel = cancel.clone();
    tokio::spawn(async move {
        let _ = socket.run(accept_cancel).await;
    });

    // Wait for the listener to come up.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !path.exists() {
        anyhow::ensure!(tokio::time::Instant::now() < deadline, "socket never bound");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    Ok(Rig { path, deps, bridge, store, streams, cancel, _dir: dir })
}

async fn connect(rig: &Rig, origin: &str, caller: Option<&str>) -> anyhow::Result<UnixStream> {
    let mut stream = UnixStream::connect(&rig.path).await?;
    let hello = serde_json::json!({ "origin": origin, "caller_session_id": caller });
    write_frame(&mut stream, &hello).await.map_err(|e| anyhow::anyhow!("hello: {e}"))?;
    Ok(stream)
}

async fn call(
    stream: &mut UnixStream,
    request: serde_json::Value,
) -> anyhow::Result<serde_json::Value> {
    write_frame(stream, &request).await.map_err(|e| anyhow::anyhow!("write: {e}"))?;
    recv(stream).await
}

async fn recv(stream: &mut UnixStream) -> anyhow::Result<serde_json::Value> {
    let frame = tokio::time::timeout(Duration::from_secs(3), read_frame(stream))
        .await?
        .map_err(|e| anyhow::anyhow!("read: {e}"))?;
    frame.ok_or_else(|| anyhow::anyhow!("connection closed"))
}

async fn start_session(rig: &Rig, stream: &mut UnixStream) -> anyhow::Result<String> {
    let response = call(
        stream,
        serde_json::json!({
            "rpc": "start_session",
            "computer": "laptop",
            "project_path": "/srv/app",
            "agent": "claude",
            "title": "test",
        }),
    )
    .await?;
    let session_id = response["result"]["session_id"].as_str().unwrap_or_default().to_owned();
    anyhow::ensure!(!session_id.is_empty(), "no session id in {response}");
    Ok(session_id)
}

fn chunk_entry(session_id: &str, seq: u64, payload: &str) -> anyhow::Result<Vec<u8>> {
    wire::encode(&WireEntry::Output(OutputChunk {
        session_id: session_id.to_owned(),
        sequence: seq,
        chunk_kind: ChunkKind::Chunk,
        payload: payload.to_owned(),
        ts: now_ms(),
        origin: "laptop".to_owned(),
    }))
    .map_err(|e| anyhow::anyhow!("encode: {e}"))
}

#[tokio::test]
async fn framing_round_trips() -> anyhow::Result<()> {
    let (mut a, mut b) = tokio::io::duplex(1024);
    let value = serde_json::json!({"rpc": "list_computers", "nested": {"x": [1, 2, 3]}});
    write_frame(&mut a, &value).await.map_err(|e| anyhow::anyhow!("{e}"))?;
    let back = read_frame(&mut b).await.map_err(|e| anyhow::anyhow!("{e}"))?;
    assert_eq!(back, Some(value));

    // Clean EOF reads as None.
    drop(a);
    let end = read_frame(&mut b).await.map_err(|e| anyhow::anyhow!("{e}"))?;
    assert_eq!(end, None);
    Ok(())
}

#[tokio::test]
async fn list_computers_and_sessions() -> anyhow::Result<()> {
    let rig = rig().await?;
    let mut stream = connect(&rig, "local_tui", None).await?;

    let response = call(&mut stream, serde_json::json!({"rpc": "list_computers"})).await?;
    assert_eq!(response["final"], true);
    assert_eq!(response["result"]["computers"][0]["name"], "laptop");

    let session_id = start_session(&rig, &mut stream).await?;
    let response =
        call(&mut stream, serde_json::json!({"rpc": "list_sessions", "filter": {}})).await?;
    assert_eq!(response["result"]["sessions"][0]["session_id"], session_id.as_str());

    let record = rig.store.get(&session_id)?;
    assert_eq!(record.origin_adapter, "local");

    rig.cancel.cancel();
    Ok(())
}

#[tokio::test]
async fn unknown_rpc_is_a_typed_error() -> anyhow::Result<()> {
    let rig = rig().await?;
    let mut stream = connect(&rig, "local_tui", None).await?;

    let response = call(&mut stream, serde_json::json!({"rpc": "make_coffee"})).await?;
    assert_eq!(response["error"]["kind"], "PermanentTransport");
    assert_eq!(response["final"], true);

    // The connection stays usable afterwards.
    let response = call(&mut stream, serde_json::json!({"rpc": "list_computers"})).await?;
    assert!(response["result"].is_object());

    rig.cancel.cancel();
    Ok(())
}

#[tokio::test]
async fn empty_message_is_a_no_op() -> anyhow::Result<()> {
    let rig = rig().await?;
    let mut stream = connect(&rig, "local_tui", None).await?;
    let session_id = start_session(&rig, &mut stream).await?;

    let response = call(
        &mut stream,
        serde_json::json!({"rpc": "send_message", "session_id": session_id, "message": ""}),
    )
    .await?;
    assert_eq!(response["result"]["delivered"], false);
    assert_eq!(response["final"], true);
    assert!(rig.bridge.written(&session_id).await.is_empty());

    rig.cancel.cancel();
    Ok(())
}

#[tokio::test]
async fn send_message_streams_then_closes_the_window() -> anyhow::Result<()> {
    let rig = rig().await?;
    let mut stream = connect(&rig, "local_tui", None).await?;
    let session_id = start_session(&rig, &mut stream).await?;

    // Simulate the output publisher while the window is open.
    {
        let streams = Arc::clone(&rig.streams);
        let key = keys::output(&session_id);
        let c1 = chunk_entry(&session_id, 1, "total 4")?;
        let c2 = chunk_entry(&session_id, 2, "drwxr-xr-x app")?;
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let _ = streams.append(&key, c1).await;
            tokio::time::sleep(Duration::from_millis(50)).await;
            let _ = streams.append(&key, c2).await;
        });
    }

    write_frame(
        &mut stream,
        &serde_json::json!({
            "rpc": "send_message",
            "session_id": session_id,
            "message": "ls\r",
            "interest_window_seconds": 0.5,
        }),
    )
    .await
    .map_err(|e| anyhow::anyhow!("{e}"))?;

    let first = recv(&mut stream).await?;
    assert_eq!(first["kind"], "output");
    assert_eq!(first["sequence"], 1);
    assert_eq!(first["payload"], "total 4");

    let second = recv(&mut stream).await?;
    assert_eq!(second["sequence"], 2);

    let sentinel = recv(&mut stream).await?;
    assert_eq!(sentinel["kind"], "interest_window_closed");
    assert_eq!(sentinel["next_sequence"], 2);
    assert_eq!(sentinel["final"], true);

    // The message reached the terminal and the session is still alive.
    assert_eq!(rig.bridge.written(&session_id).await, b"ls\r");
    assert_ne!(
        rig.store.get(&session_id)?.status,
        crate::store::SessionStatus::Terminated
    );

    rig.cancel.cancel();
    Ok(())
}

#[tokio::test]
async fn get_session_status_resumes_from_checkpoint() -> anyhow::Result<()> {
    let rig = rig().await?;
    let mut stream = connect(&rig, "local_tui", None).await?;
    let session_id = start_session(&rig, &mut stream).await?;
    let key = keys::output(&session_id);

    for seq in 1..=2u64 {
        rig.streams.append(&key, chunk_entry(&session_id, seq, &format!("line {seq}"))?).await?;
    }

    // Explicit since: chunks after sequence 1.
    let response = call(
        &mut stream,
        serde_json::json!({
            "rpc": "get_session_status",
            "session_id": session_id,
            "since_sequence": 1,
        }),
    )
    .await?;
    assert_eq!(response["result"]["new_output"].as_array().map(|a| a.len()), Some(1));
    assert_eq!(response["result"]["new_output"][0]["sequence"], 2);
    assert_eq!(response["result"]["next_sequence"], 2);

    // No since: resumes from the advanced checkpoint, so nothing new.
    let response = call(
        &mut stream,
        serde_json::json!({"rpc": "get_session_status", "session_id": session_id}),
    )
    .await?;
    assert_eq!(response["result"]["new_output"].as_array().map(|a| a.len()), Some(0));

    // New output appears on the next checkpointed call.
    rig.streams.append(&key, chunk_entry(&session_id, 3, "line 3")?).await?;
    let response = call(
        &mut stream,
        serde_json::json!({"rpc": "get_session_status", "session_id": session_id}),
    )
    .await?;
    assert_eq!(response["result"]["new_output"][0]["sequence"], 3);

    rig.cancel.cancel();
    Ok(())
}

#[tokio::test]
async fn end_session_is_gated_by_origin() -> anyhow::Result<()> {
    let rig = rig().await?;
    let mut tui = connect(&rig, "local_tui", None).await?;
    let session_id = start_session(&rig, &mut tui).await?;

    // A stranger agent may not end someone else's session.
    let mut stranger = connect(&rig, "agent_of_session", Some("s-other")).await?;
    let response = call(
        &mut stranger,
        serde_json::json!({"rpc": "end_session", "session_id": session_id}),
    )
    .await?;
    assert_eq!(response["error"]["kind"], "PermissionDenied");

    // The local TUI may.
    let response =
        call(&mut tui, serde_json::json!({"rpc": "end_session", "session_id": session_id})).await?;
    assert_eq!(response["result"]["ended"], true);
    assert_eq!(rig.store.get(&session_id)?.status, crate::store::SessionStatus::Terminated);

    rig.cancel.cancel();
    Ok(())
}

#[tokio::test]
async fn unknown_session_is_not_found() -> anyhow::Result<()> {
    let rig = rig().await?;
    let mut stream = connect(&rig, "local_tui", None).await?;

    let response = call(
        &mut stream,
        serde_json::json!({"rpc": "get_session_status", "session_id": "ghost"}),
    )
    .await?;
    assert_eq!(response["error"]["kind"], "NotFound");

    // Starting on an offline computer is NotFound too.
    let response = call(
        &mut stream,
        serde_json::json!({
            "rpc": "start_session",
            "computer": "workstation",
            "project_path": "/srv/app",
            "agent": "claude",
        }),
    )
    .await?;
    assert_eq!(response["error"]["kind"], "NotFound");

    rig.cancel.cancel();
    Ok(())
}

#[tokio::test]
async fn observe_session_streams_from_a_position() -> anyhow::Result<()> {
    let rig = rig().await?;
    let mut stream = connect(&rig, "local_tui", None).await?;
    let session_id = start_session(&rig, &mut stream).await?;
    let key = keys::output(&session_id);

    for seq in 1..=3u64 {
        rig.streams.append(&key, chunk_entry(&session_id, seq, &format!("line {seq}"))?).await?;
    }

    write_frame(
        &mut stream,
        &serde_json::json!({
            "rpc": "observe_session",
            "session_id": session_id,
            "from_sequence": 1,
            "interest_window_seconds": 0.3,
        }),
    )
    .await
    .map_err(|e| anyhow::anyhow!("{e}"))?;

    let first = recv(&mut stream).await?;
    assert_eq!(first["sequence"], 2);
    let second = recv(&mut stream).await?;
    assert_eq!(second["sequence"], 3);
    let sentinel = recv(&mut stream).await?;
    assert_eq!(sentinel["kind"], "interest_window_closed");

    rig.cancel.cancel();
    Ok(())
}

#[tokio::test]
async fn deps_are_shared_across_connections() -> anyhow::Result<()> {
    let rig = rig().await?;
    let mut a = connect(&rig, "local_tui", None).await?;
    let session_id = start_session(&rig, &mut a).await?;

    let mut b = connect(&rig, "agent_of_session", Some(session_id.as_str())).await?;
    let response =
        call(&mut b, serde_json::json!({"rpc": "list_sessions", "filter": {}})).await?;
    assert_eq!(response["result"]["sessions"][0]["session_id"], session_id.as_str());

    // An agent may end its own session.
    let response =
        call(&mut b, serde_json::json!({"rpc": "end_session", "session_id": session_id})).await?;
    assert_eq!(response["result"]["ended"], true);

    let _ = &rig.deps;
    rig.cancel.cancel();
    Ok(())
}
