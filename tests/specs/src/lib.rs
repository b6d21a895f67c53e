// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Test harness for end-to-end binary smoke tests.
//!
//! Spawns the real `teleclaude` binary as a subprocess and exercises it
//! over the HTTP adapter and the tool socket.

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use tokio::net::UnixStream;

use teleclaude::toolsock::{read_frame, write_frame};

/// Resolve the path to the compiled `teleclaude` binary.
pub fn daemon_binary() -> PathBuf {
    let manifest = Path::new(env!("CARGO_MANIFEST_DIR"));
    // tests/specs → tests → workspace root
    let workspace = manifest.parent().and_then(|p| p.parent()).unwrap_or(manifest);
    workspace.join("target").join("debug").join("teleclaude")
}

/// Find a free TCP port by binding to :0 then releasing.
pub fn free_port() -> anyhow::Result<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

/// Whether tmux is installed (session-creating tests skip without it).
pub fn tmux_available() -> bool {
    Command::new("tmux")
        .arg("-V")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Minimal HTTP/1.1 GET returning the response body.
pub async fn http_get(port: u16, path: &str) -> anyhow::Result<String> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", port)).await?;
    let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await?;

    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await?;
    let response = String::from_utf8(buf)?;
    let body = response.split_once("\r\n\r\n").map(|(_, b)| b).unwrap_or("").to_string();
    Ok(body)
}

/// A running `teleclaude` daemon, killed on drop.
pub struct DaemonProcess {
    child: Child,
    pub port: u16,
    pub socket_path: PathBuf,
    tmux_socket: PathBuf,
    _state_dir: tempfile::TempDir,
}

impl DaemonProcess {
    /// Spawn the daemon with an isolated state dir, tool socket, and
    /// tmux server, single-node (in-memory stream store).
    pub fn start(computer: &str) -> anyhow::Result<Self> {
        let binary = daemon_binary();
        anyhow::ensure!(binary.exists(), "daemon binary not found at {}", binary.display());

        let state_dir = tempfile::tempdir()?;
        let port = free_port()?;
        let socket_path = state_dir.path().join("tool.sock");
        let tmux_socket = state_dir.path().join("tmux.sock");

        let child = Command::new(&binary)
            .args([
                "--computer-name",
                computer,
                "--state-dir",
                &state_dir.path().to_string_lossy(),
                "--tool-socket",
                &socket_path.to_string_lossy(),
                "--tmux-socket",
                &tmux_socket.to_string_lossy(),
                "--port",
                &port.to_string(),
                "--host",
                "127.0.0.1",
                "--poll-ms",
                "50",
                "--heartbeat-secs",
                "1",
                "--log-format",
                "text",
                "--log-level",
                "warn",
            ])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;

        Ok(Self { child, port, socket_path, tmux_socket, _state_dir: state_dir })
    }

    /// Poll the health endpoint until the daemon responds.
    pub async fn wait_healthy(&self, timeout: Duration) -> anyhow::Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if tokio::time::Instant::now() > deadline {
                anyhow::bail!("daemon did not become healthy within {timeout:?}");
            }
            if let Ok(body) = http_get(self.port, "/api/v1/health").await {
                if body.contains("running") {
                    return Ok(());
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Connect a tool client with the given origin.
    pub async fn tool(&self, origin: &str) -> anyhow::Result<ToolClient> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        let stream = loop {
            match UnixStream::connect(&self.socket_path).await {
                Ok(stream) => break stream,
                Err(_) if tokio::time::Instant::now() < deadline => {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                Err(e) => anyhow::bail!("tool socket never came up: {e}"),
            }
        };
        let mut client = ToolClient { stream };
        client.send(&serde_json::json!({ "origin": origin })).await?;
        Ok(client)
    }

    /// WebSocket URL of the HTTP adapter.
    pub fn ws_url(&self) -> String {
        format!("ws://127.0.0.1:{}/ws", self.port)
    }
}

impl Drop for DaemonProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        // The daemon's tmux server dies with its socket dir, but be
        // explicit so orphaned terminals never outlive a test run.
        let _ = Command::new("tmux")
            .args(["-S"])
            .arg(&self.tmux_socket)
            .args(["kill-server"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
    }
}

/// Framed JSON client for the tool socket.
pub struct ToolClient {
    stream: UnixStream,
}

impl ToolClient {
    pub async fn send(&mut self, value: &serde_json::Value) -> anyhow::Result<()> {
        write_frame(&mut self.stream, value).await.map_err(|e| anyhow::anyhow!("send: {e}"))
    }

    pub async fn recv(&mut self) -> anyhow::Result<serde_json::Value> {
        let frame = tokio::time::timeout(Duration::from_secs(10), read_frame(&mut self.stream))
            .await?
            .map_err(|e| anyhow::anyhow!("recv: {e}"))?;
        frame.ok_or_else(|| anyhow::anyhow!("connection closed"))
    }

    pub async fn call(&mut self, value: serde_json::Value) -> anyhow::Result<serde_json::Value> {
        self.send(&value).await?;
        self.recv().await
    }
}
