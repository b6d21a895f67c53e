// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

/// Terminal session daemon bridging AI coding agents across machines.
#[derive(Debug, Parser)]
#[command(name = "teleclaude", version, about)]
pub struct Config {
    /// Stable computer name on the mesh. Defaults to the hostname.
    #[arg(long, env = "TC_COMPUTER_NAME")]
    pub computer_name: Option<String>,

    /// State directory (embedded store, default socket path).
    #[arg(long, env = "TC_STATE_DIR")]
    pub state_dir: Option<PathBuf>,

    /// URL of the shared stream store (NATS). Unset runs single-node
    /// with the in-memory store.
    #[arg(long, env = "TC_STREAM_URL")]
    pub stream_url: Option<String>,

    /// Telegram bot token. Unset disables the chat adapter.
    #[arg(long, env = "TC_TELEGRAM_TOKEN")]
    pub telegram_token: Option<String>,

    /// Telegram supergroup chat id.
    #[arg(long, env = "TC_TELEGRAM_CHAT_ID", allow_hyphen_values = true)]
    pub telegram_chat_id: Option<i64>,

    /// Thread id of the control topic in the supergroup.
    #[arg(long, env = "TC_TELEGRAM_CONTROL_TOPIC")]
    pub telegram_control_topic: Option<i32>,

    /// Unix socket path for the colocated tool RPC surface.
    #[arg(long, env = "TC_TOOL_SOCKET")]
    pub tool_socket: Option<PathBuf>,

    /// HTTP port for the local adapter. Unset disables HTTP.
    #[arg(long, env = "TC_PORT")]
    pub port: Option<u16>,

    /// Host address to bind to.
    #[arg(long, env = "TC_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// Heartbeat cadence in seconds.
    #[arg(long, env = "TC_HEARTBEAT_SECS", default_value = "30")]
    pub heartbeat_secs: u64,

    /// Terminal poll tick in milliseconds.
    #[arg(long, env = "TC_POLL_MS", default_value = "100")]
    pub poll_ms: u64,

    /// Quiet seconds before a session is reported idle.
    #[arg(long, env = "TC_IDLE_SECS", default_value = "30")]
    pub idle_secs: u64,

    /// Terminal columns.
    #[arg(long, env = "TC_COLS", default_value = "200")]
    pub cols: u16,

    /// Terminal rows.
    #[arg(long, env = "TC_ROWS", default_value = "50")]
    pub rows: u16,

    /// Idle retention of output streams, in seconds.
    #[arg(long, env = "TC_OUTPUT_TTL_SECS", default_value = "3600")]
    pub output_ttl_secs: u64,

    /// Reserved path for sessions of unknown external users.
    #[arg(long, env = "TC_HELP_DESK", default_value = "/srv/teleclaude/help-desk")]
    pub help_desk: PathBuf,

    /// Isolated tmux server socket (mainly for tests).
    #[arg(long, env = "TC_TMUX_SOCKET")]
    pub tmux_socket: Option<PathBuf>,

    /// Interest classes advertised in heartbeats.
    #[arg(long, env = "TC_INTERESTS", value_delimiter = ',', default_value = "sessions")]
    pub interests: Vec<String>,

    /// Log format (json or text).
    #[arg(long, env = "TC_LOG_FORMAT", default_value = "json")]
    pub log_format: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "TC_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Config {
    /// Validate the configuration after parsing.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.computer().is_empty() {
            anyhow::bail!("computer name cannot be empty (set --computer-name)");
        }
        if self.heartbeat_secs == 0 {
            anyhow::bail!("--heartbeat-secs must be positive");
        }
        if self.poll_ms == 0 {
            anyhow::bail!("--poll-ms must be positive");
        }
        if self.telegram_token.is_some() && self.telegram_chat_id.is_none() {
            anyhow::bail!("--telegram-chat-id is required with --telegram-token");
        }
        Ok(())
    }

    /// The mesh identity, defaulting to the hostname.
    pub fn computer(&self) -> String {
        if let Some(ref name) = self.computer_name {
            return name.trim().to_owned();
        }
        if let Ok(name) = std::env::var("HOSTNAME") {
            if !name.trim().is_empty() {
                return name.trim().to_owned();
            }
        }
        std::fs::read_to_string("/etc/hostname")
            .map(|s| s.trim().to_owned())
            .unwrap_or_else(|_| "localhost".to_owned())
    }

    pub fn state_dir(&self) -> PathBuf {
        if let Some(ref dir) = self.state_dir {
            return dir.clone();
        }
        match std::env::var_os("HOME") {
            Some(home) => PathBuf::from(home).join(".teleclaude"),
            None => PathBuf::from("/tmp/teleclaude"),
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.state_dir().join("state.db")
    }

    pub fn socket_path(&self) -> PathBuf {
        self.tool_socket.clone().unwrap_or_else(|| self.state_dir().join("tool.sock"))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    /// Liveness window: a peer is online while its last heartbeat is
    /// within three cadences.
    pub fn freshness(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs * 3)
    }

    pub fn heartbeat_ttl(&self) -> Duration {
        Duration::from_secs((self.heartbeat_secs * 2).max(60))
    }

    pub fn poll_tick(&self) -> Duration {
        Duration::from_millis(self.poll_ms)
    }

    pub fn idle_after(&self) -> Duration {
        Duration::from_secs(self.idle_secs)
    }

    pub fn output_ttl(&self) -> Duration {
        Duration::from_secs(self.output_ttl_secs)
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
