// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Daemon bootstrap — construct every component once, thread the
//! dependencies through constructors, spawn the supervised pumps, and
//! hold the process open until a shutdown signal.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::activity::ActivityCache;
use crate::adapter::{Adapter, AdapterRegistry};
use crate::adapters::local::{LocalAdapter, LocalState};
use crate::adapters::stream::StreamAdapter;
use crate::adapters::telegram::TelegramAdapter;
use crate::bridge::{TerminalBridge, TmuxBridge};
use crate::config::Config;
use crate::hub::EventHub;
use crate::identity::IdentityResolver;
use crate::lifecycle::LifecycleCoordinator;
use crate::poller::PollerConfig;
use crate::registry::PeerRegistry;
use crate::remote::RemoteExecutor;
use crate::store::SessionStore;
use crate::streams::{JetStreamStore, MemoryStreamStore, StreamStore};
use crate::toolsock::{ToolDeps, ToolSocket};

/// Initialize tracing/logging from config.
///
/// Uses `try_init` so it's safe to call multiple times (e.g. from tests).
pub fn init_tracing(config: &Config) {
    use tracing_subscriber::fmt;

    // Priority: --log-level / TC_LOG_LEVEL > RUST_LOG > default ("info").
    let filter = if std::env::var("TC_LOG_LEVEL").is_err() && config.log_level == "info" {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level))
    } else {
        EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let result = match config.log_format.as_str() {
        "json" => fmt::fmt().with_env_filter(filter).json().try_init(),
        _ => fmt::fmt().with_env_filter(filter).try_init(),
    };
    drop(result);
}

/// Spawn a task under the supervisor: a panic is an internal-invariant
/// violation — logged with context, then the task restarts with backoff
/// while the process stays up. Clean returns are final.
pub fn spawn_supervised<F, Fut>(name: &'static str, cancel: CancellationToken, factory: F)
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut delay = Duration::from_millis(100);
        loop {
            if cancel.is_cancelled() {
                return;
            }
            let handle = tokio::spawn(factory());
            match handle.await {
                Ok(()) => return,
                Err(e) if e.is_panic() => {
                    error!(task = name, "InternalInvariant: task panicked, restarting in {delay:?}");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return,
                    }
                    delay = (delay * 2).min(Duration::from_secs(10));
                }
                Err(_) => return,
            }
        }
    });
}

/// Run the daemon to completion (until SIGINT/SIGTERM).
pub async fn run(config: Config) -> anyhow::Result<()> {
    init_tracing(&config);

    let computer = config.computer();
    let state_dir = config.state_dir();
    std::fs::create_dir_all(&state_dir)?;
    info!(computer = %computer, state = %state_dir.display(), "teleclaude starting");

    let cancel = CancellationToken::new();

    // Core singletons, built once and threaded through constructors.
    let hub = Arc::new(EventHub::default());
    let store = Arc::new(SessionStore::open(&config.db_path(), &computer)?);
    let activity = Arc::new(ActivityCache::new(config.freshness()));
    let registry = Arc::new(PeerRegistry::new(Arc::clone(&hub), config.freshness(), &computer));

    let streams: Arc<dyn StreamStore> = match config.stream_url {
        Some(ref url) => {
            info!(url = %url, "connecting stream store");
            Arc::new(
                JetStreamStore::connect(url, config.output_ttl(), config.heartbeat_ttl()).await?,
            )
        }
        None => {
            warn!("no stream store configured, running single-node in memory");
            Arc::new(MemoryStreamStore::new())
        }
    };

    // Adapters. The stream adapter is always present (it owns the
    // output streams even single-node); chat and HTTP are optional.
    let stream_adapter = Arc::new(StreamAdapter::new(
        Arc::clone(&streams),
        Arc::clone(&store),
        Arc::clone(&hub),
        Arc::clone(&registry),
        Arc::clone(&activity),
        &computer,
        config.interests.clone(),
        config.heartbeat_interval(),
        config.heartbeat_ttl(),
    ));
    let local_adapter = Arc::new(LocalAdapter::new(
        Arc::new(LocalState {
            hub: Arc::clone(&hub),
            store: Arc::clone(&store),
            registry: Arc::clone(&registry),
            activity: Arc::clone(&activity),
        }),
        &config.host,
        config.port,
    ));

    let mut adapters: Vec<Arc<dyn Adapter>> =
        vec![Arc::clone(&stream_adapter) as Arc<dyn Adapter>, local_adapter];
    if let (Some(token), Some(chat_id)) = (&config.telegram_token, config.telegram_chat_id) {
        adapters.push(Arc::new(TelegramAdapter::new(
            token,
            chat_id,
            config.telegram_control_topic,
            Arc::clone(&hub),
            Arc::clone(&store),
            &computer,
        )));
    }
    let adapters = Arc::new(AdapterRegistry::new(adapters));

    let bridge: Arc<dyn TerminalBridge> =
        Arc::new(TmuxBridge::with_socket(config.tmux_socket.clone()));

    let lifecycle = Arc::new(LifecycleCoordinator::new(
        Arc::clone(&store),
        bridge,
        Arc::clone(&hub),
        IdentityResolver::new(config.help_desk.clone()),
        Arc::clone(&adapters),
        PollerConfig {
            tick: config.poll_tick(),
            cols: config.cols,
            rows: config.rows,
            idle_after: config.idle_after(),
            ..Default::default()
        },
        cancel.clone(),
    ));
    stream_adapter.set_lifecycle(Arc::clone(&lifecycle));

    // Re-bind terminals that survived a previous daemon.
    if let Err(e) = lifecycle.reconcile_startup().await {
        warn!(err = %e, "startup reconciliation failed");
    }

    // Start adapters. A failing optional adapter degrades the surface
    // but does not take the daemon down.
    for adapter in adapters.all() {
        if let Err(e) = adapter.start().await {
            error!(adapter = adapter.name(), err = %e, "adapter failed to start");
        }
    }

    // Supervised pumps.
    {
        let lifecycle = Arc::clone(&lifecycle);
        let loop_cancel = cancel.clone();
        spawn_supervised("input-loop", cancel.clone(), move || {
            Arc::clone(&lifecycle).run_input_loop(loop_cancel.clone())
        });
    }
    {
        let registry = Arc::clone(&registry);
        let sweep_cancel = cancel.clone();
        spawn_supervised("peer-sweeper", cancel.clone(), move || {
            Arc::clone(&registry).run_sweeper(sweep_cancel.clone())
        });
    }
    {
        let deps = Arc::new(ToolDeps {
            lifecycle: Arc::clone(&lifecycle),
            registry: Arc::clone(&registry),
            streams: Arc::clone(&streams),
            remote: Arc::new(RemoteExecutor::new(
                Arc::clone(&streams),
                Arc::clone(&registry),
                &computer,
            )),
        });
        let path = config.socket_path();
        let sock_cancel = cancel.clone();
        spawn_supervised("tool-socket", cancel.clone(), move || {
            let socket = ToolSocket::new(path.clone(), Arc::clone(&deps));
            let cancel = sock_cancel.clone();
            async move {
                if let Err(e) = socket.run(cancel).await {
                    error!(err = %e, "tool socket failed");
                }
            }
        });
    }

    spawn_signal_handler(cancel.clone());

    info!(computer = %computer, "teleclaude running");
    cancel.cancelled().await;

    info!("shutting down");
    for adapter in adapters.all() {
        adapter.stop().await;
    }
    Ok(())
}

/// First signal cancels gracefully; a second forces exit.
fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).ok();
        let mut sigint =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt()).ok();

        tokio::select! {
            _ = async {
                if let Some(ref mut s) = sigterm { s.recv().await } else { std::future::pending().await }
            } => {
                info!("received SIGTERM");
            }
            _ = async {
                if let Some(ref mut s) = sigint { s.recv().await } else { std::future::pending().await }
            } => {
                info!("received SIGINT");
            }
        }
        cancel.cancel();

        tokio::select! {
            _ = async {
                if let Some(ref mut s) = sigterm { s.recv().await } else { std::future::pending().await }
            } => {
                info!("received SIGTERM again, forcing exit");
            }
            _ = async {
                if let Some(ref mut s) = sigint { s.recv().await } else { std::future::pending().await }
            } => {
                info!("received SIGINT again, forcing exit");
            }
        }
        std::process::exit(130);
    });
}
