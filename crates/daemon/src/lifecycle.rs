// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Daemon lifecycle: startup, shutdown, module wiring.
//!
//! Startup order: rotate the previous log, take the pid lock, open
//! storage, build the router, register core modules, load system
//! transformers, emit `system:startup`, distribute `system:context`
//! (registry availability only), emit `system:ready` and start
//! background tasks, then start transports.

use crate::env;
use crate::monitor::MonitorService;
use crate::registry::SystemRegistry;
use crate::transport::{TransportError, UnixTransport, WebSocketTransport};
use fs2::FileExt;
use ksi_core::{IdGen, SystemClock, UuidIdGen};
use ksi_engine::{
    CheckpointEngine, ContextService, ErrorHandlerService, EventRouter, IntrospectionService,
    RouterConfig, RoutingService, StateStore,
};
use ksi_storage::{CheckpointDb, ContextDb, EventLog, StorageError};
use serde_json::json;
use std::fmt;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{info, warn};

/// Bounded wait for `shutdown:acknowledge` from critical services.
const SHUTDOWN_ACK_TIMEOUT: Duration = Duration::from_secs(30);

/// Interval for the routing TTL sweep.
const TTL_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Interval for hot-context aging.
const HOT_AGING_INTERVAL: Duration = Duration::from_secs(300);

/// Interval for cold-context and event-index retention sweeps.
const COLD_SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

/// Event index rows older than this are swept (30 days).
const EVENT_INDEX_RETENTION_SECS: f64 = 30.0 * 24.0 * 3600.0;

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("another daemon already holds the lock at {0}")]
    LockFailed(PathBuf),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Daemon configuration: the `var/` layout under one root directory.
#[derive(Debug, Clone)]
pub struct Config {
    pub root: PathBuf,
    pub socket_path: PathBuf,
    pub pid_path: PathBuf,
    pub log_path: PathBuf,
    pub events_dir: PathBuf,
    pub events_db_path: PathBuf,
    pub context_db_path: PathBuf,
    pub checkpoint_db_path: PathBuf,
    pub transformers_dir: PathBuf,
    /// WebSocket bind; `None` disables the transport.
    pub websocket_bind: Option<(String, u16)>,
    pub cors_origins: Vec<String>,
    pub checkpoint_disabled: bool,
    pub reset_checkpoint_db: bool,
}

impl Config {
    /// Layout rooted at `root`.
    pub fn at(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            socket_path: root.join("var/run/daemon.sock"),
            pid_path: root.join("var/run/ksi_daemon.pid"),
            log_path: root.join("var/log/daemon.log.jsonl"),
            events_dir: root.join("var/lib/events"),
            events_db_path: root.join("var/db/events.db"),
            context_db_path: root.join("var/db/context.db"),
            checkpoint_db_path: root.join("var/db/checkpoint.db"),
            transformers_dir: root.join("var/lib/transformers/system"),
            websocket_bind: None,
            cors_origins: Vec::new(),
            checkpoint_disabled: false,
            reset_checkpoint_db: false,
            root,
        }
    }

    /// Configuration from the environment.
    pub fn load() -> Self {
        let mut config = Self::at(env::root_dir());
        config.websocket_bind = env::websocket_bind();
        config.cors_origins = env::websocket_cors_origins();
        config.checkpoint_disabled = env::checkpoint_disabled();
        config.reset_checkpoint_db = env::reset_checkpoint_db();
        config
    }
}

/// A running daemon.
pub struct Daemon {
    pub config: Config,
    pub router: EventRouter,
    pub state: Arc<StateStore>,
    pub routing: Arc<RoutingService>,
    pub checkpoint: Arc<CheckpointEngine>,
    pub monitor: Arc<MonitorService>,
    pub registry: SystemRegistry,
    pub shutdown: Arc<Notify>,
    pub start_time: Instant,
    event_log: EventLog,
    unix: UnixTransport,
    websocket: Option<WebSocketTransport>,
    // NOTE(lifetime): held to maintain the exclusive pid lock
    #[allow(dead_code)]
    lock_file: File,
}

impl fmt::Debug for Daemon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Daemon").finish_non_exhaustive()
    }
}

/// Start the daemon: storage, router, modules, transformers, transports.
pub async fn startup(config: Config) -> Result<Daemon, LifecycleError> {
    let start_time = Instant::now();
    let lock_file = acquire_pid_lock(&config)?;

    // Storage first: cold contexts, event log, checkpoint db.
    let (cold_contexts, _context_writer) = ContextDb::open(&config.context_db_path).await?;
    let (event_log, _log_writer) =
        EventLog::open(&config.events_dir, &config.events_db_path).await?;
    let checkpoint_db =
        CheckpointDb::open(&config.checkpoint_db_path, config.reset_checkpoint_db).await?;

    let idgen: Arc<dyn IdGen> = Arc::new(UuidIdGen);
    let clock = Arc::new(SystemClock);

    let router = EventRouter::new(RouterConfig {
        idgen: idgen.clone(),
        clock: clock.clone(),
        cold_contexts: Some(cold_contexts),
        event_log: Some(event_log.clone()),
    });

    // Core modules. State registers first; other services look
    // capabilities and entities up through it.
    let state = StateStore::new(clock.clone());
    state.register(&router);
    crate::health::register(&router, start_time);
    crate::modules::register(&router);
    let monitor = MonitorService::new(clock.clone());
    monitor.register(&router);
    let checkpoint = CheckpointEngine::new(checkpoint_db, config.checkpoint_disabled);
    checkpoint.register(&router);
    let routing = RoutingService::new(idgen.clone(), clock.clone());
    routing.register(&router);
    IntrospectionService::register(&router);
    ContextService::register(&router);
    ErrorHandlerService::register(&router);

    // System transformers from var/lib/transformers/system/*.yaml.
    match ksi_transform::load_transformer_dir(&config.transformers_dir) {
        Ok(defs) => {
            let count = defs.len();
            for def in defs {
                router.register_transformer(def, None, 100, None);
            }
            if count > 0 {
                info!(count, "loaded system transformers");
            }
        }
        Err(e) => warn!(error = %e, "failed to load system transformers"),
    }

    let _ = router
        .emit(
            "system:startup",
            json!({"root": config.root.display().to_string()}),
        )
        .await;

    let shutdown = Arc::new(Notify::new());
    let registry = SystemRegistry::new(state.clone(), router.handle(), shutdown.clone());
    let _ = router
        .emit("system:context", json!({"registry_available": true}))
        .await;

    // system:ready triggers checkpoint restore; background tasks start
    // right after.
    let _ = router.emit("system:ready", json!({})).await;

    router.start_task(
        "routing_service:ttl_sweep",
        routing.clone().ttl_task(router.handle(), TTL_SWEEP_INTERVAL),
    );
    let contexts = router.contexts();
    router.start_task("context_manager:hot_aging", async move {
        let mut ticker = tokio::time::interval(HOT_AGING_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            contexts.age_out();
        }
    });
    let contexts = router.contexts();
    let sweep_log = event_log.clone();
    let sweep_clock = clock.clone();
    router.start_task("context_manager:cold_sweep", async move {
        let mut ticker = tokio::time::interval(COLD_SWEEP_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            contexts.sweep_cold().await;
            let cutoff = ksi_core::Clock::timestamp(&*sweep_clock) - EVENT_INDEX_RETENTION_SECS;
            if let Err(e) = sweep_log.sweep_index_before(cutoff).await {
                warn!(error = %e, "event index sweep failed");
            }
        }
    });

    // Transports last: the daemon is fully wired before it accepts work.
    let unix = UnixTransport::spawn(
        &config.socket_path,
        router.handle(),
        monitor.clone(),
        idgen.clone(),
    )?;
    let websocket = match &config.websocket_bind {
        Some((host, port)) => Some(
            WebSocketTransport::spawn(
                host,
                *port,
                config.cors_origins.clone(),
                router.handle(),
                monitor.clone(),
                idgen.clone(),
            )
            .await?,
        ),
        None => None,
    };

    info!(
        socket = %config.socket_path.display(),
        websocket = config.websocket_bind.is_some(),
        "daemon ready"
    );

    Ok(Daemon {
        config,
        router,
        state,
        routing,
        checkpoint,
        monitor,
        registry,
        shutdown,
        start_time,
        event_log,
        unix,
        websocket,
        lock_file,
    })
}

impl Daemon {
    /// Graceful shutdown: transports stop first, then `system:shutdown`
    /// with bounded acknowledgment wait, then background tasks and
    /// storage flushes.
    pub async fn shutdown(self) {
        info!("shutting down daemon");

        self.unix.stop();
        if let Some(websocket) = &self.websocket {
            websocket.stop();
        }

        self.router.begin_shutdown();
        let _ = self.router.emit("system:shutdown", json!({})).await;
        let acknowledged = self
            .router
            .wait_for_shutdown_acks(&["checkpoint".to_string()], SHUTDOWN_ACK_TIMEOUT)
            .await;
        if !acknowledged {
            warn!("some services did not acknowledge shutdown in time");
        }

        self.router.stop_all_tasks();

        // Drain storage writers before the process exits.
        self.router.contexts().flush_cold().await;
        if let Err(e) = self.event_log.flush().await {
            warn!(error = %e, "event log flush failed on shutdown");
        }

        let _ = std::fs::remove_file(&self.config.pid_path);
        info!("daemon stopped");
    }
}

/// Take the exclusive pid lock, writing our pid into the file.
fn acquire_pid_lock(config: &Config) -> Result<File, LifecycleError> {
    if let Some(parent) = config.pid_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(&config.pid_path)?;
    file.try_lock_exclusive()
        .map_err(|_| LifecycleError::LockFailed(config.pid_path.clone()))?;
    file.set_len(0)?;
    writeln!(file, "{}", std::process::id())?;
    Ok(file)
}

/// Maximum daemon log size before startup rotation (10 MB).
const MAX_LOG_SIZE: u64 = 10 * 1024 * 1024;

/// Number of rotated log files kept.
const MAX_ROTATED_LOGS: u32 = 3;

/// Rotate the daemon log if it exceeds [`MAX_LOG_SIZE`].
///
/// Shifts `daemon.log.jsonl` -> `.1` -> `.2` -> `.3`, deleting the
/// oldest. Best-effort: rotation failures never block startup.
pub fn rotate_log_if_needed(log_path: &std::path::Path) {
    let size = match std::fs::metadata(log_path) {
        Ok(m) => m.len(),
        Err(_) => return,
    };
    if size < MAX_LOG_SIZE {
        return;
    }

    let log_str = log_path.display().to_string();
    for i in (1..MAX_ROTATED_LOGS).rev() {
        let from = format!("{log_str}.{i}");
        let to = format!("{log_str}.{}", i + 1);
        let _ = std::fs::rename(&from, &to);
    }
    let _ = std::fs::rename(log_path, format!("{log_str}.1"));
}

#[cfg(test)]
#[path = "lifecycle_tests.rs"]
mod tests;
