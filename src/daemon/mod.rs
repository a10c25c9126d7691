//! The running daemon.
//!
//! # Responsibilities
//! - Build the shared context, tiers and listeners from a configuration
//! - Apply live configuration changes under the pause protocol
//! - Drive the graceful then abrupt shutdown sequence
//! - Produce the read-only views served by the monitoring API
//!
//! # Data Flow
//! ```text
//! listener accept → client.rs session (IO shard)
//!     → handle_request → tiers.select → upstream connection
//! upstream.rs session (IO shard)
//!     → handle_response → operation relay/complete → client
//! control.rs (main runtime, 1s tick)
//!     → tier fitness, operation timeouts, idle clients
//! ```
//!
//! # Design Decisions
//! - IO sessions run on dedicated single-threaded runtimes (shards)
//! - Every loop body runs inside the pause gate, so a reconfiguration sees
//!   a quiescent daemon
//! - Only one configuration change may be pending at a time

pub mod client;
pub mod context;
pub mod control;
pub mod shard;
pub mod upstream;
pub mod worker;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use serde::Serialize;
use thiserror::Error;

use crate::config::diff::diff;
use crate::config::LloadConfig;
use crate::lifecycle::{Shutdown, ShutdownMode};
use crate::load_balancer::backend::BackendSnapshot;
use crate::load_balancer::tier::TierSnapshot;
use crate::net::connection::ConnectionSnapshot;
use crate::net::dialer::Dialer;
use crate::net::listener::{Listener, ListenerError, ListenerHandle};
use crate::reconfig::apply;
use crate::reconfig::change::{Change, ChangeError, ChangeSlot};
use crate::sync::lock;

use self::context::Context;

/// How often shutdown checks whether every client has left.
const DRAIN_POLL: Duration = Duration::from_millis(100);

/// Error type for daemon startup.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("the daemon must be started inside a tokio runtime")]
    NoRuntime,

    #[error("failed to start IO shards: {0}")]
    Shards(#[source] std::io::Error),

    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error(transparent)]
    Change(#[from] ChangeError),
}

/// Load balancer state for one process.
pub struct Daemon {
    config: ArcSwap<LloadConfig>,
    ctx: Arc<Context>,
    pub(crate) listeners: Mutex<HashMap<String, ListenerHandle>>,
    changes: ChangeSlot,
    reloading: tokio::sync::Mutex<()>,
    started: Instant,
}

impl std::fmt::Debug for Daemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Daemon")
            .field("ctx", &self.ctx)
            .field("listeners", &lock(&self.listeners).len())
            .finish()
    }
}

impl Daemon {
    /// Bind every listener and start dialling the backends.
    ///
    /// Nothing is started if a listener cannot be bound.
    pub async fn start(
        config: LloadConfig,
        dialer: Arc<dyn Dialer>,
        shutdown: Shutdown,
    ) -> Result<Arc<Self>, DaemonError> {
        let ctx = Context::new(config.daemon.clone(), dialer, shutdown)?;

        for tier_config in &config.tiers {
            let tier = apply::build_tier(&ctx, tier_config);
            if !ctx.tiers.add(tier) {
                tracing::warn!(tier = %tier_config.name, "Duplicate tier ignored");
            }
        }

        let mut bound = Vec::with_capacity(config.listeners.len());
        for listener_config in &config.listeners {
            bound.push((
                listener_config.bind_address.clone(),
                Listener::bind(listener_config).await?,
            ));
        }
        let listeners = bound
            .into_iter()
            .map(|(address, listener)| (address, listener.spawn(ctx.clone())))
            .collect();

        ctx.spawn_control(control::run(ctx.clone()));

        for backend in ctx.tiers.backends() {
            backend.retry();
        }

        tracing::info!(
            io_threads = config.daemon.io_threads,
            worker_threads = config.daemon.worker_threads,
            listeners = config.listeners.len(),
            tiers = config.tiers.len(),
            "lloadd started"
        );

        Ok(Arc::new(Self {
            config: ArcSwap::from_pointee(config),
            ctx,
            listeners: Mutex::new(listeners),
            changes: ChangeSlot::new(),
            reloading: tokio::sync::Mutex::new(()),
            started: Instant::now(),
        }))
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    /// The configuration most recently applied in full.
    pub fn config(&self) -> Arc<LloadConfig> {
        self.config.load_full()
    }

    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        lock(&self.listeners)
            .values()
            .map(ListenerHandle::local_addr)
            .collect()
    }

    /// Apply one change with every event loop paused.
    ///
    /// Fails without side effects when another change is still pending.
    pub async fn reconfigure(&self, change: Change) -> Result<(), ChangeError> {
        self.changes.submit(change)?;
        let paused = self.ctx.gate.pause().await;
        if let Some(change) = self.changes.take() {
            apply::apply(self, change).await;
        }
        paused.resume();
        Ok(())
    }

    /// Bring the daemon in line with `new`. Returns the number of changes applied.
    pub async fn reload(&self, new: LloadConfig) -> Result<usize, ChangeError> {
        let _reloading = self.reloading.lock().await;
        let old = self.config.load_full();
        let changes = diff(&old, &new);
        if changes.is_empty() {
            tracing::info!("Configuration unchanged");
            return Ok(0);
        }
        let count = changes.len();
        for change in changes {
            self.reconfigure(change).await?;
        }
        self.config.store(Arc::new(new));
        tracing::info!(changes = count, "Configuration reloaded");
        Ok(count)
    }

    /// Stop accepting, let clients finish, then drop everything.
    pub async fn shutdown(&self) {
        for (_, mut handle) in lock(&self.listeners).drain() {
            handle.stop();
        }

        let shutdown = self.ctx.shutdown().clone();
        if shutdown.mode() < ShutdownMode::Abrupt {
            shutdown.trigger(ShutdownMode::Graceful);
            {
                let _loop = self.ctx.gate.enter().await;
                self.ctx.clients.close_all(true);
            }
            let grace = self.ctx.settings().timeouts.shutdown();
            tracing::info!(
                clients = self.ctx.clients.len(),
                grace_secs = grace.as_secs(),
                "Waiting for clients to finish"
            );
            let drained = tokio::time::timeout(grace, async {
                while !self.ctx.clients.is_empty() {
                    tokio::select! {
                        _ = self.ctx.clients.wait_closed() => {}
                        _ = tokio::time::sleep(DRAIN_POLL) => {}
                        _ = shutdown.reached(ShutdownMode::Abrupt) => break,
                    }
                }
            })
            .await;
            if drained.is_err() {
                tracing::warn!(clients = self.ctx.clients.len(), "Grace period over, dropping clients");
            }
        }

        shutdown.trigger(ShutdownMode::Abrupt);
        {
            let _loop = self.ctx.gate.enter().await;
            self.ctx.clients.close_all(false);
            for backend in self.ctx.tiers.backends() {
                backend.remove();
            }
        }
        self.ctx.stop_shards();
        tracing::info!("lloadd stopped");
    }

    // --- Monitoring ---

    pub fn snapshot(&self) -> DaemonSnapshot {
        let settings = self.ctx.settings();
        let mut listeners: Vec<String> = self
            .local_addrs()
            .into_iter()
            .map(|addr| addr.to_string())
            .collect();
        listeners.sort();
        DaemonSnapshot {
            version: env!("CARGO_PKG_VERSION"),
            uptime_secs: self.started.elapsed().as_secs(),
            shutdown: self.ctx.shutdown().mode(),
            io_threads: self.ctx.shards().len(),
            worker_threads: settings.worker_threads,
            listeners,
            tiers: self.ctx.tiers.all().len(),
            backends: self.ctx.tiers.backends().len(),
            clients: self.ctx.clients.len(),
            in_loop: self.ctx.gate.in_loop(),
        }
    }

    pub fn tiers(&self) -> Vec<TierSnapshot> {
        self.ctx.tiers.all().iter().map(|t| t.snapshot()).collect()
    }

    pub fn backends(&self) -> Vec<BackendSnapshot> {
        self.ctx
            .tiers
            .backends()
            .iter()
            .map(|b| b.snapshot())
            .collect()
    }

    pub fn connections(&self) -> ConnectionsSnapshot {
        let mut clients: Vec<ConnectionSnapshot> =
            self.ctx.clients.all().iter().map(|c| c.snapshot()).collect();
        clients.sort_by_key(|c| c.id);
        let upstream = self
            .ctx
            .tiers
            .backends()
            .iter()
            .flat_map(|b| b.connections())
            .map(|c| c.snapshot())
            .collect();
        ConnectionsSnapshot { clients, upstream }
    }
}

/// Daemon-wide summary.
#[derive(Debug, Clone, Serialize)]
pub struct DaemonSnapshot {
    pub version: &'static str,
    pub uptime_secs: u64,
    pub shutdown: ShutdownMode,
    pub io_threads: usize,
    pub worker_threads: usize,
    pub listeners: Vec<String>,
    pub tiers: usize,
    pub backends: usize,
    pub clients: usize,
    pub in_loop: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionsSnapshot {
    pub clients: Vec<ConnectionSnapshot>,
    pub upstream: Vec<ConnectionSnapshot>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DaemonSettings, ListenerConfig, TierConfig, TierKind};
    use crate::reconfig::change::{ChangeFlags, ChangeTarget};
    use crate::testing::{self, PendingDialer};

    fn config() -> LloadConfig {
        LloadConfig {
            daemon: DaemonSettings {
                io_threads: 1,
                worker_threads: 1,
                ..DaemonSettings::default()
            },
            listeners: vec![ListenerConfig {
                bind_address: "127.0.0.1:0".into(),
                max_connections: 8,
            }],
            tiers: vec![TierConfig {
                name: "main".into(),
                policy: TierKind::RoundRobin,
                backends: vec![testing::backend_config("a", 2, 0)],
            }],
            ..LloadConfig::default()
        }
    }

    #[tokio::test]
    async fn start_dials_backends() {
        let dialer = Arc::new(PendingDialer::default());
        let daemon = Daemon::start(config(), dialer.clone(), Shutdown::new())
            .await
            .unwrap();
        dialer.wait_for_attempts(2).await;

        let snapshot = daemon.snapshot();
        assert_eq!(snapshot.listeners.len(), 1);
        assert_eq!(snapshot.tiers, 1);
        assert_eq!(snapshot.backends, 1);
        assert_eq!(snapshot.shutdown, ShutdownMode::Running);
        daemon.shutdown().await;
        assert!(daemon.local_addrs().is_empty());
        assert_eq!(daemon.snapshot().shutdown, ShutdownMode::Abrupt);
        assert!(daemon.ctx.tiers.backends().iter().all(|b| b.is_removed()));
    }

    #[tokio::test]
    async fn pending_change_is_refused() {
        let dialer = Arc::new(PendingDialer::default());
        let daemon = Daemon::start(config(), dialer, Shutdown::new()).await.unwrap();
        let settings = daemon.config().daemon.clone();

        daemon
            .changes
            .submit(Change::modify(ChangeTarget::Daemon(settings.clone()), ChangeFlags::NONE))
            .unwrap();
        let err = daemon
            .reconfigure(Change::modify(ChangeTarget::Daemon(settings), ChangeFlags::NONE))
            .await
            .unwrap_err();
        assert_eq!(err, ChangeError::Pending);
        daemon.shutdown().await;
    }

    #[tokio::test]
    async fn reload_adds_and_removes_backends() {
        let dialer = Arc::new(PendingDialer::default());
        let daemon = Daemon::start(config(), dialer, Shutdown::new()).await.unwrap();

        let mut next = config();
        next.tiers[0].backends = vec![testing::backend_config("b", 1, 0)];
        let applied = daemon.reload(next.clone()).await.unwrap();
        assert_eq!(applied, 2);

        let names: Vec<String> = daemon.backends().into_iter().map(|b| b.name).collect();
        assert_eq!(names, vec!["b".to_string()]);
        assert_eq!(daemon.reload(next).await.unwrap(), 0);
        daemon.shutdown().await;
    }

    #[tokio::test]
    async fn bind_failure_aborts_start() {
        let mut config = config();
        config.listeners[0].bind_address = "256.0.0.1:0".into();
        let err = Daemon::start(config, Arc::new(PendingDialer::default()), Shutdown::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DaemonError::Listener(_)));
    }
}
