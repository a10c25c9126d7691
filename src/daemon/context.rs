//! State shared by every loop of the daemon.

use std::future::Future;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::runtime::Handle;

use crate::config::DaemonSettings;
use crate::daemon::shard::ShardSet;
use crate::daemon::worker::WorkerPool;
use crate::daemon::DaemonError;
use crate::lifecycle::Shutdown;
use crate::load_balancer::pool::Tiers;
use crate::net::clients::ClientRegistry;
use crate::net::dialer::Dialer;
use crate::reconfig::PauseGate;

pub struct Context {
    settings: ArcSwap<DaemonSettings>,
    shards: ArcSwap<ShardSet>,
    workers: ArcSwap<WorkerPool>,
    pub gate: PauseGate,
    pub clients: Arc<ClientRegistry>,
    pub tiers: Arc<Tiers>,
    pub dialer: Arc<dyn Dialer>,
    /// Main multi-threaded runtime: timers, control loop, workers.
    control: Handle,
    shutdown: Shutdown,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("shards", &self.shards.load().len())
            .field("clients", &self.clients.len())
            .finish()
    }
}

impl Context {
    /// Must be called from inside the main runtime.
    pub fn new(
        settings: DaemonSettings,
        dialer: Arc<dyn Dialer>,
        shutdown: Shutdown,
    ) -> Result<Arc<Self>, DaemonError> {
        let control = Handle::try_current().map_err(|_| DaemonError::NoRuntime)?;
        let shards = ShardSet::new(settings.io_threads.max(1)).map_err(DaemonError::Shards)?;
        let workers = WorkerPool::new(settings.worker_threads, control.clone());
        Ok(Arc::new(Self {
            gate: PauseGate::new(settings.timeouts.pause()),
            settings: ArcSwap::from_pointee(settings),
            shards: ArcSwap::from_pointee(shards),
            workers: ArcSwap::from_pointee(workers),
            clients: ClientRegistry::new(),
            tiers: Arc::new(Tiers::new()),
            dialer,
            control,
            shutdown,
        }))
    }

    pub fn settings(&self) -> Arc<DaemonSettings> {
        self.settings.load_full()
    }

    pub fn set_settings(&self, settings: DaemonSettings) {
        self.settings.store(Arc::new(settings));
    }

    pub fn shards(&self) -> Arc<ShardSet> {
        self.shards.load_full()
    }

    /// Start a fresh set of IO threads; the old ones stop once released.
    pub fn replace_shards(&self, count: usize) -> std::io::Result<()> {
        let shards = ShardSet::new(count.max(1))?;
        self.shards.store(Arc::new(shards));
        Ok(())
    }

    /// Stop every IO thread.
    pub fn stop_shards(&self) {
        self.shards.store(Arc::new(ShardSet::empty()));
    }

    pub fn workers(&self) -> Arc<WorkerPool> {
        self.workers.load_full()
    }

    pub fn resize_workers(&self, size: usize) {
        self.workers
            .store(Arc::new(WorkerPool::new(size, self.control.clone())));
    }

    /// Run a timer or housekeeping task on the main runtime.
    pub fn spawn_control<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.control.spawn(fut);
    }

    pub fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }
}
