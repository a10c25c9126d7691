//! Shutdown coordination for the daemon.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;

/// How far shutdown has progressed. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ShutdownMode {
    Running,
    /// Stop accepting, let operations in flight finish.
    Graceful,
    /// Drop every connection now.
    Abrupt,
}

/// Coordinator for graceful and abrupt shutdown.
///
/// Long-running tasks subscribe and unwind when the mode changes.
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<ShutdownMode>>,
}

impl Shutdown {
    /// Create a new shutdown coordinator.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ShutdownMode::Running);
        Self { tx: Arc::new(tx) }
    }

    /// Subscribe to mode changes.
    pub fn subscribe(&self) -> watch::Receiver<ShutdownMode> {
        self.tx.subscribe()
    }

    pub fn mode(&self) -> ShutdownMode {
        *self.tx.borrow()
    }

    /// Escalate to `mode`. Requests to go back are ignored.
    pub fn trigger(&self, mode: ShutdownMode) -> bool {
        self.tx.send_if_modified(|current| {
            if mode > *current {
                *current = mode;
                true
            } else {
                false
            }
        })
    }

    /// Resolves once the mode is at least `mode`.
    pub async fn reached(&self, mode: ShutdownMode) -> ShutdownMode {
        let mut rx = self.subscribe();
        let reached = match rx.wait_for(|current| *current >= mode).await {
            Ok(current) => *current,
            Err(_) => ShutdownMode::Abrupt,
        };
        reached
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}
