//! Quiescence gate for configuration changes.
//!
//! # Responsibilities
//! - Let every event loop (client, upstream, listener, control, timers)
//!   mark the span in which it touches shared state
//! - Let a reconfiguration wait until no loop is inside such a span and
//!   keep new ones out until it resumes
//!
//! # Design Decisions
//! - Loops hold a read guard of a fair `RwLock`; `pause` takes the write
//!   guard, so loops arriving after a pause request queue behind it
//! - A loop never awaits while it holds its guard
//! - Failing to quiesce within the timeout means a loop broke the rule
//!   above; the process aborts

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

/// Shared handle on the gate; clones refer to the same gate.
#[derive(Debug, Clone)]
pub struct PauseGate {
    lock: Arc<RwLock<()>>,
    in_loop: Arc<AtomicUsize>,
    timeout_ms: Arc<AtomicU64>,
}

/// Held by a loop while it handles one event.
#[derive(Debug)]
pub struct LoopGuard {
    in_loop: Arc<AtomicUsize>,
    _read: OwnedRwLockReadGuard<()>,
}

impl Drop for LoopGuard {
    fn drop(&mut self) {
        // runs before the read guard is released
        self.in_loop.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Proof that every loop is parked. Dropping it resumes them.
#[derive(Debug)]
pub struct Paused {
    _write: OwnedRwLockWriteGuard<()>,
}

impl Paused {
    /// Reopen the gate for all loops at once.
    pub fn resume(self) {
        tracing::debug!("Resuming event loops");
    }
}

impl PauseGate {
    pub fn new(timeout: Duration) -> Self {
        Self {
            lock: Arc::new(RwLock::new(())),
            in_loop: Arc::new(AtomicUsize::new(0)),
            timeout_ms: Arc::new(AtomicU64::new(timeout.as_millis() as u64)),
        }
    }

    /// Enter the gate for one event; waits while a pause is requested or held.
    pub async fn enter(&self) -> LoopGuard {
        let read = self.lock.clone().read_owned().await;
        self.in_loop.fetch_add(1, Ordering::SeqCst);
        LoopGuard {
            in_loop: self.in_loop.clone(),
            _read: read,
        }
    }

    /// Number of loops currently inside the gate.
    pub fn in_loop(&self) -> usize {
        self.in_loop.load(Ordering::SeqCst)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.load(Ordering::Relaxed))
    }

    pub fn set_timeout(&self, timeout: Duration) {
        self.timeout_ms
            .store(timeout.as_millis() as u64, Ordering::Relaxed);
    }

    /// Wait for every loop to leave the gate and hold it closed.
    ///
    /// Must not be called while holding a `LoopGuard`.
    pub async fn pause(&self) -> Paused {
        let timeout = self.timeout();
        match tokio::time::timeout(timeout, self.lock.clone().write_owned()).await {
            Ok(write) => {
                tracing::debug!("Event loops paused");
                Paused { _write: write }
            }
            Err(_) => {
                tracing::error!(
                    timeout_secs = timeout.as_secs(),
                    in_loop = self.in_loop(),
                    "Event loops failed to quiesce, aborting"
                );
                std::process::abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[tokio::test]
    async fn pause_waits_for_loops_to_leave() {
        let gate = PauseGate::new(Duration::from_secs(5));
        let guard = gate.enter().await;
        assert_eq!(gate.in_loop(), 1);

        let pauser = gate.clone();
        let paused = tokio::spawn(async move {
            let p = pauser.pause().await;
            let seen = pauser.in_loop();
            p.resume();
            seen
        });
        tokio::task::yield_now().await;
        assert!(!paused.is_finished());

        drop(guard);
        assert_eq!(paused.await.unwrap(), 0);
        assert_eq!(gate.in_loop(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn no_loop_runs_while_paused() {
        let gate = PauseGate::new(Duration::from_secs(10));
        let stop = Arc::new(AtomicBool::new(false));
        let mut loops = Vec::new();
        for _ in 0..8 {
            let gate = gate.clone();
            let stop = stop.clone();
            loops.push(tokio::spawn(async move {
                while !stop.load(Ordering::Relaxed) {
                    let guard = gate.enter().await;
                    std::hint::spin_loop();
                    drop(guard);
                    tokio::task::yield_now().await;
                }
            }));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        for _ in 0..20 {
            let paused = gate.pause().await;
            assert_eq!(gate.in_loop(), 0);
            tokio::time::sleep(Duration::from_millis(1)).await;
            assert_eq!(gate.in_loop(), 0);
            paused.resume();
            tokio::task::yield_now().await;
        }

        stop.store(true, Ordering::Relaxed);
        for handle in loops {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn resume_reopens_the_gate() {
        let gate = PauseGate::new(Duration::from_secs(1));
        let paused = gate.pause().await;
        assert!(
            tokio::time::timeout(Duration::from_millis(20), gate.enter())
                .await
                .is_err()
        );
        paused.resume();
        let _guard = gate.enter().await;
        assert_eq!(gate.in_loop(), 1);
    }
}
