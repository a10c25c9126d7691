//! IO shards: one OS thread per shard, each driving its own
//! single-threaded tokio runtime.
//!
//! Client sessions stay on the shard picked from their socket; upstream
//! dials are spread round robin. Dropping the set stops every shard, which
//! drops the sessions running there.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use tokio::runtime::{Builder, Handle};
use tokio::sync::oneshot;

#[derive(Debug)]
struct Shard {
    handle: Handle,
    stop: Option<oneshot::Sender<()>>,
}

/// A fixed set of IO threads.
#[derive(Debug)]
pub struct ShardSet {
    shards: Vec<Shard>,
    next: AtomicUsize,
}

impl ShardSet {
    /// Start `count` shard threads.
    pub fn new(count: usize) -> std::io::Result<Self> {
        let mut shards = Vec::with_capacity(count);
        for idx in 0..count {
            let (handle_tx, handle_rx) = std::sync::mpsc::channel();
            let (stop_tx, stop_rx) = oneshot::channel::<()>();

            thread::Builder::new()
                .name(format!("lloadd-io-{}", idx))
                .spawn(move || {
                    let runtime = match Builder::new_current_thread().enable_all().build() {
                        Ok(runtime) => runtime,
                        Err(e) => {
                            let _ = handle_tx.send(Err(e));
                            return;
                        }
                    };
                    let _ = handle_tx.send(Ok(runtime.handle().clone()));
                    let _ = runtime.block_on(stop_rx);
                    tracing::debug!(shard = idx, "IO shard stopped");
                })?;

            let handle = handle_rx
                .recv()
                .map_err(|_| std::io::Error::other("IO shard exited during startup"))??;
            shards.push(Shard {
                handle,
                stop: Some(stop_tx),
            });
        }
        tracing::info!(shards = count, "IO shards started");
        Ok(Self {
            shards,
            next: AtomicUsize::new(0),
        })
    }

    /// A set without threads; spawning on it drops the future.
    pub fn empty() -> Self {
        Self {
            shards: Vec::new(),
            next: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    /// Shard for a stable key such as a socket descriptor.
    pub fn index_for(&self, key: u64) -> usize {
        match self.shards.len() {
            0 => 0,
            n => (key % n as u64) as usize,
        }
    }

    /// Next shard in rotation.
    pub fn next_index(&self) -> usize {
        match self.shards.len() {
            0 => 0,
            n => self.next.fetch_add(1, Ordering::Relaxed) % n,
        }
    }

    /// Run `fut` on shard `idx`. Returns false if there is no such shard.
    pub fn spawn<F>(&self, idx: usize, fut: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match self.shards.get(idx) {
            Some(shard) => {
                shard.handle.spawn(fut);
                true
            }
            None => {
                tracing::debug!(shard = idx, "No such IO shard, task dropped");
                false
            }
        }
    }
}

impl Drop for ShardSet {
    fn drop(&mut self) {
        for shard in &mut self.shards {
            if let Some(stop) = shard.stop.take() {
                let _ = stop.send(());
            }
        }
    }
}
