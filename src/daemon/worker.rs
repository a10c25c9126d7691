//! Bounded worker pool for PDU batches that overflow a read cycle.

use std::future::Future;
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::Semaphore;

#[derive(Debug)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    size: usize,
    handle: Handle,
}

impl WorkerPool {
    /// Pool running at most `size` jobs at once on `handle`.
    pub fn new(size: usize, handle: Handle) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
            handle,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Run `job` once a slot is free and wait for its output.
    ///
    /// Returns `None` if the job panicked or the runtime is going away.
    pub async fn run<F, T>(&self, job: F) -> Option<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let permit = self.permits.clone().acquire_owned().await.ok()?;
        let task = self.handle.spawn(async move {
            let _permit = permit;
            job.await
        });
        match task.await {
            Ok(output) => Some(output),
            Err(e) => {
                tracing::error!(error = %e, "Worker job failed");
                None
            }
        }
    }
}
