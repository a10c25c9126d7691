//! Fixtures shared by the unit tests.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::Notify;

use crate::config::{BackendConfig, DaemonSettings};
use crate::daemon::context::Context;
use crate::lifecycle::Shutdown;
use crate::load_balancer::backend::{Backend, Pool};
use crate::net::connection::{Connection, ConnectionKind, ConnectionParams, Owner};
use crate::net::dialer::{BoxedStream, Dialer};

/// Dialer whose connection attempts never finish.
#[derive(Debug, Default)]
pub struct PendingDialer {
    attempts: AtomicUsize,
    notify: Notify,
}

impl PendingDialer {
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub async fn wait_for_attempts(&self, n: usize) {
        let wait = async {
            loop {
                let notified = self.notify.notified();
                if self.attempts() >= n {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), wait)
            .await
            .expect("dial attempts did not happen");
    }
}

#[async_trait]
impl Dialer for PendingDialer {
    async fn connect(&self, _address: &str) -> io::Result<BoxedStream> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_waiters();
        std::future::pending().await
    }
}

/// Context with one IO shard and a dialer that never connects.
///
/// Must be called inside a tokio runtime.
pub fn context() -> (Arc<Context>, Arc<PendingDialer>) {
    let dialer = Arc::new(PendingDialer::default());
    let settings = DaemonSettings {
        io_threads: 1,
        worker_threads: 1,
        ..DaemonSettings::default()
    };
    let ctx = Context::new(settings, dialer.clone(), Shutdown::new()).expect("test context");
    (ctx, dialer)
}

pub fn backend_config(name: &str, numconns: usize, bindconns: usize) -> BackendConfig {
    BackendConfig {
        name: name.to_string(),
        uri: "ldap://127.0.0.1:1".to_string(),
        weight: 1,
        numconns,
        bindconns,
        max_pending_ops: 0,
        conn_max_pending: 0,
        max_opening: (numconns + bindconns).max(1),
        retry_ms: 10,
        retry_max_ms: 100,
        bindconf: None,
    }
}

/// A regular upstream connection adopted straight into `backend`'s pool.
pub fn ready_connection(backend: &Arc<Backend>) -> (Arc<Connection>, UnboundedReceiver<Bytes>) {
    backend
        .adopt(Pool::Regular, backend.generation(), "test".to_string(), 0, 0)
        .expect("backend accepts connection")
}

/// A client connection that belongs to no registry.
pub fn client() -> (Arc<Connection>, UnboundedReceiver<Bytes>) {
    Connection::new(ConnectionParams {
        peer: "client".to_string(),
        owner: Owner::None,
        kind: ConnectionKind::Open,
        shard: 0,
        write_high_water: 0,
        permit: None,
    })
}
