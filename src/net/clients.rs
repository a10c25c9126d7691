//! Registry of live client connections.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Notify;

use crate::net::connection::{Connection, ConnectionId, ConnectionParams, Owner};

/// Every client connection that has not been destroyed yet.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    conns: DashMap<ConnectionId, Arc<Connection>>,
    closed: Notify,
}

impl ClientRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create a client connection linked into this registry.
    pub fn open(
        self: &Arc<Self>,
        mut params: ConnectionParams,
    ) -> (Arc<Connection>, tokio::sync::mpsc::UnboundedReceiver<bytes::Bytes>) {
        params.owner = Owner::Clients(Arc::downgrade(self));
        let (conn, rx) = Connection::new(params);
        self.conns.insert(conn.id(), conn.clone());
        metrics::gauge!("lloadd_client_connections").set(self.conns.len() as f64);
        (conn, rx)
    }

    /// Unlink a destroyed connection and wake a muted listener.
    pub(crate) fn remove(&self, id: ConnectionId) {
        if self.conns.remove(&id).is_some() {
            metrics::gauge!("lloadd_client_connections").set(self.conns.len() as f64);
            self.closed.notify_waiters();
        }
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    pub fn all(&self) -> Vec<Arc<Connection>> {
        self.conns.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Resolves the next time a client connection goes away.
    pub async fn wait_closed(&self) {
        self.closed.notified().await;
    }

    pub fn close_all(&self, gentle: bool) {
        for conn in self.all() {
            conn.close(gentle);
        }
    }
}
