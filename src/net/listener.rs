//! TCP listener implementation with backpressure.
//!
//! # Responsibilities
//! - Bind to configured address(es)
//! - Accept incoming TCP connections
//! - Enforce max_connections limit via semaphore
//! - Mute on descriptor exhaustion until a client connection closes

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, Semaphore};

use crate::config::ListenerConfig;
use crate::daemon::client;
use crate::daemon::context::Context;

/// How long a muted listener waits for a connection to close before retrying.
const MUTE_RETRY: Duration = Duration::from_secs(1);

/// Error type for listener operations.
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("invalid listen address '{address}': {reason}")]
    Address { address: String, reason: String },

    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },
}

/// Where accepted sockets come from.
#[async_trait]
pub trait Incoming: Send + Sync + 'static {
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)>;
}

#[async_trait]
impl Incoming for TcpListener {
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self).await
    }
}

/// A bounded TCP listener that limits concurrent connections.
///
/// Uses a semaphore to enforce `max_connections`. When the limit is reached,
/// new connections wait in the kernel backlog until a slot becomes available.
#[derive(Debug)]
pub struct Listener<I = TcpListener> {
    inner: I,
    /// Semaphore to limit concurrent connections.
    connection_limit: Arc<Semaphore>,
    local_addr: SocketAddr,
}

/// Running accept loop; dropping the handle does not stop it, `stop` does.
#[derive(Debug)]
pub struct ListenerHandle {
    local_addr: SocketAddr,
    muted: Arc<AtomicBool>,
    stop: Option<oneshot::Sender<()>>,
}

impl ListenerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Whether accepting is suspended for lack of descriptors.
    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    pub fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

impl Listener {
    /// Bind to the configured address with connection limits.
    pub async fn bind(config: &ListenerConfig) -> Result<Self, ListenerError> {
        let addr: SocketAddr =
            config
                .bind_address
                .parse()
                .map_err(|e: std::net::AddrParseError| ListenerError::Address {
                    address: config.bind_address.clone(),
                    reason: e.to_string(),
                })?;

        let bind_err = |source| ListenerError::Bind {
            address: config.bind_address.clone(),
            source,
        };
        let listener = TcpListener::bind(addr).await.map_err(bind_err)?;
        let local_addr = listener.local_addr().map_err(bind_err)?;

        tracing::info!(
            address = %local_addr,
            max_connections = config.max_connections,
            "Listener bound"
        );

        Ok(Self {
            inner: listener,
            connection_limit: Arc::new(Semaphore::new(config.max_connections)),
            local_addr,
        })
    }

}

impl<I: Incoming> Listener<I> {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Run the accept loop on the main runtime.
    pub fn spawn(self, ctx: Arc<Context>) -> ListenerHandle {
        let (stop_tx, stop_rx) = oneshot::channel();
        let local_addr = self.local_addr;
        let muted = Arc::new(AtomicBool::new(false));
        let control = ctx.clone();
        control.spawn_control(self.accept_loop(ctx, muted.clone(), stop_rx));
        ListenerHandle {
            local_addr,
            muted,
            stop: Some(stop_tx),
        }
    }

    async fn accept_loop(
        self,
        ctx: Arc<Context>,
        muted: Arc<AtomicBool>,
        mut stop: oneshot::Receiver<()>,
    ) {
        loop {
            // Acquire permit first (backpressure)
            let permit = tokio::select! {
                permit = self.connection_limit.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = &mut stop => break,
            };

            let accepted = tokio::select! {
                res = self.inner.accept() => res,
                _ = &mut stop => break,
            };

            match accepted {
                Ok((stream, peer)) => {
                    let stream = match stream.into_std() {
                        Ok(stream) => stream,
                        Err(e) => {
                            tracing::warn!(%peer, error = %e, "Failed to detach accepted socket");
                            continue;
                        }
                    };
                    let _loop = ctx.gate.enter().await;
                    client::accept(&ctx, stream, peer, permit);
                }
                Err(e) if is_descriptor_exhaustion(&e) => {
                    drop(permit);
                    tracing::warn!(
                        address = %self.local_addr,
                        error = %e,
                        "Out of file descriptors, listener muted"
                    );
                    muted.store(true, Ordering::SeqCst);
                    tokio::select! {
                        _ = ctx.clients.wait_closed() => {}
                        _ = tokio::time::sleep(MUTE_RETRY) => {}
                        _ = &mut stop => break,
                    }
                    muted.store(false, Ordering::SeqCst);
                    tracing::info!(address = %self.local_addr, "Listener unmuted");
                }
                Err(e) => {
                    tracing::debug!(address = %self.local_addr, error = %e, "Accept failed");
                }
            }
        }
        tracing::info!(address = %self.local_addr, "Listener stopped");
    }
}

/// EMFILE or ENFILE.
fn is_descriptor_exhaustion(e: &io::Error) -> bool {
    matches!(e.raw_os_error(), Some(23) | Some(24))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    use crate::net::connection::{ConnectionKind, ConnectionParams, Owner};
    use crate::testing;

    /// Fails the first accept with EMFILE, then never yields a socket.
    #[derive(Debug, Default)]
    struct OutOfDescriptors {
        attempts: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Incoming for OutOfDescriptors {
        async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
            if self.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(io::Error::from_raw_os_error(24));
            }
            std::future::pending().await
        }
    }

    async fn wait_for(mut check: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !check() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn exhaustion_mutes_until_a_client_closes() {
        let (ctx, _dialer) = testing::context();
        let (client, _rx) = ctx.clients.open(ConnectionParams {
            peer: "client".into(),
            owner: Owner::None,
            kind: ConnectionKind::Open,
            shard: 0,
            write_high_water: 0,
            permit: None,
        });

        let incoming = OutOfDescriptors::default();
        let attempts = incoming.attempts.clone();
        let listener = Listener {
            inner: incoming,
            connection_limit: Arc::new(Semaphore::new(4)),
            local_addr: "127.0.0.1:389".parse().unwrap(),
        };
        let mut handle = listener.spawn(ctx.clone());

        wait_for(|| handle.is_muted()).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 1);

        let muted_at = Instant::now();
        client.destroy();
        wait_for(|| !handle.is_muted()).await;
        wait_for(|| attempts.load(Ordering::SeqCst) == 2).await;
        // woken by the close, not by the retry timer
        assert!(muted_at.elapsed() < MUTE_RETRY);

        handle.stop();
    }

    #[tokio::test]
    async fn binds_ephemeral_port() {
        let listener = Listener::bind(&ListenerConfig {
            bind_address: "127.0.0.1:0".into(),
            max_connections: 4,
        })
        .await
        .unwrap();
        assert_ne!(listener.local_addr().port(), 0);
    }

    #[tokio::test]
    async fn rejects_bad_address() {
        let err = Listener::bind(&ListenerConfig {
            bind_address: "not-an-address".into(),
            max_connections: 4,
        })
        .await
        .unwrap_err();
        assert!(matches!(err, ListenerError::Address { .. }));
    }

    #[test]
    fn descriptor_exhaustion_is_recognised() {
        assert!(is_descriptor_exhaustion(&std::io::Error::from_raw_os_error(24)));
        assert!(is_descriptor_exhaustion(&std::io::Error::from_raw_os_error(23)));
        assert!(!is_descriptor_exhaustion(&std::io::Error::from_raw_os_error(104)));
    }
}
