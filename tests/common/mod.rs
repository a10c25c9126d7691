//! Shared utilities for the integration tests: a scripted directory server,
//! a minimal LDAP client and configuration builders.

#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};

use lloadd::config::{
    BackendConfig, DaemonSettings, ListenerConfig, LloadConfig, TierConfig, TierKind,
};
use lloadd::proto::{ber, tag, Pdu, PduReader, ResultCode};

const MAX_PDU: usize = 1024 * 1024;
const WAIT: Duration = Duration::from_secs(5);

/// A directory server that answers every request with success.
///
/// The diagnostic message of each response carries the server's name, so
/// a test can tell which backend served a request.
pub struct MockDirectory {
    pub addr: SocketAddr,
    requests: Arc<AtomicUsize>,
    connections: Arc<AtomicUsize>,
}

impl MockDirectory {
    pub async fn start(name: &'static str) -> Self {
        Self::start_with_delay(name, Duration::ZERO).await
    }

    /// Like `start`, but every response is held back for `delay`.
    pub async fn start_with_delay(name: &'static str, delay: Duration) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(AtomicUsize::new(0));
        let connections = Arc::new(AtomicUsize::new(0));

        let counter = requests.clone();
        let accepted = connections.clone();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                accepted.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(socket, name, delay, counter.clone()));
            }
        });

        Self {
            addr,
            requests,
            connections,
        }
    }

    pub fn uri(&self) -> String {
        format!("ldap://{}", self.addr)
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

async fn serve(socket: TcpStream, name: &'static str, delay: Duration, requests: Arc<AtomicUsize>) {
    let (read, mut write) = socket.into_split();
    let mut reader = PduReader::new(read, MAX_PDU);
    loop {
        while let Ok(Some(pdu)) = reader.next_pdu() {
            if !tag::is_request(pdu.tag()) {
                continue;
            }
            requests.fetch_add(1, Ordering::SeqCst);
            let Some(response_tag) = tag::response_tag_for(pdu.tag()) else {
                continue;
            };
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let response = Pdu::result(pdu.msgid(), response_tag, ResultCode::Success, name);
            if write.write_all(response.as_bytes()).await.is_err() {
                return;
            }
        }
        match reader.fill().await {
            Ok(true) => {}
            _ => return,
        }
    }
}

/// An address nothing listens on.
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

/// A bare LDAP client.
pub struct LdapClient {
    reader: PduReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl LdapClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read, writer) = stream.into_split();
        Self {
            reader: PduReader::new(read, MAX_PDU),
            writer,
        }
    }

    pub async fn send(&mut self, pdu: &Pdu) {
        self.writer.write_all(pdu.as_bytes()).await.unwrap();
    }

    /// Next message from the balancer; panics on close or after five seconds.
    pub async fn recv(&mut self) -> Pdu {
        tokio::time::timeout(WAIT, async {
            loop {
                if let Some(pdu) = self.reader.next_pdu().unwrap() {
                    return pdu;
                }
                assert!(self.reader.fill().await.unwrap(), "connection closed");
            }
        })
        .await
        .expect("no response from balancer")
    }

    /// Whether the balancer closes the connection within five seconds.
    pub async fn closed(&mut self) -> bool {
        tokio::time::timeout(WAIT, async {
            loop {
                while let Ok(Some(_)) = self.reader.next_pdu() {}
                match self.reader.fill().await {
                    Ok(true) => {}
                    _ => return,
                }
            }
        })
        .await
        .is_ok()
    }

    /// Search and return the response.
    pub async fn search(&mut self, msgid: i32) -> Pdu {
        self.send(&search(msgid)).await;
        self.recv().await
    }
}

fn message(msgid: i32, op_tag: u8, op: &[u8]) -> Pdu {
    let mut body = BytesMut::new();
    ber::put_int(&mut body, ber::INTEGER, msgid as i64);
    ber::put_bytes(&mut body, op_tag, op);
    let mut out = BytesMut::new();
    ber::put_bytes(&mut out, ber::SEQUENCE, &body);
    Pdu::parse(out.freeze()).unwrap()
}

/// A search request; its body is opaque to the balancer.
pub fn search(msgid: i32) -> Pdu {
    let mut op = BytesMut::new();
    ber::put_bytes(&mut op, ber::OCTET_STRING, b"dc=example,dc=com");
    ber::put_int(&mut op, ber::ENUMERATED, 2);
    message(msgid, tag::SEARCH_REQUEST, &op)
}

pub fn unbind(msgid: i32) -> Pdu {
    message(msgid, tag::UNBIND_REQUEST, &[])
}

pub fn extended(msgid: i32, oid: &str) -> Pdu {
    let mut op = BytesMut::new();
    ber::put_bytes(&mut op, ber::CONTEXT_0, oid.as_bytes());
    message(msgid, tag::EXTENDED_REQUEST, &op)
}

pub fn backend(name: &str, uri: String) -> BackendConfig {
    BackendConfig {
        name: name.to_string(),
        uri,
        weight: 1,
        numconns: 2,
        bindconns: 1,
        max_pending_ops: 0,
        conn_max_pending: 0,
        max_opening: 3,
        retry_ms: 50,
        retry_max_ms: 200,
        bindconf: None,
    }
}

/// One listener on an ephemeral port and one round-robin tier.
pub fn config(backends: Vec<BackendConfig>) -> LloadConfig {
    LloadConfig {
        daemon: DaemonSettings {
            io_threads: 2,
            worker_threads: 2,
            ..DaemonSettings::default()
        },
        listeners: vec![ListenerConfig {
            bind_address: "127.0.0.1:0".into(),
            max_connections: 64,
        }],
        tiers: vec![TierConfig {
            name: "main".into(),
            policy: TierKind::RoundRobin,
            backends,
        }],
        ..LloadConfig::default()
    }
}

/// Poll `check` every 20ms for up to five seconds.
pub async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(WAIT, async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Wait until every backend of `daemon` has its pools filled.
pub async fn wait_ready(daemon: &lloadd::Daemon) {
    wait_until(move || async move {
        daemon
            .backends()
            .iter()
            .all(|b| b.active >= 1 && b.bind_conns >= 1)
    })
    .await;
}
