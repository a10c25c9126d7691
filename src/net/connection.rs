//! Connection state machine and lifetime protocol.
//!
//! # Responsibilities
//! - Track protocol state, kind and IO sub-state of one LDAP session
//! - Own the operations in flight on the session, keyed by message id
//! - Enforce the reference/liveness discipline: a connection is destroyed
//!   exactly once and finalized when the last reference is released
//! - Queue outbound PDUs for the writer task and expose backpressure
//!
//! # Design Decisions
//! - Memory is reclaimed by `Arc`; `refcnt` and `live` model the logical lifetime
//! - `destroy` is the only consumer of the liveness token
//! - `destroy` and `close` must not be called with this connection's lock held
//! - Operation links are only locked after a connection lock, never before

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch, Notify, OwnedSemaphorePermit};

use crate::load_balancer::backend::Backend;
use crate::load_balancer::SelectStatus;
use crate::net::clients::ClientRegistry;
use crate::net::operation::{Operation, OperationResult};
use crate::sync::lock;

/// Global atomic counter for connection IDs.
/// Using relaxed ordering is sufficient since we only need uniqueness, not synchronization.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Protocol state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Zero value, never observed on a registered connection.
    Invalid,
    /// Idle and available.
    Ready,
    /// An exclusive exchange (connection setup) is in progress.
    Active,
    /// An authentication exchange is in progress.
    Binding,
    /// Draining: no new operations, existing ones finish.
    Closing,
    /// Unlinked, awaiting the final reference release.
    Dying,
}

/// Role of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionKind {
    /// Client connection or unauthenticated regular upstream.
    Open,
    /// Upstream still running its setup exchange.
    Preparing,
    /// Upstream reserved for forwarding client binds.
    Bind,
    /// Regular upstream authenticated with the backend credentials.
    Privileged,
}

/// IO sub-state, independent from the protocol state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IoState {
    Operational,
    /// A worker owns the current batch of PDUs.
    ReadHandover,
    /// Reading is suspended until the peer drains its output.
    ReadPause,
}

/// Collection that links a connection while it is alive.
pub enum Owner {
    None,
    Clients(Weak<ClientRegistry>),
    Backend(Arc<Backend>),
}

impl fmt::Debug for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Owner::None => write!(f, "None"),
            Owner::Clients(_) => write!(f, "Clients"),
            Owner::Backend(b) => write!(f, "Backend({})", b.name()),
        }
    }
}

/// Construction parameters.
#[derive(Debug)]
pub struct ConnectionParams {
    pub peer: String,
    pub owner: Owner,
    pub kind: ConnectionKind,
    pub shard: usize,
    /// Queued output above which readers feeding this connection pause (0 = never).
    pub write_high_water: usize,
    /// Listener slot, released when the connection is finalized.
    pub permit: Option<OwnedSemaphorePermit>,
}

#[derive(Debug)]
struct Inner {
    state: ConnectionState,
    kind: ConnectionKind,
    io_state: IoState,
    ops: HashMap<i32, Arc<Operation>>,
    next_msgid: i32,
    writer: Option<mpsc::UnboundedSender<Bytes>>,
    permit: Option<OwnedSemaphorePermit>,
    last_activity: Instant,
}

impl Inner {
    /// Next message id not currently in use, skipping 0.
    fn allocate_msgid(&mut self) -> i32 {
        loop {
            let id = self.next_msgid;
            self.next_msgid = if id == i32::MAX { 1 } else { id + 1 };
            if !self.ops.contains_key(&id) {
                return id;
            }
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    received: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

/// One client or upstream LDAP session.
pub struct Connection {
    id: ConnectionId,
    peer: String,
    shard: usize,
    owner: Owner,
    high_water: usize,
    inner: Mutex<Inner>,
    refcnt: AtomicUsize,
    live: AtomicBool,
    freed: AtomicBool,
    queued: AtomicUsize,
    drained: Notify,
    closed: watch::Sender<bool>,
    counters: Counters,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("owner", &self.owner)
            .field("refcnt", &self.refcnt.load(Ordering::Relaxed))
            .field("live", &self.live.load(Ordering::Relaxed))
            .finish()
    }
}

/// A counted reference; released on drop.
#[derive(Debug)]
pub struct ConnectionRef {
    conn: Arc<Connection>,
}

impl std::ops::Deref for ConnectionRef {
    type Target = Arc<Connection>;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl Drop for ConnectionRef {
    fn drop(&mut self) {
        self.conn.release_ref();
    }
}

/// Destroys the connection when the owning task ends, however it ends.
#[derive(Debug)]
pub struct DestroyOnDrop(pub Arc<Connection>);

impl Drop for DestroyOnDrop {
    fn drop(&mut self) {
        self.0.destroy();
    }
}

impl Connection {
    /// Create a connection holding its liveness reference.
    ///
    /// The receiver yields the bytes queued by `send` and belongs to the
    /// writer task.
    pub fn new(params: ConnectionParams) -> (Arc<Self>, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);
        let state = match params.kind {
            ConnectionKind::Preparing => ConnectionState::Active,
            _ => ConnectionState::Ready,
        };
        let conn = Arc::new(Self {
            id: ConnectionId::new(),
            peer: params.peer,
            shard: params.shard,
            owner: params.owner,
            high_water: params.write_high_water,
            inner: Mutex::new(Inner {
                state,
                kind: params.kind,
                io_state: IoState::Operational,
                ops: HashMap::new(),
                next_msgid: 1,
                writer: Some(tx),
                permit: params.permit,
                last_activity: Instant::now(),
            }),
            refcnt: AtomicUsize::new(1),
            live: AtomicBool::new(true),
            freed: AtomicBool::new(false),
            queued: AtomicUsize::new(0),
            drained: Notify::new(),
            closed,
            counters: Counters::default(),
        });
        (conn, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn shard(&self) -> usize {
        self.shard
    }

    /// Backend owning this connection, for upstream connections.
    pub fn backend(&self) -> Option<&Arc<Backend>> {
        match &self.owner {
            Owner::Backend(b) => Some(b),
            _ => None,
        }
    }

    // --- Lifetime ---

    /// Take a counted reference; fails once the connection is being destroyed.
    pub fn acquire_ref(self: &Arc<Self>) -> Option<ConnectionRef> {
        if !self.live.load(Ordering::SeqCst) {
            return None;
        }
        let mut current = self.refcnt.load(Ordering::SeqCst);
        loop {
            if current == 0 {
                return None;
            }
            match self.refcnt.compare_exchange_weak(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        Some(ConnectionRef { conn: self.clone() })
    }

    fn release_ref(&self) {
        if self.refcnt.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.finalize();
        }
    }

    fn finalize(&self) {
        if self.freed.swap(true, Ordering::SeqCst) {
            tracing::error!(connection_id = %self.id, "Connection finalized twice");
            return;
        }
        let mut inner = lock(&self.inner);
        inner.writer = None;
        inner.permit = None;
        inner.ops.clear();
        tracing::trace!(connection_id = %self.id, peer = %self.peer, "Connection freed");
    }

    /// Tear the connection down. Idempotent.
    ///
    /// Every operation in flight is detached and its other side told,
    /// the connection is unlinked from its owner and the liveness
    /// reference released.
    pub fn destroy(&self) {
        if !self.live.swap(false, Ordering::SeqCst) {
            return;
        }
        let ops = {
            let mut inner = lock(&self.inner);
            inner.state = ConnectionState::Dying;
            std::mem::take(&mut inner.ops)
        };
        tracing::debug!(
            connection_id = %self.id,
            peer = %self.peer,
            pending = ops.len(),
            "Connection destroyed"
        );

        let _ = self.closed.send(true);
        self.drained.notify_waiters();

        for op in ops.into_values() {
            op.on_connection_destroyed(self.id);
        }

        match &self.owner {
            Owner::None => {}
            Owner::Clients(registry) => {
                if let Some(registry) = registry.upgrade() {
                    registry.remove(self.id);
                }
            }
            Owner::Backend(backend) => backend.unlink_connection(self.id),
        }

        self.release_ref();
    }

    /// Close the connection; a gentle close lets operations in flight finish.
    pub fn close(&self, gentle: bool) {
        if gentle {
            let idle = {
                let mut inner = lock(&self.inner);
                if inner.state == ConnectionState::Dying {
                    return;
                }
                inner.state = ConnectionState::Closing;
                inner.ops.is_empty()
            };
            if !idle {
                return;
            }
        }
        self.destroy();
    }

    pub fn is_alive(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    pub fn is_freed(&self) -> bool {
        self.freed.load(Ordering::SeqCst)
    }

    pub fn refcount(&self) -> usize {
        self.refcnt.load(Ordering::SeqCst)
    }

    /// Resolves once `destroy` has run.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    // --- State ---

    pub fn state(&self) -> ConnectionState {
        lock(&self.inner).state
    }

    pub fn kind(&self) -> ConnectionKind {
        lock(&self.inner).kind
    }

    pub fn io_state(&self) -> IoState {
        lock(&self.inner).io_state
    }

    pub fn set_io_state(&self, io_state: IoState) {
        lock(&self.inner).io_state = io_state;
    }

    /// Enter `Binding` unless closing.
    pub fn begin_binding(&self) -> bool {
        let mut inner = lock(&self.inner);
        if inner.state != ConnectionState::Ready {
            return false;
        }
        inner.state = ConnectionState::Binding;
        true
    }

    /// Leave `Binding`; other states are untouched.
    pub fn end_binding(&self) {
        let mut inner = lock(&self.inner);
        if inner.state == ConnectionState::Binding {
            inner.state = ConnectionState::Ready;
        }
    }

    /// Finish connection setup and make the connection selectable.
    pub fn make_ready(&self, kind: ConnectionKind) -> bool {
        let mut inner = lock(&self.inner);
        if inner.state != ConnectionState::Active {
            return false;
        }
        inner.state = ConnectionState::Ready;
        inner.kind = kind;
        true
    }

    pub fn touch(&self) {
        lock(&self.inner).last_activity = Instant::now();
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(lock(&self.inner).last_activity)
    }

    // --- Operations ---

    /// Register a request read from this (client) connection.
    ///
    /// Fails when closing or when the message id is already in use.
    pub fn register_client_operation(&self, op: &Arc<Operation>) -> bool {
        let mut inner = lock(&self.inner);
        if matches!(inner.state, ConnectionState::Closing | ConnectionState::Dying) {
            return false;
        }
        if inner.ops.contains_key(&op.client_msgid()) {
            return false;
        }
        inner.ops.insert(op.client_msgid(), op.clone());
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Register an operation on this upstream under a fresh message id.
    ///
    /// `binding` reserves the connection for the bind exchange.
    pub fn try_register_upstream(
        self: &Arc<Self>,
        op: &Arc<Operation>,
        max_pending: usize,
        binding: bool,
    ) -> Result<i32, SelectStatus> {
        let mut inner = lock(&self.inner);
        match inner.state {
            ConnectionState::Ready => {}
            ConnectionState::Active | ConnectionState::Binding => {
                return Err(SelectStatus::Busy)
            }
            _ => return Err(SelectStatus::Unavailable),
        }
        if max_pending > 0 && inner.ops.len() >= max_pending {
            return Err(SelectStatus::Busy);
        }
        let msgid = inner.allocate_msgid();
        if !op.attach_upstream(self.clone(), msgid) {
            return Err(SelectStatus::Unavailable);
        }
        inner.ops.insert(msgid, op.clone());
        if binding {
            inner.state = ConnectionState::Binding;
        }
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        Ok(msgid)
    }

    /// Remove `op` if it is still registered under `msgid`.
    ///
    /// A closing connection is destroyed once its last operation leaves.
    pub fn unregister(&self, msgid: i32, op: &Arc<Operation>) -> bool {
        let (removed, drained) = {
            let mut inner = lock(&self.inner);
            match inner.ops.get(&msgid) {
                Some(registered) if Arc::ptr_eq(registered, op) => {
                    inner.ops.remove(&msgid);
                    (true, inner.state == ConnectionState::Closing && inner.ops.is_empty())
                }
                _ => (false, false),
            }
        };
        if drained {
            self.destroy();
        }
        removed
    }

    /// Remove and return the operation registered under `msgid`.
    pub fn take_operation(&self, msgid: i32) -> Option<Arc<Operation>> {
        let (op, drained) = {
            let mut inner = lock(&self.inner);
            let op = inner.ops.remove(&msgid);
            let drained = op.is_some()
                && inner.state == ConnectionState::Closing
                && inner.ops.is_empty();
            (op, drained)
        };
        if drained {
            self.destroy();
        }
        op
    }

    pub fn operation(&self, msgid: i32) -> Option<Arc<Operation>> {
        lock(&self.inner).ops.get(&msgid).cloned()
    }

    pub fn operations(&self) -> Vec<Arc<Operation>> {
        lock(&self.inner).ops.values().cloned().collect()
    }

    pub fn pending_ops(&self) -> usize {
        lock(&self.inner).ops.len()
    }

    /// Message id for a request that expects no response (abandon).
    pub fn allocate_msgid(&self) -> i32 {
        lock(&self.inner).allocate_msgid()
    }

    pub(crate) fn record_result(&self, result: OperationResult) {
        match result {
            OperationResult::Completed => {
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
            }
            OperationResult::Failed | OperationResult::Rejected => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
            }
            OperationResult::Pending => {}
        }
    }

    // --- Output ---

    /// Queue bytes for the writer. Returns false once the writer is gone.
    pub fn send(&self, bytes: Bytes) -> bool {
        let inner = lock(&self.inner);
        let Some(writer) = &inner.writer else {
            return false;
        };
        let len = bytes.len();
        self.queued.fetch_add(len, Ordering::SeqCst);
        if writer.send(bytes).is_err() {
            self.queued.fetch_sub(len, Ordering::SeqCst);
            return false;
        }
        true
    }

    fn written(&self, len: usize) {
        let before = self.queued.fetch_sub(len, Ordering::SeqCst);
        if before.saturating_sub(len) <= self.high_water {
            self.drained.notify_waiters();
        }
    }

    pub fn queued_bytes(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    /// Whether readers feeding this connection should stop reading.
    pub fn is_congested(&self) -> bool {
        self.high_water > 0 && self.queued.load(Ordering::SeqCst) > self.high_water
    }

    /// Wait until the output queue is back under the high water mark.
    pub async fn drained(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.is_congested() || !self.is_alive() {
                return;
            }
            notified.await;
        }
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        let inner = lock(&self.inner);
        ConnectionSnapshot {
            id: self.id.as_u64(),
            peer: self.peer.clone(),
            shard: self.shard,
            state: inner.state,
            kind: inner.kind,
            io_state: inner.io_state,
            pending_ops: inner.ops.len(),
            queued_bytes: self.queued.load(Ordering::Relaxed),
            refcount: self.refcnt.load(Ordering::Relaxed),
            received: self.counters.received.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }
}

/// Read-only view for monitoring.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSnapshot {
    pub id: u64,
    pub peer: String,
    pub shard: usize,
    pub state: ConnectionState,
    pub kind: ConnectionKind,
    pub io_state: IoState,
    pub pending_ops: usize,
    pub queued_bytes: usize,
    pub refcount: usize,
    pub received: u64,
    pub completed: u64,
    pub failed: u64,
}

/// Drain the output queue of `conn` into `io`.
///
/// Ends when every sender is gone (the connection was finalized) or a
/// write fails, which destroys the connection.
pub async fn run_writer<W>(
    conn: Arc<Connection>,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    mut io: W,
    write_timeout: Duration,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(chunk) = rx.recv().await {
        let len = chunk.len();
        let res = tokio::time::timeout(write_timeout, io.write_all(&chunk)).await;
        conn.written(len);
        match res {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::debug!(connection_id = %conn.id(), error = %e, "Write failed");
                conn.destroy();
                break;
            }
            Err(_) => {
                tracing::warn!(connection_id = %conn.id(), peer = %conn.peer(), "Write timed out");
                conn.destroy();
                break;
            }
        }
    }
    let _ = io.shutdown().await;
}
