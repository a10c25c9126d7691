//! In-flight client requests.
//!
//! # Responsibilities
//! - Pair a client request with the upstream connection serving it
//! - Conclude exactly once, whichever path gets there first: terminal
//!   response, abandon, timeout, rejection, or either side going away
//! - Tell the other side when one side is torn down
//!
//! # Design Decisions
//! - Links to both connections live under the operation's own mutex,
//!   never under a connection mutex
//! - The result is a CAS from `Pending`; the winner does all cleanup

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::Serialize;

use crate::net::connection::{Connection, ConnectionId};
use crate::proto::{tag, Pdu, ResultCode};
use crate::sync::lock;

/// How an operation ended.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationResult {
    Pending = 0,
    Rejected = 1,
    Completed = 2,
    Failed = 3,
}

impl From<u8> for OperationResult {
    fn from(val: u8) -> Self {
        match val {
            1 => OperationResult::Rejected,
            2 => OperationResult::Completed,
            3 => OperationResult::Failed,
            _ => OperationResult::Pending,
        }
    }
}

impl OperationResult {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationResult::Pending => "pending",
            OperationResult::Rejected => "rejected",
            OperationResult::Completed => "completed",
            OperationResult::Failed => "failed",
        }
    }
}

#[derive(Debug, Default)]
struct Link {
    client: Option<Arc<Connection>>,
    upstream: Option<Arc<Connection>>,
    upstream_msgid: i32,
    last_response: Option<Instant>,
}

type Detached = (Option<Arc<Connection>>, Option<(Arc<Connection>, i32)>);

/// One client request in flight.
pub struct Operation {
    client_id: ConnectionId,
    client_msgid: i32,
    tag: u8,
    started: Instant,
    result: AtomicU8,
    link: Mutex<Link>,
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("client_id", &self.client_id)
            .field("client_msgid", &self.client_msgid)
            .field("tag", &tag::name(self.tag))
            .field("result", &self.result())
            .finish()
    }
}

impl Operation {
    pub fn new(client: &Arc<Connection>, msgid: i32, tag: u8) -> Arc<Self> {
        Arc::new(Self {
            client_id: client.id(),
            client_msgid: msgid,
            tag,
            started: Instant::now(),
            result: AtomicU8::new(OperationResult::Pending as u8),
            link: Mutex::new(Link {
                client: Some(client.clone()),
                ..Link::default()
            }),
        })
    }

    pub fn client_id(&self) -> ConnectionId {
        self.client_id
    }

    pub fn client_msgid(&self) -> i32 {
        self.client_msgid
    }

    pub fn tag(&self) -> u8 {
        self.tag
    }

    pub fn is_bind(&self) -> bool {
        self.tag == tag::BIND_REQUEST
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.started)
    }

    pub fn result(&self) -> OperationResult {
        self.result.load(Ordering::Acquire).into()
    }

    pub fn client(&self) -> Option<Arc<Connection>> {
        lock(&self.link).client.clone()
    }

    /// Upstream connection and the message id used on it.
    pub fn upstream(&self) -> Option<(Arc<Connection>, i32)> {
        let link = lock(&self.link);
        link.upstream.clone().map(|u| (u, link.upstream_msgid))
    }

    pub fn last_response(&self) -> Option<Instant> {
        lock(&self.link).last_response
    }

    /// Record the upstream side. Fails if the operation already concluded.
    pub fn attach_upstream(&self, upstream: Arc<Connection>, msgid: i32) -> bool {
        let mut link = lock(&self.link);
        if self.result() != OperationResult::Pending || link.client.is_none() {
            return false;
        }
        link.upstream = Some(upstream);
        link.upstream_msgid = msgid;
        true
    }

    /// Clear both links and hand them back.
    pub fn detach(&self) -> Detached {
        let mut link = lock(&self.link);
        let client = link.client.take();
        let upstream = link.upstream.take().map(|u| (u, link.upstream_msgid));
        (client, upstream)
    }

    fn finish(&self, result: OperationResult) -> bool {
        self.result
            .compare_exchange(
                OperationResult::Pending as u8,
                result as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Settle the result and release the upstream side.
    ///
    /// Returns the detached links to the single caller that concluded.
    fn conclude(self: &Arc<Self>, result: OperationResult) -> Option<Detached> {
        if !self.finish(result) {
            return None;
        }
        let (client, upstream) = self.detach();

        if let Some((conn, msgid)) = &upstream {
            conn.unregister(*msgid, self);
            conn.record_result(result);
            if self.is_bind() {
                if result == OperationResult::Completed {
                    conn.end_binding();
                } else {
                    // A bind cannot be abandoned, the connection state is unknown.
                    conn.close(false);
                }
            }
            if let Some(backend) = conn.backend() {
                backend.op_finished(result, self.started.elapsed());
            }
        }

        if let Some(conn) = &client {
            if self.is_bind() {
                conn.end_binding();
            }
            conn.record_result(result);
        }

        metrics::counter!("lloadd_operations_total", "result" => result.as_str()).increment(1);
        Some((client, upstream))
    }

    /// Deliver a response to the client and drop the client registration.
    fn respond(self: &Arc<Self>, client: &Arc<Connection>, response: Option<Bytes>) {
        if let Some(bytes) = response {
            client.send(bytes);
        }
        client.unregister(self.client_msgid, self);
    }

    fn error_response(&self, code: ResultCode, diagnostic: &str) -> Option<Bytes> {
        tag::response_tag_for(self.tag)
            .map(|op_tag| Pdu::result(self.client_msgid, op_tag, code, diagnostic).into_bytes())
    }

    /// Tell the upstream to stop working on this operation.
    fn cancel_upstream(&self, upstream: Option<(Arc<Connection>, i32)>) {
        let Some((conn, msgid)) = upstream else {
            return;
        };
        if self.is_bind() {
            return;
        }
        let abandon = Pdu::abandon(conn.allocate_msgid(), msgid);
        conn.send(abandon.into_bytes());
    }

    /// Relay an intermediate response (search entry, reference).
    pub fn relay(&self, pdu: &Pdu) -> Option<Arc<Connection>> {
        let client = {
            let mut link = lock(&self.link);
            if self.result() != OperationResult::Pending {
                return None;
            }
            link.last_response = Some(Instant::now());
            link.client.clone()
        }?;
        client.send(pdu.with_msgid(self.client_msgid).into_bytes());
        Some(client)
    }

    /// Relay the terminal response and conclude.
    pub fn complete(self: &Arc<Self>, pdu: &Pdu) -> Option<Arc<Connection>> {
        let (client, _) = self.conclude(OperationResult::Completed)?;
        let client = client?;
        self.respond(&client, Some(pdu.with_msgid(self.client_msgid).into_bytes()));
        Some(client)
    }

    /// Refuse the request without forwarding it.
    pub fn reject(self: &Arc<Self>, code: ResultCode, diagnostic: &str) {
        if let Some((Some(client), upstream)) = self.conclude(OperationResult::Rejected) {
            self.cancel_upstream(upstream);
            self.respond(&client, self.error_response(code, diagnostic));
        }
    }

    /// The client abandoned the request or went away.
    pub fn abandon(self: &Arc<Self>) {
        if let Some((client, upstream)) = self.conclude(OperationResult::Failed) {
            tracing::trace!(client = %self.client_id, msgid = self.client_msgid, "Operation abandoned");
            self.cancel_upstream(upstream);
            if let Some(client) = client {
                self.respond(&client, None);
            }
        }
    }

    /// The upstream connection serving the request was lost.
    pub fn upstream_lost(self: &Arc<Self>) {
        if let Some((Some(client), _)) = self.conclude(OperationResult::Failed) {
            self.respond(
                &client,
                self.error_response(
                    ResultCode::Other,
                    "connection to the remote server has been severed",
                ),
            );
        }
    }

    /// No final response arrived in time.
    pub fn time_out(self: &Arc<Self>) {
        if let Some((client, upstream)) = self.conclude(OperationResult::Failed) {
            tracing::debug!(client = %self.client_id, msgid = self.client_msgid, "Operation timed out");
            self.cancel_upstream(upstream);
            if let Some(client) = client {
                self.respond(
                    &client,
                    self.error_response(
                        ResultCode::AdminLimitExceeded,
                        "upstream did not respond in time",
                    ),
                );
            }
        }
    }

    /// One of the two connections was destroyed.
    pub fn on_connection_destroyed(self: &Arc<Self>, dead: ConnectionId) {
        if dead == self.client_id {
            self.abandon();
        } else {
            self.upstream_lost();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::connection::{ConnectionKind, ConnectionParams, ConnectionState, Owner};
    use tokio::sync::mpsc::UnboundedReceiver;

    fn connection() -> (Arc<Connection>, UnboundedReceiver<Bytes>) {
        Connection::new(ConnectionParams {
            peer: "test".into(),
            owner: Owner::None,
            kind: ConnectionKind::Open,
            shard: 0,
            write_high_water: 0,
            permit: None,
        })
    }

    fn forwarded(tag: u8) -> (Arc<Operation>, Arc<Connection>, Arc<Connection>, UnboundedReceiver<Bytes>, UnboundedReceiver<Bytes>, i32) {
        let (client, crx) = connection();
        let (upstream, urx) = connection();
        let op = Operation::new(&client, 5, tag);
        assert!(client.register_client_operation(&op));
        let msgid = upstream
            .try_register_upstream(&op, 0, tag == tag::BIND_REQUEST)
            .unwrap();
        (op, client, upstream, crx, urx, msgid)
    }

    #[test]
    fn completion_relays_with_client_msgid() {
        let (op, client, upstream, mut crx, _urx, msgid) = forwarded(tag::SEARCH_REQUEST);

        let entry = Pdu::result(msgid, tag::SEARCH_RESULT_ENTRY, ResultCode::Success, "");
        assert!(op.relay(&entry).is_some());
        assert_eq!(Pdu::parse(crx.try_recv().unwrap()).unwrap().msgid(), 5);

        let done = Pdu::result(msgid, tag::SEARCH_RESULT_DONE, ResultCode::Success, "");
        let taken = upstream.take_operation(msgid).unwrap();
        assert!(taken.complete(&done).is_some());
        let relayed = Pdu::parse(crx.try_recv().unwrap()).unwrap();
        assert_eq!(relayed.msgid(), 5);
        assert_eq!(relayed.tag(), tag::SEARCH_RESULT_DONE);

        assert_eq!(op.result(), OperationResult::Completed);
        assert_eq!(client.pending_ops(), 0);
        assert!(op.complete(&done).is_none());
    }

    #[test]
    fn client_abandon_sends_abandon_upstream() {
        let (op, client, upstream, _crx, mut urx, msgid) = forwarded(tag::SEARCH_REQUEST);

        client.take_operation(5).unwrap().abandon();
        assert_eq!(op.result(), OperationResult::Failed);
        assert_eq!(upstream.pending_ops(), 0);

        let abandon = Pdu::parse(urx.try_recv().unwrap()).unwrap();
        assert_eq!(abandon.tag(), tag::ABANDON_REQUEST);
        assert_eq!(abandon.abandon_target().unwrap(), msgid);
    }

    #[test]
    fn upstream_loss_fails_the_client_request() {
        let (op, client, upstream, mut crx, _urx, _msgid) = forwarded(tag::MODIFY_REQUEST);

        upstream.destroy();
        assert_eq!(op.result(), OperationResult::Failed);
        assert_eq!(client.pending_ops(), 0);

        let reply = Pdu::parse(crx.try_recv().unwrap()).unwrap();
        assert_eq!(reply.tag(), tag::MODIFY_RESPONSE);
        assert_eq!(reply.result_code().unwrap(), ResultCode::Other as u32);
    }

    #[test]
    fn client_teardown_abandons_upstream() {
        let (op, client, upstream, _crx, mut urx, _msgid) = forwarded(tag::SEARCH_REQUEST);

        client.destroy();
        assert_eq!(op.result(), OperationResult::Failed);
        assert_eq!(upstream.pending_ops(), 0);
        assert_eq!(
            Pdu::parse(urx.try_recv().unwrap()).unwrap().tag(),
            tag::ABANDON_REQUEST
        );
        assert!(client.is_freed());
    }

    #[test]
    fn abandoned_bind_closes_the_bind_connection() {
        let (_op, client, upstream, _crx, _urx, _msgid) = forwarded(tag::BIND_REQUEST);
        assert!(client.begin_binding());

        client.take_operation(5).unwrap().abandon();
        assert!(!upstream.is_alive());
        assert_eq!(client.state(), ConnectionState::Ready);
    }

    #[test]
    fn timeout_reports_admin_limit() {
        let (op, _client, _upstream, mut crx, _urx, _msgid) = forwarded(tag::COMPARE_REQUEST);
        op.time_out();
        let reply = Pdu::parse(crx.try_recv().unwrap()).unwrap();
        assert_eq!(reply.result_code().unwrap(), ResultCode::AdminLimitExceeded as u32);
    }
}
