//! Upstream sessions.
//!
//! # Data Flow
//! ```text
//! Backend::retry → spawn_dial (on an IO shard)
//!     → Dialer::connect (bounded by the connect timeout)
//!     → Backend::adopt (slot in the pool, or discarded if stale)
//!     → setup bind with the backend credentials (Preparing only)
//!     → Backend::promote
//!     → read loop: response → Operation (relay or complete) → client
//! ```
//!
//! # Design Decisions
//! - Every response is handled under the pause gate; reads are not
//! - A congested client pauses the upstream reader until it drains
//! - A message id 0 notice (notice of disconnection) closes gently
//! - A dial races the backend's generation: a reset abandons it

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncRead;

use crate::config::BindConf;
use crate::daemon::context::Context;
use crate::load_balancer::backend::{Backend, Pool};
use crate::net::connection::{run_writer, Connection, ConnectionKind, DestroyOnDrop, IoState};
use crate::proto::{tag, Pdu, PduReader};

/// A dial the backend is counting.
///
/// Dropped unresolved (abandoned, or its shard stopped), it gives the slot back.
struct DialTicket {
    backend: Arc<Backend>,
    pool: Pool,
    generation: u64,
    resolved: bool,
}

impl DialTicket {
    /// The outcome is reported to the backend by the caller.
    fn resolve(mut self) {
        self.resolved = true;
    }
}

impl Drop for DialTicket {
    fn drop(&mut self) {
        if !self.resolved {
            self.backend.dial_abandoned(self.pool, self.generation);
        }
    }
}

/// Dial one connection for `backend` on the next IO shard.
pub fn spawn_dial(
    ctx: &Arc<Context>,
    backend: Arc<Backend>,
    pool: Pool,
    generation: u64,
    address: String,
) {
    let shards = ctx.shards();
    let shard = shards.next_index();
    let task_ctx = ctx.clone();
    let ticket = DialTicket {
        backend: backend.clone(),
        pool,
        generation,
        resolved: false,
    };
    let spawned = shards.spawn(shard, async move {
        session(task_ctx, ticket, address, shard).await;
    });
    if !spawned {
        // the ticket went down with the task and released the slot
        metrics::counter!("lloadd_upstream_dials_total", "outcome" => "failed").increment(1);
        backend.note_failure("no IO shard available");
    }
}

async fn session(ctx: Arc<Context>, ticket: DialTicket, address: String, shard: usize) {
    let backend = ticket.backend.clone();
    let (pool, generation) = (ticket.pool, ticket.generation);
    let settings = ctx.settings();

    let connect = tokio::time::timeout(settings.timeouts.connect(), ctx.dialer.connect(&address));
    let outcome = tokio::select! {
        outcome = connect => outcome,
        _ = backend.superseded(generation) => {
            let _loop = ctx.gate.enter().await;
            tracing::debug!(backend = %backend.name(), %address, "Dial abandoned after backend reset");
            drop(ticket);
            return;
        }
    };
    let stream = match outcome {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            let _loop = ctx.gate.enter().await;
            ticket.resolve();
            backend.dial_failed(pool, generation, &e.to_string());
            return;
        }
        Err(_) => {
            let _loop = ctx.gate.enter().await;
            ticket.resolve();
            backend.dial_failed(pool, generation, "connect timed out");
            return;
        }
    };

    let adopted = {
        let _loop = ctx.gate.enter().await;
        ticket.resolve();
        let adopted = backend.adopt(
            pool,
            generation,
            address.clone(),
            shard,
            settings.write_high_water,
        );
        if adopted.is_none() {
            backend.retry();
        }
        adopted
    };
    let Some((conn, rx)) = adopted else {
        tracing::debug!(backend = %backend.name(), %address, "Discarding stale upstream connection");
        return;
    };
    let Some(_ref) = conn.acquire_ref() else {
        return;
    };
    let _destroy = DestroyOnDrop(conn.clone());
    tracing::debug!(
        backend = %backend.name(),
        connection_id = %conn.id(),
        %address,
        kind = ?conn.kind(),
        "Upstream connected"
    );

    let (read_half, write_half) = tokio::io::split(stream);
    tokio::spawn(run_writer(
        conn.clone(),
        rx,
        write_half,
        settings.timeouts.write(),
    ));
    let mut reader = PduReader::new(read_half, settings.max_pdu_bytes);

    if conn.kind() == ConnectionKind::Preparing {
        let prepared = match backend.config().bindconf {
            Some(bindconf) => {
                prepare(&conn, &mut reader, &bindconf, settings.timeouts.connect()).await
            }
            None => Ok(()),
        };
        let _loop = ctx.gate.enter().await;
        match prepared {
            Ok(()) => {
                if !backend.promote(&conn) {
                    return;
                }
            }
            Err(reason) => {
                backend.note_failure(&reason);
                conn.destroy();
                return;
            }
        }
    }

    read_loop(&ctx, &conn, &mut reader).await;
}

/// Authenticate a fresh connection with the backend credentials.
async fn prepare<R: AsyncRead + Unpin>(
    conn: &Arc<Connection>,
    reader: &mut PduReader<R>,
    bindconf: &BindConf,
    timeout: Duration,
) -> Result<(), String> {
    let msgid = conn.allocate_msgid();
    if !conn.send(Pdu::simple_bind(msgid, &bindconf.dn, &bindconf.password).into_bytes()) {
        return Err("connection closed before bind".to_string());
    }

    let response = tokio::time::timeout(timeout, async {
        loop {
            if let Some(pdu) = reader.next_pdu().map_err(|e| e.to_string())? {
                return Ok::<Pdu, String>(pdu);
            }
            if !reader.fill().await.map_err(|e| e.to_string())? {
                return Err("connection closed during bind".to_string());
            }
        }
    })
    .await
    .map_err(|_| "bind timed out".to_string())??;

    if response.msgid() != msgid || response.tag() != tag::BIND_RESPONSE {
        return Err("unexpected response to bind".to_string());
    }
    match response.result_code() {
        Ok(0) => Ok(()),
        Ok(code) => Err(format!("bind as {} failed with result {}", bindconf.dn, code)),
        Err(e) => Err(e.to_string()),
    }
}

async fn read_loop<R: AsyncRead + Unpin>(
    ctx: &Context,
    conn: &Arc<Connection>,
    reader: &mut PduReader<R>,
) {
    'read: loop {
        let filled = tokio::select! {
            res = reader.fill() => res,
            _ = conn.closed() => break,
        };
        match filled {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(connection_id = %conn.id(), "Upstream closed the connection");
                break;
            }
            Err(e) => {
                tracing::warn!(connection_id = %conn.id(), error = %e, "Upstream read failed");
                break;
            }
        }

        loop {
            let pdu = match reader.next_pdu() {
                Ok(Some(pdu)) => pdu,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(connection_id = %conn.id(), error = %e, "Malformed PDU from upstream");
                    break 'read;
                }
            };
            let congested = {
                let _loop = ctx.gate.enter().await;
                handle_response(conn, pdu)
            };
            if let Some(client) = congested {
                conn.set_io_state(IoState::ReadPause);
                tokio::select! {
                    _ = client.drained() => {}
                    _ = conn.closed() => {}
                }
                conn.set_io_state(IoState::Operational);
            }
        }
    }
}

/// Route one upstream PDU. Returns the client if it can take no more output.
pub(crate) fn handle_response(conn: &Arc<Connection>, pdu: Pdu) -> Option<Arc<Connection>> {
    conn.touch();
    let msgid = pdu.msgid();
    if msgid == 0 {
        tracing::info!(connection_id = %conn.id(), peer = %conn.peer(), "Upstream sent an unsolicited notice, closing");
        conn.close(true);
        return None;
    }
    let Some(op) = conn.operation(msgid) else {
        tracing::trace!(connection_id = %conn.id(), msgid, "Response to an unknown operation");
        return None;
    };
    let client = if tag::is_terminal_response(pdu.tag()) {
        op.complete(&pdu)
    } else {
        op.relay(&pdu)
    };
    client.filter(|c| c.is_congested())
}
