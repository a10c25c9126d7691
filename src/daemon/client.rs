//! Client sessions.
//!
//! # Data Flow
//! ```text
//! Listener accept → accept() → IO shard picked from the socket
//!     → read cycle: every complete PDU in the buffer
//!         - first `max_pdus_per_cycle` handled inline
//!         - the rest handed to the worker pool (ReadHandover)
//!     → handle_request: unbind / abandon / reject / Tiers::select
//!     → request forwarded with the upstream message id
//! ```
//!
//! # Design Decisions
//! - Requests are handled under the pause gate, one batch per entry
//! - A protocol violation closes this client only
//! - A congested upstream pauses the client reader until it drains
//! - Every BindResponse ends its bind, saslBindInProgress included: the
//!   client is not pinned to one upstream, so each step of a multi-step
//!   SASL bind may be served by a different bind connection

use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::sync::Arc;

use tokio::io::AsyncRead;
use tokio::net::TcpStream;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::OwnedSemaphorePermit;

use bytes::Bytes;

use crate::daemon::context::Context;
use crate::net::connection::{
    run_writer, Connection, ConnectionKind, ConnectionParams, ConnectionState, DestroyOnDrop,
    IoState, Owner,
};
use crate::net::operation::Operation;
use crate::proto::{tag, Pdu, PduReader, ResultCode, STARTTLS_OID};

/// Register an accepted socket and start its session on an IO shard.
///
/// Called from the listener loop with the gate entered.
pub fn accept(
    ctx: &Arc<Context>,
    stream: std::net::TcpStream,
    peer: SocketAddr,
    permit: OwnedSemaphorePermit,
) {
    let shards = ctx.shards();
    let shard = shards.index_for(stream.as_raw_fd() as u64);
    let settings = ctx.settings();
    let (conn, rx) = ctx.clients.open(ConnectionParams {
        peer: peer.to_string(),
        owner: Owner::None,
        kind: ConnectionKind::Open,
        shard,
        write_high_water: settings.write_high_water,
        permit: Some(permit),
    });
    tracing::debug!(connection_id = %conn.id(), %peer, shard, "Client connected");

    // dropped unrun if the shard is gone, which destroys the connection
    let guard = DestroyOnDrop(conn);
    let task_ctx = ctx.clone();
    shards.spawn(shard, async move {
        session(task_ctx, guard, rx, stream).await;
    });
}

async fn session(
    ctx: Arc<Context>,
    guard: DestroyOnDrop,
    rx: UnboundedReceiver<Bytes>,
    stream: std::net::TcpStream,
) {
    let conn = guard.0.clone();
    let Some(_ref) = conn.acquire_ref() else {
        return;
    };
    let stream = match TcpStream::from_std(stream) {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!(connection_id = %conn.id(), error = %e, "Failed to register client socket");
            return;
        }
    };
    let _ = stream.set_nodelay(true);
    let settings = ctx.settings();
    let (read_half, write_half) = stream.into_split();
    tokio::spawn(run_writer(
        conn.clone(),
        rx,
        write_half,
        settings.timeouts.write(),
    ));

    let reader = PduReader::new(read_half, settings.max_pdu_bytes);
    read_loop(&ctx, &conn, reader).await;
    tracing::debug!(connection_id = %conn.id(), "Client session ended");
    drop(guard);
}

async fn read_loop<R: AsyncRead + Unpin>(
    ctx: &Arc<Context>,
    conn: &Arc<Connection>,
    mut reader: PduReader<R>,
) {
    loop {
        let filled = tokio::select! {
            res = reader.fill() => res,
            _ = conn.closed() => return,
        };
        match filled {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                tracing::debug!(connection_id = %conn.id(), error = %e, "Client read failed");
                return;
            }
        }
        conn.touch();

        let mut batch = Vec::new();
        let mut malformed = false;
        loop {
            match reader.next_pdu() {
                Ok(Some(pdu)) => batch.push(pdu),
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(connection_id = %conn.id(), error = %e, "Malformed PDU from client");
                    malformed = true;
                    break;
                }
            }
        }

        let inline = ctx.settings().max_pdus_per_cycle.max(1);
        let overflow = if batch.len() > inline {
            batch.split_off(inline)
        } else {
            Vec::new()
        };

        let mut stalled = {
            let _loop = ctx.gate.enter().await;
            handle_batch(ctx, conn, batch)
        };

        if !overflow.is_empty() {
            conn.set_io_state(IoState::ReadHandover);
            let job_ctx = ctx.clone();
            let job_conn = conn.clone();
            let handed = ctx
                .workers()
                .run(async move {
                    let _loop = job_ctx.gate.enter().await;
                    handle_batch(&job_ctx, &job_conn, overflow)
                })
                .await
                .flatten();
            conn.set_io_state(IoState::Operational);
            stalled = stalled.or(handed);
        }

        if malformed {
            return;
        }
        if let Some(upstream) = stalled {
            conn.set_io_state(IoState::ReadPause);
            tokio::select! {
                _ = upstream.drained() => {}
                _ = conn.closed() => {}
            }
            conn.set_io_state(IoState::Operational);
        }
    }
}

fn handle_batch(
    ctx: &Context,
    conn: &Arc<Connection>,
    batch: Vec<Pdu>,
) -> Option<Arc<Connection>> {
    let mut stalled = None;
    for pdu in batch {
        if !conn.is_alive() {
            break;
        }
        if let Some(upstream) = handle_request(ctx, conn, pdu) {
            stalled = Some(upstream);
        }
    }
    stalled
}

/// Act on one client PDU. Returns the upstream if it can take no more input.
pub(crate) fn handle_request(
    ctx: &Context,
    client: &Arc<Connection>,
    pdu: Pdu,
) -> Option<Arc<Connection>> {
    let msgid = pdu.msgid();
    match pdu.tag() {
        tag::UNBIND_REQUEST => {
            tracing::debug!(connection_id = %client.id(), "Client unbind");
            client.destroy();
            return None;
        }
        tag::ABANDON_REQUEST => {
            match pdu.abandon_target() {
                Ok(target) => {
                    if let Some(op) = client.take_operation(target) {
                        op.abandon();
                    }
                }
                Err(e) => {
                    tracing::warn!(connection_id = %client.id(), error = %e, "Malformed abandon request");
                    client.destroy();
                }
            }
            return None;
        }
        t if !tag::is_request(t) || msgid <= 0 => {
            tracing::warn!(
                connection_id = %client.id(),
                msgid,
                tag = t,
                "Protocol violation from client, closing"
            );
            client.destroy();
            return None;
        }
        _ => {}
    }

    let state = client.state();
    if matches!(state, ConnectionState::Closing | ConnectionState::Dying) {
        return None;
    }

    let op = Operation::new(client, msgid, pdu.tag());
    if !client.register_client_operation(&op) {
        tracing::warn!(connection_id = %client.id(), msgid, "Message id already in use, closing");
        client.destroy();
        return None;
    }

    if state == ConnectionState::Binding {
        op.reject(ResultCode::OperationsError, "bind in progress");
        return None;
    }
    if pdu.tag() == tag::EXTENDED_REQUEST
        && pdu.extended_oid().map(|oid| oid == STARTTLS_OID).unwrap_or(false)
    {
        op.reject(ResultCode::ProtocolError, "StartTLS not supported");
        return None;
    }
    let max_pending = ctx.settings().client_max_pending;
    if max_pending > 0 && client.pending_ops() > max_pending {
        op.reject(ResultCode::Busy, "too many pending operations");
        return None;
    }
    if op.is_bind() && !client.begin_binding() {
        op.reject(ResultCode::OperationsError, "bind in progress");
        return None;
    }

    match ctx.tiers.select(&op) {
        Ok((upstream, upstream_msgid)) => {
            if !upstream.send(pdu.with_msgid(upstream_msgid).into_bytes()) {
                op.upstream_lost();
                return None;
            }
            tracing::trace!(
                client = %client.id(),
                msgid,
                upstream = %upstream.id(),
                upstream_msgid,
                op = tag::name(pdu.tag()),
                "Forwarded request"
            );
            upstream.is_congested().then_some(upstream)
        }
        Err(status) => {
            tracing::debug!(connection_id = %client.id(), msgid, ?status, "No upstream for request");
            op.reject(status.result_code(), status.diagnostic());
            None
        }
    }
}
