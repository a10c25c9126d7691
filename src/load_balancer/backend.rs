//! Backend abstraction.
//!
//! # Responsibilities
//! - Represent one configured upstream server and its connection pools
//!   (regular multiplexed connections and bind-only connections)
//! - Keep the pools at their targets with a bounded number of dials in
//!   flight, backing off after failures
//! - Pick a ready connection with spare capacity for an operation
//! - Accumulate health (operation count, latency) and fold it into fitness
//!
//! # Design Decisions
//! - `active + opening` never exceeds the configured pool size: closing
//!   connections keep their slot until they are destroyed
//! - A generation counter invalidates dials started before a reset; such
//!   dials are told to give up and still count against `max_opening`
//!   until they have
//! - Health counters are atomics; fitness only changes under the mutex

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::watch;

use crate::config::BackendConfig;
use crate::daemon::context::Context;
use crate::daemon::upstream;
use crate::load_balancer::{Selection, SelectStatus};
use crate::net::connection::{
    Connection, ConnectionId, ConnectionKind, ConnectionParams, ConnectionState, Owner,
};
use crate::net::operation::{Operation, OperationResult};
use crate::reconfig::change::ChangeFlags;
use crate::resilience::backoff::redial_delay;
use crate::sync::lock;

/// Health samples older than this carry no weight.
pub const FITNESS_HORIZON: Duration = Duration::from_secs(10);

/// Which pool a connection belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pool {
    Regular,
    Bind,
}

#[derive(Debug)]
struct Fitness {
    smoothed: f64,
    score: f64,
    sampled: bool,
    last_sample: Instant,
}

#[derive(Debug)]
struct BackendInner {
    config: BackendConfig,
    address: Result<String, String>,
    tier: Option<String>,
    conns: Vec<Arc<Connection>>,
    bind_conns: Vec<Arc<Connection>>,
    preparing: Vec<Arc<Connection>>,
    opening: usize,
    bind_opening: usize,
    /// Dials from an older generation that have not resolved yet.
    stale_opening: usize,
    cursor: usize,
    bind_cursor: usize,
    failed_attempts: u32,
    retry_scheduled: bool,
    removed: bool,
    generation: u64,
    fitness: Fitness,
}

impl BackendInner {
    fn regular_slots(&self) -> usize {
        self.conns.len() + self.preparing.len() + self.opening
    }

    fn bind_slots(&self) -> usize {
        self.bind_conns.len() + self.bind_opening
    }

    fn dial_finished(&mut self, pool: Pool) {
        match pool {
            Pool::Regular => self.opening = self.opening.saturating_sub(1),
            Pool::Bind => self.bind_opening = self.bind_opening.saturating_sub(1),
        }
    }
}

#[derive(Debug, Default)]
struct Stats {
    received: AtomicU64,
    forwarded: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    pending: AtomicI64,
}

/// A single upstream server.
pub struct Backend {
    name: String,
    ctx: Weak<Context>,
    inner: Mutex<BackendInner>,
    generation_tx: watch::Sender<u64>,
    weight: AtomicU32,
    op_count: AtomicU64,
    latency_us: AtomicU64,
    stats: Stats,
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backend")
            .field("name", &self.name)
            .field("weight", &self.weight())
            .finish()
    }
}

impl Backend {
    /// Create a backend. No connections are opened until `retry`.
    pub fn new(config: BackendConfig, ctx: &Arc<Context>) -> Arc<Self> {
        let address = config.address();
        if let Err(reason) = &address {
            tracing::warn!(backend = %config.name, uri = %config.uri, %reason, "Invalid backend URI");
        }
        Arc::new(Self {
            name: config.name.clone(),
            ctx: Arc::downgrade(ctx),
            weight: AtomicU32::new(config.weight),
            generation_tx: watch::Sender::new(0),
            inner: Mutex::new(BackendInner {
                config,
                address,
                tier: None,
                conns: Vec::new(),
                bind_conns: Vec::new(),
                preparing: Vec::new(),
                opening: 0,
                bind_opening: 0,
                stale_opening: 0,
                cursor: 0,
                bind_cursor: 0,
                failed_attempts: 0,
                retry_scheduled: false,
                removed: false,
                generation: 0,
                fitness: Fitness {
                    smoothed: 0.0,
                    score: 0.0,
                    sampled: false,
                    last_sample: Instant::now(),
                },
            }),
            op_count: AtomicU64::new(0),
            latency_us: AtomicU64::new(0),
            stats: Stats::default(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn weight(&self) -> u32 {
        self.weight.load(Ordering::Relaxed)
    }

    pub fn config(&self) -> BackendConfig {
        lock(&self.inner).config.clone()
    }

    pub fn tier(&self) -> Option<String> {
        lock(&self.inner).tier.clone()
    }

    pub fn generation(&self) -> u64 {
        lock(&self.inner).generation
    }

    /// Resolves once a reset has moved past `generation`.
    pub(crate) fn superseded(&self, generation: u64) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.generation_tx.subscribe();
        async move {
            let _ = rx.wait_for(|current| *current != generation).await;
        }
    }

    /// Record membership and run the tier's policy hook, both under this
    /// backend's mutex. Called with the tier mutex held.
    pub(crate) fn with_membership<R>(&self, tier: Option<&str>, hook: impl FnOnce() -> R) -> R {
        let mut inner = lock(&self.inner);
        inner.tier = tier.map(str::to_string);
        let result = hook();
        drop(inner);
        result
    }

    // --- Pool management ---

    /// Start dials until both pools reach their targets.
    ///
    /// Never more than `max_opening` dials are in flight. Returns the
    /// number of dials started.
    pub fn retry(self: &Arc<Self>) -> usize {
        let Some(ctx) = self.ctx.upgrade() else {
            return 0;
        };
        let (dials, generation, address) = {
            let mut inner = lock(&self.inner);
            if inner.removed || inner.retry_scheduled {
                return 0;
            }
            let address = match &inner.address {
                Ok(address) => address.clone(),
                Err(_) => return 0,
            };
            let in_flight =
                inner.opening + inner.bind_opening + inner.stale_opening + inner.preparing.len();
            let mut budget = inner.config.max_opening.saturating_sub(in_flight);

            let regular = inner.config.numconns.saturating_sub(inner.regular_slots()).min(budget);
            budget -= regular;
            let bind = inner.config.bindconns.saturating_sub(inner.bind_slots()).min(budget);

            inner.opening += regular;
            inner.bind_opening += bind;

            let mut dials = vec![Pool::Regular; regular];
            dials.extend(std::iter::repeat(Pool::Bind).take(bind));
            (dials, inner.generation, address)
        };

        if !dials.is_empty() {
            tracing::debug!(backend = %self.name, dials = dials.len(), %address, "Opening upstream connections");
        }
        for pool in &dials {
            upstream::spawn_dial(&ctx, self.clone(), *pool, generation, address.clone());
        }
        dials.len()
    }

    /// Link a freshly connected socket into its pool.
    ///
    /// Returns `None` when the dial belongs to an older generation or the
    /// backend was removed; the caller then drops the socket and retries.
    pub fn adopt(
        self: &Arc<Self>,
        pool: Pool,
        generation: u64,
        peer: String,
        shard: usize,
        write_high_water: usize,
    ) -> Option<(Arc<Connection>, UnboundedReceiver<Bytes>)> {
        let mut inner = lock(&self.inner);
        if generation != inner.generation {
            inner.stale_opening = inner.stale_opening.saturating_sub(1);
            return None;
        }
        inner.dial_finished(pool);
        if inner.removed {
            return None;
        }
        let kind = match pool {
            Pool::Bind => ConnectionKind::Bind,
            Pool::Regular if inner.config.bindconf.is_some() => ConnectionKind::Preparing,
            Pool::Regular => ConnectionKind::Open,
        };
        let (conn, rx) = Connection::new(ConnectionParams {
            peer,
            owner: Owner::Backend(self.clone()),
            kind,
            shard,
            write_high_water,
            permit: None,
        });
        match kind {
            ConnectionKind::Preparing => inner.preparing.push(conn.clone()),
            ConnectionKind::Bind => inner.bind_conns.push(conn.clone()),
            _ => inner.conns.push(conn.clone()),
        }
        if kind != ConnectionKind::Preparing {
            inner.failed_attempts = 0;
        }
        metrics::counter!("lloadd_upstream_dials_total", "outcome" => "connected").increment(1);
        Some((conn, rx))
    }

    /// Move a connection that finished its setup into the regular pool.
    pub fn promote(&self, conn: &Arc<Connection>) -> bool {
        let mut inner = lock(&self.inner);
        let Some(pos) = inner.preparing.iter().position(|c| c.id() == conn.id()) else {
            return false;
        };
        let conn = inner.preparing.remove(pos);
        if !conn.make_ready(ConnectionKind::Privileged) {
            return false;
        }
        inner.conns.push(conn);
        inner.failed_attempts = 0;
        true
    }

    /// A dial did not produce a connection.
    pub fn dial_failed(self: &Arc<Self>, pool: Pool, generation: u64, reason: &str) {
        let stale = {
            let mut inner = lock(&self.inner);
            let stale = generation != inner.generation;
            if stale {
                inner.stale_opening = inner.stale_opening.saturating_sub(1);
            } else {
                inner.dial_finished(pool);
            }
            stale
        };
        metrics::counter!("lloadd_upstream_dials_total", "outcome" => "failed").increment(1);
        if stale {
            self.retry();
        } else {
            self.note_failure(reason);
        }
    }

    /// A dial ended without an outcome: abandoned after a reset, or dropped
    /// with its IO shard. Only a stale dial triggers a refill.
    pub(crate) fn dial_abandoned(self: &Arc<Self>, pool: Pool, generation: u64) {
        let refill = {
            let mut inner = lock(&self.inner);
            let stale = generation != inner.generation;
            if stale {
                inner.stale_opening = inner.stale_opening.saturating_sub(1);
            } else {
                inner.dial_finished(pool);
            }
            stale && !inner.removed
        };
        if refill {
            self.retry();
        }
    }

    /// Count a failed attempt and schedule the next `retry` with backoff.
    pub fn note_failure(self: &Arc<Self>, reason: &str) {
        let (delay, attempts) = {
            let mut inner = lock(&self.inner);
            if inner.removed {
                return;
            }
            inner.failed_attempts = inner.failed_attempts.saturating_add(1);
            if inner.retry_scheduled {
                return;
            }
            inner.retry_scheduled = true;
            let delay = redial_delay(
                inner.failed_attempts,
                inner.config.retry_ms,
                inner.config.retry_max_ms,
            );
            (delay, inner.failed_attempts)
        };
        tracing::warn!(
            backend = %self.name,
            attempts,
            delay_ms = delay.as_millis() as u64,
            %reason,
            "Upstream connection failed, backing off"
        );

        let Some(ctx) = self.ctx.upgrade() else {
            return;
        };
        let backend = self.clone();
        let gate = ctx.gate.clone();
        ctx.spawn_control(async move {
            tokio::time::sleep(delay).await;
            let _loop = gate.enter().await;
            lock(&backend.inner).retry_scheduled = false;
            backend.retry();
        });
    }

    /// Drop a destroyed connection from the pools and refill them.
    pub(crate) fn unlink_connection(self: &Arc<Self>, id: ConnectionId) {
        let refill = {
            let mut inner = lock(&self.inner);
            inner.conns.retain(|c| c.id() != id);
            inner.bind_conns.retain(|c| c.id() != id);
            inner.preparing.retain(|c| c.id() != id);
            !inner.removed
        };
        if refill {
            self.retry();
        }
    }

    /// Close every owned connection.
    ///
    /// Dials in flight belong to the old generation: they are cancelled,
    /// leave the pool and keep counting against `max_opening` until their
    /// tasks have noticed.
    pub fn reset(&self, gentle: bool) {
        let conns: Vec<Arc<Connection>> = {
            let mut inner = lock(&self.inner);
            inner.generation += 1;
            inner.stale_opening += inner.opening + inner.bind_opening;
            inner.opening = 0;
            inner.bind_opening = 0;
            self.generation_tx.send_replace(inner.generation);
            inner
                .conns
                .iter()
                .chain(inner.bind_conns.iter())
                .chain(inner.preparing.iter())
                .cloned()
                .collect()
        };
        tracing::info!(backend = %self.name, connections = conns.len(), gentle, "Resetting backend");
        for conn in conns {
            conn.close(gentle);
        }
    }

    /// Apply a modified configuration.
    pub fn reconfigure(self: &Arc<Self>, config: BackendConfig, flags: ChangeFlags) {
        let needs_reset = flags.intersects(ChangeFlags::ADDRESS | ChangeFlags::BINDCONF);
        let surplus: Vec<Arc<Connection>> = {
            let mut inner = lock(&self.inner);
            if flags.contains(ChangeFlags::ADDRESS) {
                inner.address = config.address();
                if let Err(reason) = &inner.address {
                    tracing::warn!(backend = %self.name, uri = %config.uri, %reason, "Invalid backend URI");
                }
            }
            if flags.contains(ChangeFlags::RETRY) {
                inner.failed_attempts = 0;
            }
            self.weight.store(config.weight, Ordering::Relaxed);
            let numconns = config.numconns;
            let bindconns = config.bindconns;
            inner.config = config;

            if needs_reset {
                Vec::new()
            } else {
                let mut surplus = Vec::new();
                if inner.conns.len() > numconns {
                    surplus.extend(inner.conns[numconns..].iter().cloned());
                }
                if inner.bind_conns.len() > bindconns {
                    surplus.extend(inner.bind_conns[bindconns..].iter().cloned());
                }
                surplus
            }
        };

        if needs_reset {
            self.reset(true);
        }
        for conn in surplus {
            conn.close(true);
        }
        self.retry();
    }

    /// Detach from the configuration: close everything, never redial.
    pub fn remove(&self) {
        lock(&self.inner).removed = true;
        self.reset(false);
    }

    pub fn is_removed(&self) -> bool {
        lock(&self.inner).removed
    }

    // --- Selection ---

    /// Register `op` on a ready connection with spare capacity.
    ///
    /// Binds only go to the bind pool and reserve the connection.
    pub fn select(&self, op: &Arc<Operation>) -> Selection {
        self.stats.received.fetch_add(1, Ordering::Relaxed);
        let mut guard = lock(&self.inner);
        if guard.removed {
            return Err(SelectStatus::Unavailable);
        }
        let max_pending = guard.config.max_pending_ops;
        if max_pending > 0 && self.pending_ops() >= max_pending as u64 {
            return Err(SelectStatus::Busy);
        }
        let conn_max = guard.config.conn_max_pending;
        let binding = op.is_bind();

        let inner = &mut *guard;
        let (list, cursor) = if binding {
            (&inner.bind_conns, &mut inner.bind_cursor)
        } else {
            (&inner.conns, &mut inner.cursor)
        };
        let n = list.len();
        let mut status = SelectStatus::Unavailable;
        for i in 0..n {
            let idx = (*cursor + i) % n;
            let conn = &list[idx];
            match conn.try_register_upstream(op, conn_max, binding) {
                Ok(msgid) => {
                    *cursor = (idx + 1) % n;
                    self.stats.forwarded.fetch_add(1, Ordering::Relaxed);
                    self.stats.pending.fetch_add(1, Ordering::AcqRel);
                    return Ok((conn.clone(), msgid));
                }
                Err(s) => status = status.merge(s),
            }
        }
        Err(status)
    }

    // --- Health ---

    /// Accumulate one completed operation. Lock free.
    pub fn record_operation(&self, latency: Duration) {
        self.op_count.fetch_add(1, Ordering::Relaxed);
        self.latency_us
            .fetch_add(latency.as_micros().min(u64::MAX as u128) as u64, Ordering::Relaxed);
    }

    /// An operation forwarded here concluded.
    pub(crate) fn op_finished(&self, result: OperationResult, latency: Duration) {
        self.stats.pending.fetch_sub(1, Ordering::AcqRel);
        match result {
            OperationResult::Completed => {
                self.stats.completed.fetch_add(1, Ordering::Relaxed);
                self.record_operation(latency);
            }
            _ => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn pending_ops(&self) -> u64 {
        self.stats.pending.load(Ordering::Acquire).max(0) as u64
    }

    /// Fold the raw counters into the smoothed latency.
    ///
    /// The previous value keeps a weight of `(1 - age/10s)^2`, so recent
    /// samples dominate and anything older than the horizon is ignored.
    /// The score divides the smoothed latency by the weight; lower is better.
    pub fn update_fitness(&self, now: Instant) {
        let ops = self.op_count.swap(0, Ordering::Relaxed);
        let total_us = self.latency_us.swap(0, Ordering::Relaxed);
        let weight = self.weight().max(1) as f64;

        let mut inner = lock(&self.inner);
        let fitness = &mut inner.fitness;
        let age = now.saturating_duration_since(fitness.last_sample);

        if ops > 0 {
            let sample = total_us as f64 / ops as f64;
            fitness.smoothed = if fitness.sampled {
                let keep = decay(age);
                keep * fitness.smoothed + (1.0 - keep) * sample
            } else {
                sample
            };
            fitness.sampled = true;
            fitness.last_sample = now;
        } else if age >= FITNESS_HORIZON {
            fitness.smoothed = 0.0;
            fitness.sampled = false;
        }
        fitness.score = fitness.smoothed / weight;
        metrics::gauge!("lloadd_backend_fitness", "backend" => self.name.clone()).set(fitness.score);
    }

    pub fn fitness(&self) -> f64 {
        lock(&self.inner).fitness.score
    }

    // --- Monitoring ---

    pub fn connections(&self) -> Vec<Arc<Connection>> {
        let inner = lock(&self.inner);
        inner
            .conns
            .iter()
            .chain(inner.bind_conns.iter())
            .chain(inner.preparing.iter())
            .cloned()
            .collect()
    }

    pub fn snapshot(&self) -> BackendSnapshot {
        let inner = lock(&self.inner);
        let bind_available = inner
            .bind_conns
            .iter()
            .filter(|c| c.state() == ConnectionState::Ready)
            .count();
        BackendSnapshot {
            name: self.name.clone(),
            tier: inner.tier.clone(),
            uri: inner.config.uri.clone(),
            weight: self.weight(),
            active: inner.conns.len(),
            bind_conns: inner.bind_conns.len(),
            bind_available,
            opening: inner.opening + inner.bind_opening,
            stale_opening: inner.stale_opening,
            preparing: inner.preparing.len(),
            pending_ops: self.pending_ops(),
            received: self.stats.received.load(Ordering::Relaxed),
            forwarded: self.stats.forwarded.load(Ordering::Relaxed),
            completed: self.stats.completed.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
            fitness: inner.fitness.score,
            failed_attempts: inner.failed_attempts,
        }
    }
}

/// Weight the previous smoothed value keeps after `age`.
fn decay(age: Duration) -> f64 {
    if age >= FITNESS_HORIZON {
        return 0.0;
    }
    let remaining = 1.0 - age.as_secs_f64() / FITNESS_HORIZON.as_secs_f64();
    remaining * remaining
}

/// Read-only view for monitoring.
#[derive(Debug, Clone, Serialize)]
pub struct BackendSnapshot {
    pub name: String,
    pub tier: Option<String>,
    pub uri: String,
    pub weight: u32,
    pub active: usize,
    pub bind_conns: usize,
    pub bind_available: usize,
    pub opening: usize,
    pub stale_opening: usize,
    pub preparing: usize,
    pub pending_ops: u64,
    pub received: u64,
    pub forwarded: u64,
    pub completed: u64,
    pub failed: u64,
    pub fitness: f64,
    pub failed_attempts: u32,
}
