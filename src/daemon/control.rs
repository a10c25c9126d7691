//! Housekeeping loop: once a second, under the pause gate.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::daemon::context::Context;
use crate::lifecycle::ShutdownMode;

const TICK: Duration = Duration::from_secs(1);

/// Run until an abrupt shutdown.
pub async fn run(ctx: Arc<Context>) {
    let mut interval = tokio::time::interval(TICK);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let shutdown = ctx.shutdown().clone();
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.reached(ShutdownMode::Abrupt) => break,
        }
        let _loop = ctx.gate.enter().await;
        tick(&ctx, Instant::now());
    }
    tracing::debug!("Control loop stopped");
}

/// Refresh tier policies, time out stuck operations, close idle clients.
pub(crate) fn tick(ctx: &Context, now: Instant) {
    for tier in ctx.tiers.all() {
        tier.update(now);
    }

    let settings = ctx.settings();
    let op_timeout = settings.timeouts.operation();
    let idle_timeout = settings.timeouts.idle();
    if op_timeout.is_none() && idle_timeout.is_none() {
        return;
    }

    for client in ctx.clients.all() {
        if let Some(limit) = op_timeout {
            for op in client.operations() {
                let quiet = op
                    .last_response()
                    .map(|at| now.saturating_duration_since(at))
                    .unwrap_or_else(|| op.age(now));
                if quiet >= limit {
                    op.time_out();
                }
            }
        }
        if let Some(limit) = idle_timeout {
            if client.pending_ops() == 0 && client.idle_for(now) >= limit {
                tracing::debug!(connection_id = %client.id(), peer = %client.peer(), "Closing idle client");
                client.close(true);
            }
        }
    }
}
