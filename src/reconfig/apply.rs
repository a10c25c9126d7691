//! Apply one change while every event loop is paused.
//!
//! Nothing here reports failure to the caller. A change that cannot be
//! carried out in place is logged, and the affected connections are closed
//! so they come back under the new configuration.

use std::sync::Arc;

use crate::config::{BackendConfig, DaemonSettings, ListenerConfig, TierConfig};
use crate::daemon::context::Context;
use crate::daemon::Daemon;
use crate::load_balancer::backend::Backend;
use crate::load_balancer::tier::Tier;
use crate::net::listener::Listener;
use crate::reconfig::change::{Change, ChangeFlags, ChangeKind, ChangeTarget};
use crate::sync::lock;

/// Build a tier and its backends. Nothing is dialled yet.
pub(crate) fn build_tier(ctx: &Arc<Context>, config: &TierConfig) -> Arc<Tier> {
    let tier = Tier::new(&config.name, config.policy);
    for backend in &config.backends {
        if !tier.add_backend(Backend::new(backend.clone(), ctx)) {
            tracing::warn!(tier = %config.name, backend = %backend.name, "Duplicate backend ignored");
        }
    }
    tier
}

pub(crate) async fn apply(daemon: &Daemon, change: Change) {
    tracing::info!(
        kind = ?change.kind,
        object = ?change.object(),
        target = %change.target_name(),
        flags = ?change.flags,
        "Applying configuration change"
    );
    let ctx = daemon.context();
    let Change {
        kind,
        flags,
        target,
    } = change;

    match (kind, target) {
        (_, ChangeTarget::Daemon(settings)) => apply_daemon(ctx, settings, flags),

        (ChangeKind::Add, ChangeTarget::Listener(config)) => add_listener(daemon, config).await,
        (ChangeKind::Delete, ChangeTarget::Listener(config)) => delete_listener(daemon, &config),
        (ChangeKind::Modify, ChangeTarget::Listener(config)) => {
            delete_listener(daemon, &config);
            add_listener(daemon, config).await;
        }

        (ChangeKind::Add, ChangeTarget::Tier(config)) => add_tier(ctx, &config),
        (ChangeKind::Delete, ChangeTarget::Tier(config)) => delete_tier(ctx, &config.name),
        (ChangeKind::Modify, ChangeTarget::Tier(config)) => modify_tier(ctx, &config, flags),

        (ChangeKind::Add, ChangeTarget::Backend { tier, config }) => add_backend(ctx, &tier, config),
        (ChangeKind::Delete, ChangeTarget::Backend { tier, config }) => {
            delete_backend(ctx, &tier, &config.name)
        }
        (ChangeKind::Modify, ChangeTarget::Backend { tier, config }) => {
            modify_backend(ctx, &tier, config, flags)
        }
    }
}

fn apply_daemon(ctx: &Arc<Context>, settings: DaemonSettings, flags: ChangeFlags) {
    ctx.set_settings(settings.clone());

    if flags.contains(ChangeFlags::TIMEOUTS) {
        ctx.gate.set_timeout(settings.timeouts.pause());
    }
    if flags.contains(ChangeFlags::WORKERS) {
        ctx.resize_workers(settings.worker_threads);
    }
    if flags.contains(ChangeFlags::THREADS) {
        // Keep the old shards running until their connections are gone.
        let previous = ctx.shards();
        if let Err(e) = ctx.replace_shards(settings.io_threads) {
            tracing::error!(error = %e, "Failed to start new IO shards, keeping the old ones");
        }
        tracing::info!(
            io_threads = settings.io_threads,
            clients = ctx.clients.len(),
            "IO threads changed, dropping every connection"
        );
        ctx.clients.close_all(false);
        for backend in ctx.tiers.backends() {
            backend.reset(false);
            backend.retry();
        }
        drop(previous);
    }
}

async fn add_listener(daemon: &Daemon, config: ListenerConfig) {
    match Listener::bind(&config).await {
        Ok(listener) => {
            let handle = listener.spawn(daemon.context().clone());
            let mut listeners = lock(&daemon.listeners);
            if let Some(mut old) = listeners.insert(config.bind_address.clone(), handle) {
                old.stop();
            }
        }
        Err(e) => {
            tracing::error!(address = %config.bind_address, error = %e, "Failed to start listener");
        }
    }
}

fn delete_listener(daemon: &Daemon, config: &ListenerConfig) {
    match lock(&daemon.listeners).remove(&config.bind_address) {
        Some(mut handle) => handle.stop(),
        None => tracing::warn!(address = %config.bind_address, "No such listener"),
    }
}

fn add_tier(ctx: &Arc<Context>, config: &TierConfig) {
    let tier = build_tier(ctx, config);
    if !ctx.tiers.add(tier.clone()) {
        tracing::warn!(tier = %config.name, "Tier already exists");
        return;
    }
    for backend in tier.backends() {
        backend.retry();
    }
}

fn delete_tier(ctx: &Context, name: &str) {
    let Some(tier) = ctx.tiers.remove(name) else {
        tracing::warn!(tier = %name, "No such tier");
        return;
    };
    for backend in tier.backends() {
        tier.remove_backend(backend.name());
        backend.remove();
    }
}

fn modify_tier(ctx: &Context, config: &TierConfig, flags: ChangeFlags) {
    let Some(tier) = ctx.tiers.get(&config.name) else {
        tracing::warn!(tier = %config.name, "No such tier");
        return;
    };
    if flags.contains(ChangeFlags::POLICY) {
        tier.set_kind(config.policy);
    }
}

fn add_backend(ctx: &Arc<Context>, tier_name: &str, config: BackendConfig) {
    let Some(tier) = ctx.tiers.get(tier_name) else {
        tracing::warn!(tier = %tier_name, backend = %config.name, "Backend added to unknown tier");
        return;
    };
    let name = config.name.clone();
    let backend = Backend::new(config, ctx);
    if tier.add_backend(backend.clone()) {
        backend.retry();
    } else {
        tracing::warn!(tier = %tier_name, backend = %name, "Backend already exists");
    }
}

fn delete_backend(ctx: &Context, tier_name: &str, name: &str) {
    let removed = ctx
        .tiers
        .get(tier_name)
        .and_then(|tier| tier.remove_backend(name));
    match removed {
        Some(backend) => backend.remove(),
        None => tracing::warn!(tier = %tier_name, backend = %name, "No such backend"),
    }
}

fn modify_backend(ctx: &Arc<Context>, tier_name: &str, config: BackendConfig, flags: ChangeFlags) {
    let Some(tier) = ctx.tiers.get(tier_name) else {
        tracing::warn!(tier = %tier_name, backend = %config.name, "Backend modified in unknown tier");
        return;
    };
    match tier.backend(&config.name) {
        Some(backend) => {
            backend.reconfigure(config, flags);
            if flags.contains(ChangeFlags::WEIGHT) {
                tier.reorder();
            }
        }
        None => {
            tracing::warn!(tier = %tier_name, backend = %config.name, "Modified backend missing, adding it");
            add_backend(ctx, tier_name, config);
        }
    }
}
