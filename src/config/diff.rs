//! Translate a reloaded configuration into change descriptors.
//!
//! # Design Decisions
//! - Deletes come before adds so a renamed object never exceeds limits
//! - Adding a tier carries its backends; only tiers present in both
//!   configurations produce backend-level changes
//! - Observability and admin settings are not live-reconfigurable

use crate::config::schema::{BackendConfig, DaemonSettings, LloadConfig, TierConfig};
use crate::reconfig::change::{Change, ChangeFlags, ChangeTarget};

/// Compute the ordered list of changes turning `old` into `new`.
pub fn diff(old: &LloadConfig, new: &LloadConfig) -> Vec<Change> {
    let mut changes = Vec::new();

    let flags = daemon_flags(&old.daemon, &new.daemon);
    if !flags.is_empty() {
        changes.push(Change::modify(ChangeTarget::Daemon(new.daemon.clone()), flags));
    }

    for listener in &old.listeners {
        if !new.listeners.iter().any(|l| l.bind_address == listener.bind_address) {
            changes.push(Change::delete(ChangeTarget::Listener(listener.clone())));
        }
    }
    for listener in &new.listeners {
        match old.listeners.iter().find(|l| l.bind_address == listener.bind_address) {
            None => changes.push(Change::add(ChangeTarget::Listener(listener.clone()))),
            Some(prev) if prev != listener => {
                // Listener limits are fixed at bind time: rebind.
                changes.push(Change::delete(ChangeTarget::Listener(prev.clone())));
                changes.push(Change::add(ChangeTarget::Listener(listener.clone())));
            }
            Some(_) => {}
        }
    }

    for tier in &old.tiers {
        if !new.tiers.iter().any(|t| t.name == tier.name) {
            changes.push(Change::delete(ChangeTarget::Tier(tier.clone())));
        }
    }
    for tier in &new.tiers {
        match old.tiers.iter().find(|t| t.name == tier.name) {
            None => changes.push(Change::add(ChangeTarget::Tier(tier.clone()))),
            Some(prev) => diff_tier(prev, tier, &mut changes),
        }
    }

    changes
}

fn daemon_flags(old: &DaemonSettings, new: &DaemonSettings) -> ChangeFlags {
    let mut flags = ChangeFlags::NONE;
    if old.io_threads != new.io_threads {
        flags |= ChangeFlags::THREADS;
    }
    if old.worker_threads != new.worker_threads {
        flags |= ChangeFlags::WORKERS;
    }
    if old.timeouts != new.timeouts {
        flags |= ChangeFlags::TIMEOUTS;
    }
    if old.max_pdus_per_cycle != new.max_pdus_per_cycle
        || old.max_pdu_bytes != new.max_pdu_bytes
        || old.client_max_pending != new.client_max_pending
        || old.write_high_water != new.write_high_water
    {
        flags |= ChangeFlags::LIMITS;
    }
    flags
}

fn diff_tier(old: &TierConfig, new: &TierConfig, changes: &mut Vec<Change>) {
    if old.policy != new.policy {
        changes.push(Change::modify(ChangeTarget::Tier(new.clone()), ChangeFlags::POLICY));
    }

    let target = |config: &BackendConfig| ChangeTarget::Backend {
        tier: new.name.clone(),
        config: config.clone(),
    };

    for backend in &old.backends {
        if !new.backends.iter().any(|b| b.name == backend.name) {
            changes.push(Change::delete(target(backend)));
        }
    }
    for backend in &new.backends {
        match old.backends.iter().find(|b| b.name == backend.name) {
            None => changes.push(Change::add(target(backend))),
            Some(prev) => {
                let flags = backend_flags(prev, backend);
                if !flags.is_empty() {
                    changes.push(Change::modify(target(backend), flags));
                }
            }
        }
    }
}

/// Flags describing how a backend's configuration changed.
pub fn backend_flags(old: &BackendConfig, new: &BackendConfig) -> ChangeFlags {
    let mut flags = ChangeFlags::NONE;
    if old.uri != new.uri {
        flags |= ChangeFlags::ADDRESS;
    }
    if old.numconns != new.numconns || old.max_opening != new.max_opening {
        flags |= ChangeFlags::CONNS;
    }
    if old.bindconns != new.bindconns {
        flags |= ChangeFlags::BINDCONNS;
    }
    if old.weight != new.weight {
        flags |= ChangeFlags::WEIGHT;
    }
    if old.max_pending_ops != new.max_pending_ops || old.conn_max_pending != new.conn_max_pending {
        flags |= ChangeFlags::PENDING;
    }
    if old.retry_ms != new.retry_ms || old.retry_max_ms != new.retry_max_ms {
        flags |= ChangeFlags::RETRY;
    }
    if old.bindconf != new.bindconf {
        flags |= ChangeFlags::BINDCONF;
    }
    flags
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{ListenerConfig, TierKind};
    use crate::reconfig::change::{ChangeKind, ChangeObject};

    fn backend(name: &str) -> BackendConfig {
        toml::from_str(&format!("name = \"{}\"\nuri = \"ldap://{}\"", name, name)).unwrap()
    }

    fn config() -> LloadConfig {
        LloadConfig {
            listeners: vec![ListenerConfig::default()],
            tiers: vec![TierConfig {
                name: "t1".into(),
                policy: TierKind::RoundRobin,
                backends: vec![backend("a"), backend("b")],
            }],
            ..LloadConfig::default()
        }
    }

    #[test]
    fn identical_configs_produce_nothing() {
        assert!(diff(&config(), &config()).is_empty());
    }

    #[test]
    fn backend_changes() {
        let old = config();
        let mut new = config();
        new.tiers[0].backends.remove(0);
        new.tiers[0].backends[0].numconns = 10;
        new.tiers[0].backends[0].weight = 5;
        new.tiers[0].backends.push(backend("c"));

        let changes = diff(&old, &new);
        assert_eq!(changes.len(), 3);
        assert_eq!(changes[0].kind, ChangeKind::Delete);
        assert_eq!(changes[0].target_name(), "t1/a");
        assert_eq!(changes[1].kind, ChangeKind::Modify);
        assert!(changes[1].flags.contains(ChangeFlags::CONNS | ChangeFlags::WEIGHT));
        assert!(!changes[1].flags.contains(ChangeFlags::ADDRESS));
        assert_eq!(changes[2].kind, ChangeKind::Add);
        assert_eq!(changes[2].object(), ChangeObject::Backend);
    }

    #[test]
    fn daemon_and_tier_changes() {
        let old = config();
        let mut new = config();
        new.daemon.io_threads = 8;
        new.daemon.timeouts.operation_secs = 5;
        new.tiers[0].policy = TierKind::BestOf;
        new.tiers.push(TierConfig {
            name: "t2".into(),
            policy: TierKind::Weighted,
            backends: vec![backend("z")],
        });

        let changes = diff(&old, &new);
        assert_eq!(changes[0].object(), ChangeObject::Daemon);
        assert!(changes[0].flags.contains(ChangeFlags::THREADS | ChangeFlags::TIMEOUTS));
        assert!(changes
            .iter()
            .any(|c| c.object() == ChangeObject::Tier && c.flags.contains(ChangeFlags::POLICY)));
        assert!(changes
            .iter()
            .any(|c| c.object() == ChangeObject::Tier && c.kind == ChangeKind::Add));
    }
}
