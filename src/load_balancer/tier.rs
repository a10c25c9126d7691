//! Tiers: ordered backend sets sharing one selection policy.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::Serialize;

use crate::config::TierKind;
use crate::load_balancer::backend::Backend;
use crate::load_balancer::{policy_for, Selection, TierPolicy};
use crate::net::operation::Operation;
use crate::sync::lock;

#[derive(Debug)]
struct TierInner {
    backends: Vec<Arc<Backend>>,
    policy: Box<dyn TierPolicy>,
}

/// A named set of backends.
#[derive(Debug)]
pub struct Tier {
    name: String,
    inner: Mutex<TierInner>,
}

impl Tier {
    pub fn new(name: &str, kind: TierKind) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            inner: Mutex::new(TierInner {
                backends: Vec::new(),
                policy: policy_for(kind),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> TierKind {
        lock(&self.inner).policy.kind()
    }

    /// Add a member. Holds the tier and the backend mutex.
    pub fn add_backend(&self, backend: Arc<Backend>) -> bool {
        let mut inner = lock(&self.inner);
        if inner.backends.iter().any(|b| b.name() == backend.name()) {
            return false;
        }
        let TierInner { backends, policy } = &mut *inner;
        let member = backend.clone();
        member.with_membership(Some(&self.name), || policy.add_backend(backends, backend));
        true
    }

    /// Remove a member. Holds the tier and the backend mutex; the caller
    /// decides what happens to its connections.
    pub fn remove_backend(&self, name: &str) -> Option<Arc<Backend>> {
        let mut inner = lock(&self.inner);
        let index = inner.backends.iter().position(|b| b.name() == name)?;
        let TierInner { backends, policy } = &mut *inner;
        let member = backends[index].clone();
        let removed = member.with_membership(None, || policy.remove_backend(backends, index));
        Some(removed)
    }

    pub fn backend(&self, name: &str) -> Option<Arc<Backend>> {
        lock(&self.inner)
            .backends
            .iter()
            .find(|b| b.name() == name)
            .cloned()
    }

    pub fn backends(&self) -> Vec<Arc<Backend>> {
        lock(&self.inner).backends.clone()
    }

    pub fn select(&self, op: &Arc<Operation>) -> Selection {
        let mut inner = lock(&self.inner);
        let TierInner { backends, policy } = &mut *inner;
        policy.select(backends, op)
    }

    /// Periodic refresh from the control loop.
    pub fn update(&self, now: Instant) {
        let mut inner = lock(&self.inner);
        let TierInner { backends, policy } = &mut *inner;
        policy.update(backends, now);
    }

    /// Switch policy; scheduling state starts fresh.
    pub fn set_kind(&self, kind: TierKind) {
        let mut inner = lock(&self.inner);
        let TierInner { backends, policy } = &mut *inner;
        *policy = policy_for(kind);
        policy.reorder(backends);
        tracing::info!(tier = %self.name, policy = %kind, "Tier policy changed");
    }

    /// Member attributes changed (weights).
    pub fn reorder(&self) {
        let mut inner = lock(&self.inner);
        let TierInner { backends, policy } = &mut *inner;
        policy.reorder(backends);
    }

    pub fn snapshot(&self) -> TierSnapshot {
        let inner = lock(&self.inner);
        TierSnapshot {
            name: self.name.clone(),
            policy: inner.policy.kind(),
            backends: inner.backends.iter().map(|b| b.name().to_string()).collect(),
        }
    }
}

/// Read-only view for monitoring.
#[derive(Debug, Clone, Serialize)]
pub struct TierSnapshot {
    pub name: String,
    pub policy: TierKind,
    pub backends: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::tag;
    use crate::testing;

    #[tokio::test]
    async fn membership_tracks_backend_tier() {
        let (ctx, _dialer) = testing::context();
        let tier = Tier::new("primary", TierKind::RoundRobin);
        let a = Backend::new(testing::backend_config("a", 1, 0), &ctx);

        assert!(tier.add_backend(a.clone()));
        assert!(!tier.add_backend(Backend::new(testing::backend_config("a", 1, 0), &ctx)));
        assert_eq!(a.tier().as_deref(), Some("primary"));

        let removed = tier.remove_backend("a").unwrap();
        assert!(Arc::ptr_eq(&removed, &a));
        assert_eq!(a.tier(), None);
        assert!(tier.backends().is_empty());
    }

    #[tokio::test]
    async fn policy_switch_resorts_members() {
        let (ctx, _dialer) = testing::context();
        let tier = Tier::new("t", TierKind::RoundRobin);
        for (name, weight) in [("heavy", 5), ("light", 1)] {
            let mut config = testing::backend_config(name, 1, 0);
            config.weight = weight;
            tier.add_backend(Backend::new(config, &ctx));
        }
        tier.set_kind(TierKind::Weighted);
        assert_eq!(tier.kind(), TierKind::Weighted);
        assert_eq!(tier.snapshot().backends, ["light", "heavy"]);
    }

    #[tokio::test]
    async fn rotation_is_fair_across_threads() {
        let (ctx, _dialer) = testing::context();
        let tier = Tier::new("t", TierKind::RoundRobin);
        let mut conns = Vec::new();
        for name in ["a", "b", "c", "d"] {
            let backend = Backend::new(testing::backend_config(name, 1, 0), &ctx);
            conns.push(testing::ready_connection(&backend));
            tier.add_backend(backend);
        }
        let (client, _crx) = testing::client();

        let picks = std::sync::Mutex::new(Vec::new());
        std::thread::scope(|s| {
            for t in 0..4 {
                let tier = &tier;
                let client = &client;
                let picks = &picks;
                s.spawn(move || {
                    for i in 0..25 {
                        let op = Operation::new(client, t * 100 + i + 1, tag::SEARCH_REQUEST);
                        let (conn, _) = tier.select(&op).unwrap();
                        let name = conn.backend().unwrap().name().to_string();
                        lock(picks).push(name);
                    }
                });
            }
        });

        let picks = picks.into_inner().unwrap();
        for name in ["a", "b", "c", "d"] {
            assert_eq!(picks.iter().filter(|p| *p == name).count(), 25);
        }
    }
}
