//! Best of two random choices.
//!
//! Two distinct members are drawn uniformly; the one with the lower
//! fitness (smoothed latency over weight) is tried first. If it refuses,
//! a round-robin sweep from the tier cursor takes over instead of failing.

use std::sync::Arc;
use std::time::Instant;

use crate::config::TierKind;
use crate::load_balancer::backend::Backend;
use crate::load_balancer::{sweep, Selection, SelectStatus, TierPolicy};
use crate::net::operation::Operation;

#[derive(Debug)]
pub struct BestOf {
    rng: fastrand::Rng,
    cursor: usize,
}

impl BestOf {
    pub fn new() -> Self {
        Self {
            rng: fastrand::Rng::new(),
            cursor: 0,
        }
    }

    /// Pick two distinct indices and return the fitter one.
    fn choose(&mut self, backends: &[Arc<Backend>]) -> usize {
        let n = backends.len();
        let a = self.rng.usize(..n);
        let mut b = self.rng.usize(..n - 1);
        if b >= a {
            b += 1;
        }
        if backends[b].fitness() < backends[a].fitness() {
            b
        } else {
            a
        }
    }
}

impl Default for BestOf {
    fn default() -> Self {
        Self::new()
    }
}

impl TierPolicy for BestOf {
    fn kind(&self) -> TierKind {
        TierKind::BestOf
    }

    fn remove_backend(&mut self, backends: &mut Vec<Arc<Backend>>, index: usize) -> Arc<Backend> {
        let removed = backends.remove(index);
        if self.cursor >= backends.len() {
            self.cursor = 0;
        }
        removed
    }

    fn select(&mut self, backends: &[Arc<Backend>], op: &Arc<Operation>) -> Selection {
        let mut status = SelectStatus::Unavailable;
        let mut tried = None;

        if backends.len() >= 2 {
            let winner = self.choose(backends);
            match backends[winner].select(op) {
                Ok(chosen) => return Ok(chosen),
                Err(s) => status = s,
            }
            tried = Some(winner);
        }

        match sweep(backends, self.cursor, tried, op) {
            Ok((idx, chosen)) => {
                self.cursor = (idx + 1) % backends.len();
                Ok(chosen)
            }
            Err(s) => Err(status.merge(s)),
        }
    }

    fn update(&mut self, backends: &[Arc<Backend>], now: Instant) {
        for backend in backends {
            backend.update_fitness(now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::tag;
    use crate::testing;
    use std::time::Duration;

    #[tokio::test]
    async fn fitter_backend_preferred() {
        let (ctx, _dialer) = testing::context();
        let fast = Backend::new(testing::backend_config("fast", 1, 0), &ctx);
        let slow = Backend::new(testing::backend_config("slow", 1, 0), &ctx);
        fast.record_operation(Duration::from_millis(1));
        slow.record_operation(Duration::from_millis(20));

        let backends = vec![slow.clone(), fast.clone()];
        let mut policy = BestOf::new();
        policy.update(&backends, Instant::now());
        assert!(fast.fitness() < slow.fitness());

        let _c1 = testing::ready_connection(&fast);
        let _c2 = testing::ready_connection(&slow);
        let (client, _crx) = testing::client();

        let mut fast_picks = 0;
        let mut slow_picks = 0;
        for msgid in 1..=500 {
            let op = Operation::new(&client, msgid, tag::SEARCH_REQUEST);
            let (conn, _) = policy.select(&backends, &op).unwrap();
            match conn.backend().unwrap().name() {
                "fast" => fast_picks += 1,
                _ => slow_picks += 1,
            }
        }
        assert!(fast_picks > slow_picks);
    }

    #[tokio::test]
    async fn falls_back_to_sweep() {
        let (ctx, _dialer) = testing::context();
        let fast = Backend::new(testing::backend_config("fast", 1, 0), &ctx);
        let slow = Backend::new(testing::backend_config("slow", 1, 0), &ctx);
        fast.record_operation(Duration::from_millis(1));
        slow.record_operation(Duration::from_millis(20));
        let backends = vec![fast.clone(), slow.clone()];
        let mut policy = BestOf::new();
        policy.update(&backends, Instant::now());

        // only the less fit backend has a connection
        let _c = testing::ready_connection(&slow);
        let (client, _crx) = testing::client();
        let (conn, _) = policy
            .select(&backends, &Operation::new(&client, 1, tag::SEARCH_REQUEST))
            .unwrap();
        assert_eq!(conn.backend().unwrap().name(), "slow");
    }

    #[tokio::test]
    async fn single_member_uses_sweep() {
        let (ctx, _dialer) = testing::context();
        let only = Backend::new(testing::backend_config("only", 1, 0), &ctx);
        let _c = testing::ready_connection(&only);
        let (client, _crx) = testing::client();
        let mut policy = BestOf::new();
        assert!(policy
            .select(&[only], &Operation::new(&client, 1, tag::SEARCH_REQUEST))
            .is_ok());
    }
}
