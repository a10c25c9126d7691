//! Weighted random selection (RFC 2782 style).
//!
//! Members are kept sorted by ascending weight, zero weights first. Each
//! draw picks `r` uniformly in `[0, total]` and takes the first remaining
//! member whose running weight sum reaches `r`, so a zero-weight member
//! is still chosen occasionally. When every remaining weight is zero the
//! draw is uniform.

use std::sync::Arc;

use crate::config::TierKind;
use crate::load_balancer::backend::Backend;
use crate::load_balancer::{Selection, SelectStatus, TierPolicy};
use crate::net::operation::Operation;

#[derive(Debug)]
pub struct Weighted {
    rng: fastrand::Rng,
}

impl Weighted {
    pub fn new() -> Self {
        Self {
            rng: fastrand::Rng::new(),
        }
    }

    #[cfg(test)]
    fn with_seed(seed: u64) -> Self {
        Self {
            rng: fastrand::Rng::with_seed(seed),
        }
    }

    /// Index into `candidates` of the next draw.
    fn draw(&mut self, candidates: &[(usize, u32)]) -> usize {
        let total: u64 = candidates.iter().map(|(_, w)| *w as u64).sum();
        if total == 0 {
            return self.rng.usize(..candidates.len());
        }
        let r = self.rng.u64(0..=total);
        let mut running = 0u64;
        for (pos, (_, weight)) in candidates.iter().enumerate() {
            running += *weight as u64;
            if running >= r {
                return pos;
            }
        }
        candidates.len() - 1
    }
}

impl Default for Weighted {
    fn default() -> Self {
        Self::new()
    }
}

impl TierPolicy for Weighted {
    fn kind(&self) -> TierKind {
        TierKind::Weighted
    }

    fn add_backend(&mut self, backends: &mut Vec<Arc<Backend>>, backend: Arc<Backend>) {
        let weight = backend.weight();
        let pos = backends.partition_point(|b| b.weight() <= weight);
        backends.insert(pos, backend);
    }

    fn select(&mut self, backends: &[Arc<Backend>], op: &Arc<Operation>) -> Selection {
        let mut candidates: Vec<(usize, u32)> = backends
            .iter()
            .enumerate()
            .map(|(idx, b)| (idx, b.weight()))
            .collect();
        let mut status = SelectStatus::Unavailable;

        while !candidates.is_empty() {
            let pos = self.draw(&candidates);
            let (idx, _) = candidates.remove(pos);
            match backends[idx].select(op) {
                Ok(chosen) => return Ok(chosen),
                Err(s) => status = status.merge(s),
            }
        }
        Err(status)
    }

    fn reorder(&mut self, backends: &mut Vec<Arc<Backend>>) {
        backends.sort_by_key(|b| b.weight());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::tag;
    use crate::testing;

    #[tokio::test]
    async fn members_sorted_by_weight() {
        let (ctx, _dialer) = testing::context();
        let mut policy = Weighted::new();
        let mut backends = Vec::new();
        for (name, weight) in [("w3", 3), ("w0", 0), ("w1", 1)] {
            let mut config = testing::backend_config(name, 1, 0);
            config.weight = weight;
            policy.add_backend(&mut backends, Backend::new(config, &ctx));
        }
        let names: Vec<_> = backends.iter().map(|b| b.name().to_string()).collect();
        assert_eq!(names, ["w0", "w1", "w3"]);
    }

    #[tokio::test]
    async fn distribution_follows_weights() {
        let (ctx, _dialer) = testing::context();
        let mut policy = Weighted::with_seed(7);
        let mut backends = Vec::new();
        for (name, weight) in [("w0", 0), ("w1", 1), ("w3", 3)] {
            let mut config = testing::backend_config(name, 1, 0);
            config.weight = weight;
            policy.add_backend(&mut backends, Backend::new(config, &ctx));
        }
        let _conns: Vec<_> = backends.iter().map(testing::ready_connection).collect();
        let (client, _crx) = testing::client();

        let mut counts = [0usize; 3];
        for msgid in 1..=10_000 {
            let op = Operation::new(&client, msgid, tag::SEARCH_REQUEST);
            let (conn, _) = policy.select(&backends, &op).unwrap();
            let idx = backends
                .iter()
                .position(|b| b.name() == conn.backend().unwrap().name())
                .unwrap();
            counts[idx] += 1;
        }
        let [zero, one, three] = counts;
        assert!(zero > 0);
        assert!(zero < three);
        let ratio = three as f64 / one as f64;
        assert!(ratio > 2.5 && ratio < 3.5, "ratio {}", ratio);
    }

    #[test]
    fn all_zero_weights_draw_uniformly() {
        let mut policy = Weighted::with_seed(1);
        let candidates = [(0, 0), (1, 0), (2, 0), (3, 0)];
        let mut seen = [false; 4];
        for _ in 0..200 {
            seen[policy.draw(&candidates)] = true;
        }
        assert!(seen.iter().all(|s| *s));
    }
}
