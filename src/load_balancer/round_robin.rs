//! Round-robin load balancing strategy.

use std::sync::Arc;

use crate::config::TierKind;
use crate::load_balancer::backend::Backend;
use crate::load_balancer::{sweep, Selection, TierPolicy};
use crate::net::operation::Operation;

/// Round-robin selector.
/// Keeps a cursor that moves past the backend that accepted the last operation.
#[derive(Debug, Default)]
pub struct RoundRobin {
    cursor: usize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TierPolicy for RoundRobin {
    fn kind(&self) -> TierKind {
        TierKind::RoundRobin
    }

    fn remove_backend(&mut self, backends: &mut Vec<Arc<Backend>>, index: usize) -> Arc<Backend> {
        let removed = backends.remove(index);
        if index < self.cursor {
            self.cursor -= 1;
        }
        if self.cursor >= backends.len() {
            self.cursor = 0;
        }
        removed
    }

    fn select(&mut self, backends: &[Arc<Backend>], op: &Arc<Operation>) -> Selection {
        let (idx, chosen) = sweep(backends, self.cursor, None, op)?;
        self.cursor = (idx + 1) % backends.len();
        Ok(chosen)
    }
}
