//! Load balancing subsystem.
//!
//! # Data Flow
//! ```text
//! Request read off a client connection → Operation
//!     → pool.rs (try tiers in configured order)
//!     → tier.rs (tier mutex, policy picks the candidate order):
//!         - round_robin.rs (rotating cursor)
//!         - weighted.rs (RFC 2782 weighted shuffle)
//!         - best_of.rs (best of two random choices by fitness)
//!     → backend.rs (backend mutex, ready connection with spare capacity)
//!     → upstream connection + rewritten message id, or Busy/Unavailable
//! ```
//!
//! # Design Decisions
//! - Lock order is Tier → Backend → Connection → Operation link
//! - Policies keep only private scheduling state; the tier owns membership
//! - Busy (capacity exhausted) dominates Unavailable (nothing connected)
//! - Backend health accumulates in atomics and is folded periodically

pub mod backend;
pub mod best_of;
pub mod pool;
pub mod round_robin;
pub mod tier;
pub mod weighted;

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use crate::config::TierKind;
use crate::load_balancer::backend::Backend;
use crate::net::connection::Connection;
use crate::net::operation::Operation;
use crate::proto::ResultCode;

/// Why no upstream could take an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectStatus {
    /// Connections exist but none has spare capacity.
    Busy,
    /// Nothing usable is connected.
    Unavailable,
}

impl SelectStatus {
    pub fn merge(self, other: SelectStatus) -> SelectStatus {
        if self == SelectStatus::Busy || other == SelectStatus::Busy {
            SelectStatus::Busy
        } else {
            SelectStatus::Unavailable
        }
    }

    /// LDAP result reported to the client.
    pub fn result_code(self) -> ResultCode {
        match self {
            SelectStatus::Busy => ResultCode::Busy,
            SelectStatus::Unavailable => ResultCode::Unavailable,
        }
    }

    pub fn diagnostic(self) -> &'static str {
        match self {
            SelectStatus::Busy => "all servers busy",
            SelectStatus::Unavailable => "no connections available",
        }
    }
}

/// Chosen upstream connection and the message id registered on it.
pub type Selection = Result<(Arc<Connection>, i32), SelectStatus>;

/// Backend selection policy of a tier.
///
/// Every call happens under the tier mutex.
pub trait TierPolicy: Send + fmt::Debug {
    fn kind(&self) -> TierKind;

    /// Insert a new member.
    fn add_backend(&mut self, backends: &mut Vec<Arc<Backend>>, backend: Arc<Backend>) {
        backends.push(backend);
    }

    /// Remove the member at `index`.
    fn remove_backend(&mut self, backends: &mut Vec<Arc<Backend>>, index: usize) -> Arc<Backend> {
        backends.remove(index)
    }

    /// Find an upstream for `op`; only fails once every member refused.
    fn select(&mut self, backends: &[Arc<Backend>], op: &Arc<Operation>) -> Selection;

    /// Periodic refresh (about once per second).
    fn update(&mut self, _backends: &[Arc<Backend>], _now: Instant) {}

    /// Re-establish ordering after member attributes changed.
    fn reorder(&mut self, _backends: &mut Vec<Arc<Backend>>) {}
}

pub fn policy_for(kind: TierKind) -> Box<dyn TierPolicy> {
    match kind {
        TierKind::RoundRobin => Box::new(round_robin::RoundRobin::new()),
        TierKind::Weighted => Box::new(weighted::Weighted::new()),
        TierKind::BestOf => Box::new(best_of::BestOf::new()),
    }
}

/// Try every member once, starting at `start` and skipping `skip`.
///
/// Returns the index of the member that accepted.
pub(crate) fn sweep(
    backends: &[Arc<Backend>],
    start: usize,
    skip: Option<usize>,
    op: &Arc<Operation>,
) -> Result<(usize, (Arc<Connection>, i32)), SelectStatus> {
    let n = backends.len();
    let mut status = SelectStatus::Unavailable;
    for i in 0..n {
        let idx = (start + i) % n;
        if skip == Some(idx) {
            continue;
        }
        match backends[idx].select(op) {
            Ok(chosen) => return Ok((idx, chosen)),
            Err(s) => status = status.merge(s),
        }
    }
    Err(status)
}
