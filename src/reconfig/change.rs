//! Change descriptors and the single pending-change slot.

use std::fmt;
use std::sync::Mutex;

use thiserror::Error;

use crate::config::schema::{BackendConfig, DaemonSettings, ListenerConfig, TierConfig};
use crate::sync::lock;

/// What kind of mutation a change describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Add,
    Delete,
    Modify,
}

/// Object kind a change targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeObject {
    Daemon,
    Listener,
    Tier,
    Backend,
}

/// The object a change applies to, carrying its new configuration.
///
/// For deletes only the identifying fields are consulted.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeTarget {
    Daemon(DaemonSettings),
    Listener(ListenerConfig),
    Tier(TierConfig),
    Backend { tier: String, config: BackendConfig },
}

/// Bitmask of the sub-fields a modify touches.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct ChangeFlags(u32);

impl ChangeFlags {
    pub const NONE: ChangeFlags = ChangeFlags(0);

    // daemon
    pub const THREADS: ChangeFlags = ChangeFlags(1 << 0);
    pub const WORKERS: ChangeFlags = ChangeFlags(1 << 1);
    pub const TIMEOUTS: ChangeFlags = ChangeFlags(1 << 2);
    pub const LIMITS: ChangeFlags = ChangeFlags(1 << 3);

    // tier
    pub const POLICY: ChangeFlags = ChangeFlags(1 << 8);

    // backend
    pub const ADDRESS: ChangeFlags = ChangeFlags(1 << 16);
    pub const CONNS: ChangeFlags = ChangeFlags(1 << 17);
    pub const BINDCONNS: ChangeFlags = ChangeFlags(1 << 18);
    pub const WEIGHT: ChangeFlags = ChangeFlags(1 << 19);
    pub const PENDING: ChangeFlags = ChangeFlags(1 << 20);
    pub const RETRY: ChangeFlags = ChangeFlags(1 << 21);
    pub const BINDCONF: ChangeFlags = ChangeFlags(1 << 22);

    pub fn contains(self, other: ChangeFlags) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub fn intersects(self, other: ChangeFlags) -> bool {
        self.0 & other.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn bits(self) -> u32 {
        self.0
    }
}

impl std::ops::BitOr for ChangeFlags {
    type Output = ChangeFlags;

    fn bitor(self, rhs: ChangeFlags) -> ChangeFlags {
        ChangeFlags(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for ChangeFlags {
    fn bitor_assign(&mut self, rhs: ChangeFlags) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for ChangeFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChangeFlags({:#x})", self.0)
    }
}

/// A pending configuration mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    pub kind: ChangeKind,
    pub flags: ChangeFlags,
    pub target: ChangeTarget,
}

impl Change {
    pub fn add(target: ChangeTarget) -> Self {
        Self {
            kind: ChangeKind::Add,
            flags: ChangeFlags::NONE,
            target,
        }
    }

    pub fn delete(target: ChangeTarget) -> Self {
        Self {
            kind: ChangeKind::Delete,
            flags: ChangeFlags::NONE,
            target,
        }
    }

    pub fn modify(target: ChangeTarget, flags: ChangeFlags) -> Self {
        Self {
            kind: ChangeKind::Modify,
            flags,
            target,
        }
    }

    pub fn object(&self) -> ChangeObject {
        match self.target {
            ChangeTarget::Daemon(_) => ChangeObject::Daemon,
            ChangeTarget::Listener(_) => ChangeObject::Listener,
            ChangeTarget::Tier(_) => ChangeObject::Tier,
            ChangeTarget::Backend { .. } => ChangeObject::Backend,
        }
    }

    /// Human readable name of the target for logs.
    pub fn target_name(&self) -> String {
        match &self.target {
            ChangeTarget::Daemon(_) => "daemon".to_string(),
            ChangeTarget::Listener(l) => l.bind_address.clone(),
            ChangeTarget::Tier(t) => t.name.clone(),
            ChangeTarget::Backend { tier, config } => format!("{}/{}", tier, config.name),
        }
    }
}

/// Errors from submitting a change.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChangeError {
    #[error("another configuration change is already pending")]
    Pending,
}

/// The single global pending-change slot.
#[derive(Debug, Default)]
pub struct ChangeSlot {
    slot: Mutex<Option<Change>>,
}

impl ChangeSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a change; fails if one is already waiting to be applied.
    pub fn submit(&self, change: Change) -> Result<(), ChangeError> {
        let mut slot = lock(&self.slot);
        if slot.is_some() {
            return Err(ChangeError::Pending);
        }
        *slot = Some(change);
        Ok(())
    }

    /// Consume the pending change.
    pub fn take(&self) -> Option<Change> {
        lock(&self.slot).take()
    }

    pub fn is_pending(&self) -> bool {
        lock(&self.slot).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_one_change_may_be_pending() {
        let slot = ChangeSlot::new();
        let change = Change::modify(
            ChangeTarget::Daemon(DaemonSettings::default()),
            ChangeFlags::TIMEOUTS,
        );
        slot.submit(change.clone()).unwrap();
        assert_eq!(slot.submit(change.clone()), Err(ChangeError::Pending));

        assert_eq!(slot.take(), Some(change.clone()));
        assert!(!slot.is_pending());
        slot.submit(change).unwrap();
    }

    #[test]
    fn flag_arithmetic() {
        let flags = ChangeFlags::CONNS | ChangeFlags::WEIGHT;
        assert!(flags.contains(ChangeFlags::CONNS));
        assert!(!flags.contains(ChangeFlags::ADDRESS));
        assert!(flags.intersects(ChangeFlags::WEIGHT | ChangeFlags::ADDRESS));
        assert!(!flags.contains(ChangeFlags::NONE));
    }
}
