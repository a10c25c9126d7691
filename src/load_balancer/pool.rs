//! Tier registry.
//!
//! # Responsibilities
//! - Hold the tiers in configured order
//! - Route an operation through them: the first tier that accepts wins

use std::sync::{Arc, RwLock};

use crate::load_balancer::backend::Backend;
use crate::load_balancer::tier::Tier;
use crate::load_balancer::{Selection, SelectStatus};
use crate::net::operation::Operation;
use crate::sync::{read, write};

/// Manages tiers and routes operations to them.
#[derive(Debug, Default)]
pub struct Tiers {
    tiers: RwLock<Vec<Arc<Tier>>>,
}

impl Tiers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a tier; names are unique.
    pub fn add(&self, tier: Arc<Tier>) -> bool {
        let mut tiers = write(&self.tiers);
        if tiers.iter().any(|t| t.name() == tier.name()) {
            return false;
        }
        tiers.push(tier);
        true
    }

    pub fn remove(&self, name: &str) -> Option<Arc<Tier>> {
        let mut tiers = write(&self.tiers);
        let pos = tiers.iter().position(|t| t.name() == name)?;
        Some(tiers.remove(pos))
    }

    pub fn get(&self, name: &str) -> Option<Arc<Tier>> {
        read(&self.tiers).iter().find(|t| t.name() == name).cloned()
    }

    pub fn all(&self) -> Vec<Arc<Tier>> {
        read(&self.tiers).clone()
    }

    /// Every backend of every tier.
    pub fn backends(&self) -> Vec<Arc<Backend>> {
        self.all().iter().flat_map(|t| t.backends()).collect()
    }

    /// Try each tier in order.
    pub fn select(&self, op: &Arc<Operation>) -> Selection {
        let mut status = SelectStatus::Unavailable;
        for tier in self.all() {
            match tier.select(op) {
                Ok(chosen) => return Ok(chosen),
                Err(s) => {
                    tracing::trace!(tier = %tier.name(), status = ?s, "Tier refused operation");
                    status = status.merge(s);
                }
            }
        }
        Err(status)
    }
}
