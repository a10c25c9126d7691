//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check uniqueness of listener addresses, tier and backend names
//! - Validate value ranges (threads > 0, retry delays ordered)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: LloadConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use std::net::SocketAddr;

use thiserror::Error;

use crate::config::schema::{BackendConfig, LloadConfig};

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("daemon.{field} must be at least 1")]
    ZeroSetting { field: &'static str },

    #[error("listener address '{0}' is not a socket address")]
    ListenerAddress(String),

    #[error("listener address '{0}' is configured twice")]
    DuplicateListener(String),

    #[error("tier '{0}' is configured twice")]
    DuplicateTier(String),

    #[error("backend '{backend}' appears twice in tier '{tier}'")]
    DuplicateBackend { tier: String, backend: String },

    #[error("backend '{backend}' has an invalid uri: {reason}")]
    BackendUri { backend: String, reason: String },

    #[error("backend '{backend}': {reason}")]
    BackendLimit { backend: String, reason: &'static str },
}

/// Validate a configuration, collecting every error.
pub fn validate_config(config: &LloadConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    let daemon = &config.daemon;

    for (field, value) in [
        ("io_threads", daemon.io_threads),
        ("worker_threads", daemon.worker_threads),
        ("max_pdus_per_cycle", daemon.max_pdus_per_cycle),
        ("max_pdu_bytes", daemon.max_pdu_bytes),
        ("write_high_water", daemon.write_high_water),
    ] {
        if value == 0 {
            errors.push(ValidationError::ZeroSetting { field });
        }
    }
    if daemon.timeouts.pause_secs == 0 {
        errors.push(ValidationError::ZeroSetting { field: "timeouts.pause_secs" });
    }

    let mut addresses = HashSet::new();
    for listener in &config.listeners {
        if listener.bind_address.parse::<SocketAddr>().is_err() {
            errors.push(ValidationError::ListenerAddress(listener.bind_address.clone()));
        }
        if !addresses.insert(listener.bind_address.as_str()) {
            errors.push(ValidationError::DuplicateListener(listener.bind_address.clone()));
        }
    }

    let mut tiers = HashSet::new();
    for tier in &config.tiers {
        if !tiers.insert(tier.name.as_str()) {
            errors.push(ValidationError::DuplicateTier(tier.name.clone()));
        }
        let mut names = HashSet::new();
        for backend in &tier.backends {
            if !names.insert(backend.name.as_str()) {
                errors.push(ValidationError::DuplicateBackend {
                    tier: tier.name.clone(),
                    backend: backend.name.clone(),
                });
            }
            validate_backend(backend, &mut errors);
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_backend(backend: &BackendConfig, errors: &mut Vec<ValidationError>) {
    if let Err(reason) = backend.address() {
        errors.push(ValidationError::BackendUri {
            backend: backend.name.clone(),
            reason,
        });
    }

    let limit = |reason| ValidationError::BackendLimit {
        backend: backend.name.clone(),
        reason,
    };
    if backend.numconns == 0 {
        errors.push(limit("numconns must be at least 1"));
    }
    if backend.max_opening == 0 {
        errors.push(limit("max_opening must be at least 1"));
    }
    if backend.retry_ms == 0 {
        errors.push(limit("retry_ms must be positive"));
    }
    if backend.retry_max_ms < backend.retry_ms {
        errors.push(limit("retry_max_ms must not be below retry_ms"));
    }
}
