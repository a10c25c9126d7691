//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Upstream dial fails
//!     → backend counts the attempt
//!     → backoff.rs (delay for the next attempt, with jitter)
//!     → control runtime timer → backend retry
//! ```
//!
//! # Design Decisions
//! - Connection setup is the only place the balancer retries; client
//!   operations are never replayed
//! - Delays carry up to 10% random jitter

pub mod backoff;
