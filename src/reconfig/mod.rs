//! Live reconfiguration.
//!
//! # Data Flow
//! ```text
//! Change (from config::diff or the API)
//!     → change.rs (single pending slot)
//!     → gate.rs (pause: every event loop parked)
//!     → apply.rs (mutate daemon, listeners, tiers, backends)
//!     → gate.rs (resume)
//! ```
//!
//! # Design Decisions
//! - One change at a time; a second submission while one is pending fails
//! - Applying never fails as a whole: anything that cannot be changed in
//!   place falls back to closing the affected connections and redialling

pub mod apply;
pub mod change;
pub mod gate;

pub use change::{Change, ChangeError, ChangeFlags, ChangeKind, ChangeObject, ChangeTarget};
pub use gate::PauseGate;
