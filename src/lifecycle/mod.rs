//! Process lifecycle.
//!
//! # Data Flow
//! ```text
//! SIGTERM/SIGINT ─▶ signals.rs ─▶ Shutdown: Running → Graceful → Abrupt
//! SIGHUP ─────────▶ signals.rs ─▶ reload request (main.rs reloads the file)
//!
//! Graceful: listeners stop, clients close once their operations finish
//! Abrupt:   remaining clients and upstream connections are dropped
//! ```
//!
//! # Design Decisions
//! - The mode only ever escalates; waiters observe it through a watch channel
//! - The daemon reacts to the mode, it never reads signals itself

pub mod shutdown;
pub mod signals;

pub use shutdown::{Shutdown, ShutdownMode};
