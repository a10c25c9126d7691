//! Loading, checking and reloading `lloadd.toml`.
//!
//! # Data Flow
//! ```text
//! lloadd.toml ─▶ loader.rs (TOML into LloadConfig) ─▶ validation.rs
//!
//! reload (file change or SIGHUP):
//!     watcher.rs ─▶ loader.rs ─▶ diff.rs (current vs new)
//!         ─▶ Vec<Change> ─▶ Daemon::reconfigure, one change per pause
//! ```
//!
//! # Design Decisions
//! - A loaded `LloadConfig` is never mutated; the daemon swaps whole snapshots
//! - Every field has a default, so a file naming one tier is enough
//! - serde rejects malformed input, validation.rs rejects inconsistent input

pub mod diff;
pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    AdminConfig, BackendConfig, BindConf, DaemonSettings, ListenerConfig, LloadConfig,
    ObservabilityConfig, TierConfig, TierKind, TimeoutConfig,
};
