//! Logs and metrics.
//!
//! # Data Flow
//! ```text
//! daemon, balancer, net ─tracing─▶ logging.rs ─▶ stdout (text or JSON lines)
//!                       ─metrics─▶ metrics.rs ─▶ Prometheus scrape endpoint
//! ```
//!
//! # Design Decisions
//! - Connection ids, backend and tier names travel as fields, never inside messages
//! - Metric calls are no-ops until a recorder is installed, so tests need no setup

pub mod logging;
pub mod metrics;
