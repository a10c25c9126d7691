//! lloadd: an LDAP load balancer library.
//!
//! Clients connect to one or more listeners; every request is forwarded to
//! an upstream LDAP server picked from an ordered list of tiers, and the
//! response is relayed back under the client's own message id.

pub mod admin;
pub mod config;
pub mod daemon;
pub mod lifecycle;
pub mod load_balancer;
pub mod net;
pub mod observability;
pub mod proto;
pub mod reconfig;
pub mod resilience;

pub(crate) mod sync;

#[cfg(test)]
mod testing;

pub use config::schema::LloadConfig;
pub use daemon::Daemon;
pub use lifecycle::Shutdown;
