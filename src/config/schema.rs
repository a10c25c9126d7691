//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the balancer.
//! All types derive Serde traits for deserialization from config files.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

/// Default LDAP port used when a backend URI omits one.
pub const LDAP_PORT: u16 = 389;

/// Root configuration for lloadd.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct LloadConfig {
    /// Global daemon settings (threads, limits, timeouts).
    pub daemon: DaemonSettings,

    /// Client-facing listeners.
    pub listeners: Vec<ListenerConfig>,

    /// Tiers in the order they are tried.
    pub tiers: Vec<TierConfig>,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Monitoring API settings.
    pub admin: AdminConfig,
}

/// Daemon-wide settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct DaemonSettings {
    /// Number of IO shard threads.
    pub io_threads: usize,

    /// Maximum number of PDU batches processed concurrently on the worker pool.
    pub worker_threads: usize,

    /// PDUs handled inline per read cycle before the rest is handed to the workers.
    pub max_pdus_per_cycle: usize,

    /// Largest accepted PDU in bytes.
    pub max_pdu_bytes: usize,

    /// Maximum in-flight operations per client (0 = unlimited).
    pub client_max_pending: usize,

    /// Queued output bytes above which the sending side stops reading.
    pub write_high_water: usize,

    /// Timeouts.
    pub timeouts: TimeoutConfig,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            io_threads: 2,
            worker_threads: 4,
            max_pdus_per_cycle: 10,
            max_pdu_bytes: 4 * 1024 * 1024,
            client_max_pending: 0,
            write_high_water: 1024 * 1024,
            timeouts: TimeoutConfig::default(),
        }
    }
}

/// Timeout configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Upstream connection establishment timeout in seconds.
    pub connect_secs: u64,

    /// Operation timeout in seconds (0 = none).
    pub operation_secs: u64,

    /// Idle client timeout in seconds (0 = none).
    pub idle_secs: u64,

    /// Timeout for a single socket write in seconds.
    pub write_secs: u64,

    /// Upper bound on quiescing the daemon for a reconfiguration.
    pub pause_secs: u64,

    /// Time allowed for a graceful shutdown before connections are dropped.
    pub shutdown_secs: u64,
}

impl TimeoutConfig {
    pub fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_secs)
    }

    pub fn operation(&self) -> Option<Duration> {
        (self.operation_secs > 0).then(|| Duration::from_secs(self.operation_secs))
    }

    pub fn idle(&self) -> Option<Duration> {
        (self.idle_secs > 0).then(|| Duration::from_secs(self.idle_secs))
    }

    pub fn write(&self) -> Duration {
        Duration::from_secs(self.write_secs)
    }

    pub fn pause(&self) -> Duration {
        Duration::from_secs(self.pause_secs)
    }

    pub fn shutdown(&self) -> Duration {
        Duration::from_secs(self.shutdown_secs)
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_secs: 5,
            operation_secs: 0,
            idle_secs: 0,
            write_secs: 10,
            pause_secs: 30,
            shutdown_secs: 10,
        }
    }
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:1389").
    pub bind_address: String,

    /// Maximum concurrent client connections on this listener.
    pub max_connections: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:1389".to_string(),
            max_connections: 10_000,
        }
    }
}

/// Backend selection policy of a tier.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TierKind {
    #[default]
    RoundRobin,
    Weighted,
    BestOf,
}

impl std::fmt::Display for TierKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TierKind::RoundRobin => write!(f, "round-robin"),
            TierKind::Weighted => write!(f, "weighted"),
            TierKind::BestOf => write!(f, "best-of"),
        }
    }
}

/// A tier: an ordered set of backends sharing one policy.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct TierConfig {
    /// Unique tier name.
    pub name: String,

    /// Selection policy.
    #[serde(default)]
    pub policy: TierKind,

    /// Member backends.
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
}

/// Upstream server configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct BackendConfig {
    /// Backend identifier, unique within its tier.
    pub name: String,

    /// Server URI (e.g., "ldap://10.0.0.5:389").
    pub uri: String,

    /// Weight used by the weighted and best-of policies.
    #[serde(default = "default_weight")]
    pub weight: u32,

    /// Regular (multiplexed) upstream connections to keep open.
    #[serde(default = "default_numconns")]
    pub numconns: usize,

    /// Connections dedicated to forwarding client binds.
    #[serde(default = "default_bindconns")]
    pub bindconns: usize,

    /// Maximum operations in flight on this backend (0 = unlimited).
    #[serde(default)]
    pub max_pending_ops: usize,

    /// Maximum operations in flight per upstream connection (0 = unlimited).
    #[serde(default)]
    pub conn_max_pending: usize,

    /// Maximum simultaneous connection attempts.
    #[serde(default = "default_max_opening")]
    pub max_opening: usize,

    /// Base delay before redialling after a failure, in milliseconds.
    #[serde(default = "default_retry_ms")]
    pub retry_ms: u64,

    /// Maximum redial delay in milliseconds.
    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,

    /// Credentials used to authenticate regular connections.
    #[serde(default)]
    pub bindconf: Option<BindConf>,
}

impl BackendConfig {
    /// Resolve the URI into a `host:port` address.
    pub fn address(&self) -> Result<String, String> {
        let url = Url::parse(&self.uri).map_err(|e| e.to_string())?;
        if url.scheme() != "ldap" {
            return Err(format!("unsupported scheme '{}'", url.scheme()));
        }
        let host = url.host_str().ok_or_else(|| "missing host".to_string())?;
        let port = url.port().unwrap_or(LDAP_PORT);
        Ok(format!("{}:{}", host, port))
    }
}

fn default_weight() -> u32 {
    1
}

fn default_numconns() -> usize {
    4
}

fn default_bindconns() -> usize {
    1
}

fn default_max_opening() -> usize {
    4
}

fn default_retry_ms() -> u64 {
    5_000
}

fn default_retry_max_ms() -> u64 {
    60_000
}

/// Simple bind credentials for upstream connections.
#[derive(Clone, Deserialize, Serialize, PartialEq)]
pub struct BindConf {
    pub dn: String,
    pub password: String,
}

impl std::fmt::Debug for BindConf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BindConf")
            .field("dn", &self.dn)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Emit logs as JSON lines.
    pub json_logs: bool,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}

/// Monitoring API configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct AdminConfig {
    /// Enable the monitoring API.
    pub enabled: bool,

    /// API key for authentication (Bearer token).
    pub api_key: String,

    /// Monitoring API bind address.
    pub bind_address: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            // WARNING: This is a placeholder! Change this in production.
            api_key: "CHANGE_ME_IN_PRODUCTION".to_string(),
            bind_address: "127.0.0.1:8081".to_string(),
        }
    }
}
