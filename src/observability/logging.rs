//! Structured logging.
//!
//! # Responsibilities
//! - Initialize the global `tracing` subscriber once at startup
//! - Pick the log level from `RUST_LOG` or the configuration
//!
//! # Design Decisions
//! - `RUST_LOG` wins over the configured level so an operator can raise
//!   verbosity without editing the config file
//! - JSON format for production, plain text for development

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::ObservabilityConfig;

/// Filter used when neither `RUST_LOG` nor the configuration yields a valid one.
const DEFAULT_FILTER: &str = "lloadd=info";

/// Build the level filter for `config`.
pub fn filter(config: &ObservabilityConfig) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("lloadd={},tower_http=info", config.log_level)))
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Install the global subscriber. Later calls are ignored.
pub fn init(config: &ObservabilityConfig) {
    let json_layer = config.json_logs.then(|| {
        fmt::layer()
            .json()
            .with_target(true)
            .with_thread_names(true)
    });
    let text_layer = (!config.json_logs).then(|| fmt::layer().with_thread_names(true));

    let installed = tracing_subscriber::registry()
        .with(filter(config))
        .with(json_layer)
        .with(text_layer)
        .try_init();

    if installed.is_ok() {
        tracing::info!(
            level = %config.log_level,
            json = config.json_logs,
            "Logging initialized"
        );
    }
}
