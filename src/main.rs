//! lloadd: an LDAP load balancer.
//!
//! # Architecture Overview
//!
//! ```text
//!                      ┌──────────────────────────────────────────────────────┐
//!                      │                       LLOADD                          │
//!                      │                                                       │
//!   LDAP clients       │  ┌──────────┐   ┌──────────────┐   ┌──────────────┐  │
//!   ───────────────────┼─▶│ listener │──▶│ client loop  │──▶│ tiers +      │  │
//!                      │  │ (accept) │   │ (IO shard)   │   │ backends     │  │
//!                      │  └──────────┘   └──────┬───────┘   └──────┬───────┘  │
//!                      │                        │ overflow         │ select   │
//!                      │                        ▼                  ▼          │
//!                      │                 ┌────────────┐   ┌──────────────┐    │   LDAP
//!   ◀──────────────────┼─────────────────│ worker pool│   │ upstream loop│◀───┼── servers
//!                      │   responses     └────────────┘   │ (IO shard)   │    │
//!                      │                                  └──────────────┘    │
//!                      │  ┌────────────────────────────────────────────────┐  │
//!                      │  │ config + reload │ pause gate │ control tick    │  │
//!                      │  │ monitoring API  │ metrics    │ signals         │  │
//!                      │  └────────────────────────────────────────────────┘  │
//!                      └──────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use lloadd::admin::setup_admin_router;
use lloadd::config::watcher::ConfigWatcher;
use lloadd::config::load_config;
use lloadd::lifecycle::signals::handle_signals;
use lloadd::lifecycle::{Shutdown, ShutdownMode};
use lloadd::net::dialer::TcpDialer;
use lloadd::observability::{logging, metrics};
use lloadd::Daemon;

#[derive(Parser)]
#[command(name = "lloadd", version, about = "LDAP load balancer", long_about = None)]
struct Args {
    /// Configuration file (TOML).
    #[arg(short, long, default_value = "/etc/lloadd/lloadd.toml")]
    config: PathBuf,

    /// Validate the configuration and exit.
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = match load_config(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}: {}", args.config.display(), e);
            std::process::exit(2);
        }
    };
    if args.check {
        println!(
            "{}: OK ({} listeners, {} tiers)",
            args.config.display(),
            config.listeners.len(),
            config.tiers.len()
        );
        return Ok(());
    }

    logging::init(&config.observability);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), config = %args.config.display(), "lloadd starting");

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => {
                metrics::init_metrics(addr);
            }
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let shutdown = Shutdown::new();
    let daemon = Daemon::start(config.clone(), Arc::new(TcpDialer), shutdown.clone()).await?;

    if config.admin.enabled {
        let listener = TcpListener::bind(&config.admin.bind_address).await?;
        tracing::info!(address = %listener.local_addr()?, "Monitoring API listening");
        let router = setup_admin_router(daemon.clone(), &config.admin.api_key);
        let admin_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let served = axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    admin_shutdown.reached(ShutdownMode::Abrupt).await;
                })
                .await;
            if let Err(e) = served {
                tracing::error!(error = %e, "Monitoring API failed");
            }
        });
    }

    // Reloads arrive from the file watcher and from SIGHUP.
    let (watcher, mut updates) = ConfigWatcher::new(&args.config);
    let manual = watcher.sender();
    let _watcher = match watcher.run() {
        Ok(watcher) => Some(watcher),
        Err(e) => {
            tracing::warn!(error = %e, "Config file watching disabled, reload with SIGHUP");
            None
        }
    };

    let (hup_tx, mut hup_rx) = mpsc::unbounded_channel();
    let path = args.config.clone();
    tokio::spawn(async move {
        while hup_rx.recv().await.is_some() {
            match load_config(&path) {
                Ok(config) => {
                    let _ = manual.send(config);
                }
                Err(e) => tracing::error!(
                    error = %e,
                    "Failed to reload config, keeping current configuration"
                ),
            }
        }
    });

    let reloader = daemon.clone();
    tokio::spawn(async move {
        while let Some(config) = updates.recv().await {
            if let Err(e) = reloader.reload(config).await {
                tracing::error!(error = %e, "Configuration reload failed");
            }
        }
    });

    let signals = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = handle_signals(signals, hup_tx).await {
            tracing::error!(error = %e, "Failed to install signal handlers");
        }
    });

    shutdown.reached(ShutdownMode::Graceful).await;
    daemon.shutdown().await;

    tracing::info!("Shutdown complete");
    Ok(())
}
