//! Unix signals.
//!
//! SIGTERM and SIGINT escalate the shutdown mode one step at a time, so a
//! second signal during a graceful shutdown cuts it short. SIGHUP asks for
//! a configuration reload and never stops the daemon.

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;

use crate::lifecycle::shutdown::{Shutdown, ShutdownMode};

/// Listen for signals until an abrupt shutdown was requested.
///
/// Each SIGHUP sends a unit on `reload`.
pub async fn handle_signals(
    shutdown: Shutdown,
    reload: mpsc::UnboundedSender<()>,
) -> std::io::Result<()> {
    let mut term = signal(SignalKind::terminate())?;
    let mut int = signal(SignalKind::interrupt())?;
    let mut hup = signal(SignalKind::hangup())?;

    loop {
        tokio::select! {
            _ = term.recv() => {}
            _ = int.recv() => {}
            _ = hup.recv() => {
                tracing::info!("SIGHUP received, reloading configuration");
                let _ = reload.send(());
                continue;
            }
        }
        let next = match shutdown.mode() {
            ShutdownMode::Running => ShutdownMode::Graceful,
            _ => ShutdownMode::Abrupt,
        };
        tracing::info!(mode = ?next, "Shutdown signal received");
        shutdown.trigger(next);
        if next == ShutdownMode::Abrupt {
            return Ok(());
        }
    }
}
