//! Configuration file watcher for hot reload.
//!
//! The parent directory is watched rather than the file itself: editors
//! and deployment tools usually replace the file by renaming a new one
//! over it, which a watch on the old inode would miss.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::config::loader::load_config;
use crate::config::schema::LloadConfig;
use crate::sync::lock;

/// Delivers every new, valid version of the configuration file.
pub struct ConfigWatcher {
    path: PathBuf,
    update_tx: mpsc::UnboundedSender<LloadConfig>,
}

impl ConfigWatcher {
    /// Returns the watcher and a receiver for validated configurations.
    pub fn new(path: &Path) -> (Self, mpsc::UnboundedReceiver<LloadConfig>) {
        let (update_tx, update_rx) = mpsc::unbounded_channel();
        (
            Self {
                path: path.to_path_buf(),
                update_tx,
            },
            update_rx,
        )
    }

    /// Sender that can be used to push a reload by hand (SIGHUP).
    pub fn sender(&self) -> mpsc::UnboundedSender<LloadConfig> {
        self.update_tx.clone()
    }

    /// Start watching in notify's background thread.
    ///
    /// The returned watcher must be kept alive for as long as reloads are wanted.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let file_name = self.path.file_name().map(OsString::from);
        let tx = self.update_tx.clone();
        let path = self.path.clone();
        // A single save fires several events; only changed contents are sent.
        let last = Arc::new(Mutex::new(load_config(&path).ok()));

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let event = match res {
                Ok(event) => event,
                Err(e) => {
                    tracing::error!(error = %e, "Config watch error");
                    return;
                }
            };
            let relevant = (event.kind.is_modify() || event.kind.is_create())
                && event
                    .paths
                    .iter()
                    .any(|p| p.file_name().map(OsString::from) == file_name);
            if !relevant {
                return;
            }
            match load_config(&path) {
                Ok(config) => {
                    let mut last = lock(&last);
                    if last.as_ref() == Some(&config) {
                        return;
                    }
                    tracing::info!(path = %path.display(), "Config file changed, reloading");
                    *last = Some(config.clone());
                    let _ = tx.send(config);
                }
                Err(e) => tracing::error!(
                    path = %path.display(),
                    error = %e,
                    "Failed to reload config, keeping current configuration"
                ),
            }
        })?;

        watcher.watch(&dir, RecursiveMode::NonRecursive)?;
        tracing::info!(path = %self.path.display(), "Config watcher started");
        Ok(watcher)
    }
}
