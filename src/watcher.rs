//! Polling watcher for the configuration file.
//!
//! The file's modification time and length are sampled at a fixed interval;
//! any difference from the previous sample triggers a reload.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tracing::debug;

use crate::events::EventBus;
use crate::loader::ConfigReloader;

/// Default polling interval in milliseconds.
pub const DEFAULT_INTERVAL_MS: u64 = 1000;

/// Observable state of the configuration file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fingerprint {
    modified: Option<SystemTime>,
    len: u64,
}

/// Sample `path`. `None` when the file does not exist or cannot be read.
pub async fn fingerprint(path: &Path) -> Option<Fingerprint> {
    let metadata = tokio::fs::metadata(path).await.ok()?;
    Some(Fingerprint {
        modified: metadata.modified().ok(),
        len: metadata.len(),
    })
}

/// Watch `path` and reload through `reloader` whenever it changes.
///
/// `baseline` is the sample taken before the live generation was loaded;
/// edits made after that sample are picked up on the first poll. Runs until
/// `shutdown` becomes `true` or its sender is dropped.
pub async fn watch_config(
    reloader: Arc<ConfigReloader>,
    path: PathBuf,
    baseline: Option<Fingerprint>,
    interval: Duration,
    events: EventBus,
    mut shutdown: watch::Receiver<bool>,
) {
    events.info(format!("Watching config file: {}", path.display()));

    let mut last = baseline;

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {},
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    debug!(path = %path.display(), "Config watcher stopped");
                    return;
                }
                continue;
            }
        }

        let current = fingerprint(&path).await;
        if current == last {
            continue;
        }

        match current {
            Some(_) => {
                events.info("Config file changed, reloading...");
                // Failures are reported by the reloader, the old generation stays
                let _ = reloader.reload().await;
            }
            None => {
                events.warn(format!(
                    "Config file {} disappeared, keeping current endpoints",
                    path.display()
                ));
            }
        }
        last = current;
    }
}
