//! File watcher for hot reload.
//!
//! Watches the running executable and any configured paths; every
//! modification is forwarded to the supervisor as a reload request.

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::event::ModifyKind;
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

/// A watcher that monitors files whose change should trigger a reload.
pub struct ReloadWatcher {
    paths: Vec<PathBuf>,
    change_tx: mpsc::UnboundedSender<PathBuf>,
}

impl ReloadWatcher {
    /// Create a new ReloadWatcher.
    ///
    /// Returns the watcher and a receiver of changed paths.
    pub fn new(paths: Vec<PathBuf>) -> (Self, mpsc::UnboundedReceiver<PathBuf>) {
        let (change_tx, change_rx) = mpsc::unbounded_channel();

        (Self { paths, change_tx }, change_rx)
    }

    /// Start watching in a background thread.
    ///
    /// The returned watcher must be kept alive for events to keep flowing.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let tx = self.change_tx.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if is_content_change(&event.kind) {
                        for path in event.paths {
                            tracing::debug!(path = ?path, "Watched file changed");
                            let _ = tx.send(path);
                        }
                    }
                }
                Err(e) => tracing::error!("Watch error: {:?}", e),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        for path in &self.paths {
            watch_path(&mut watcher, path)?;
        }

        tracing::info!(paths = ?self.paths, "Reload watcher started");
        Ok(watcher)
    }
}

/// Metadata-only events (atime, permissions) do not count.
fn is_content_change(kind: &EventKind) -> bool {
    match kind {
        EventKind::Modify(ModifyKind::Metadata(_)) => false,
        kind => kind.is_modify() || kind.is_create() || kind.is_remove(),
    }
}

fn watch_path(watcher: &mut RecommendedWatcher, path: &Path) -> Result<(), notify::Error> {
    watcher.watch(path, RecursiveMode::NonRecursive)
}

/// Wait for the next change and swallow the burst that follows it.
///
/// Rebuilding a binary produces several events in quick succession; they
/// collapse into a single reload. Returns `None` once the watcher is gone.
pub async fn next_change(
    changes: &mut mpsc::UnboundedReceiver<PathBuf>,
    debounce: Duration,
) -> Option<PathBuf> {
    let first = changes.recv().await?;
    tokio::time::sleep(debounce).await;
    while changes.try_recv().is_ok() {}
    Some(first)
}
