//! Trigger file watching
//!
//! Reloads the trigger list when its file changes on disk. The parent
//! directory is watched rather than the file, since editors and config
//! managers often replace the file with a rename.

use super::responder::AutoResponder;
use crate::config;
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Quiet period after the first event before reloading. A single save
/// usually produces several events.
const SETTLE: Duration = Duration::from_millis(250);

/// Watches one trigger file and swaps the responder's list on change
pub struct TriggerWatcher {
    path: PathBuf,
    events: mpsc::Receiver<Event>,
    // Dropping the watcher stops event delivery
    _watcher: RecommendedWatcher,
}

impl std::fmt::Debug for TriggerWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriggerWatcher")
            .field("path", &self.path)
            .finish()
    }
}

impl TriggerWatcher {
    /// Start watching `path`. Events are buffered until [`run`](Self::run).
    pub fn new(path: impl Into<PathBuf>) -> notify::Result<Self> {
        let path = path.into();
        let (tx, events) = mpsc::channel(100);

        let mut watcher = RecommendedWatcher::new(
            move |res: std::result::Result<Event, notify::Error>| match res {
                Ok(event) => {
                    let _ = tx.blocking_send(event);
                }
                Err(e) => warn!(error = %e, "trigger file watch error"),
            },
            Config::default(),
        )?;
        watcher.watch(watch_dir(&path), RecursiveMode::NonRecursive)?;

        Ok(Self {
            path,
            events,
            _watcher: watcher,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether an event touches the trigger file
    fn concerns(&self, event: &Event) -> bool {
        matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_))
            && event
                .paths
                .iter()
                .any(|p| p.file_name() == self.path.file_name())
    }

    /// Reload on every change until `shutdown` flips or the watcher dies.
    pub async fn run(mut self, responder: Arc<AutoResponder>, mut shutdown: watch::Receiver<bool>) {
        info!(path = %self.path.display(), "watching trigger file");
        loop {
            let event = tokio::select! {
                _ = shutdown.changed() => break,
                event = self.events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            if !self.concerns(&event) {
                continue;
            }
            debug!(kind = ?event.kind, "trigger file changed");

            tokio::select! {
                _ = tokio::time::sleep(SETTLE) => {}
                _ = shutdown.changed() => break,
            }
            while self.events.try_recv().is_ok() {}

            self.reload(&responder);
        }
        debug!(path = %self.path.display(), "trigger watcher stopped");
    }

    fn reload(&self, responder: &AutoResponder) {
        match config::load_triggers(&self.path) {
            Ok(definitions) => {
                let set = responder.reload(definitions);
                info!(
                    path = %self.path.display(),
                    active = set.len(),
                    rejected = set.rejected().len(),
                    "triggers reloaded"
                );
            }
            Err(e) => warn!(error = %e, "trigger reload failed, keeping previous list"),
        }
    }
}

fn watch_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}
