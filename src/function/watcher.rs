//! Source watcher for hot reload.
//!
//! Polls a fingerprint of the function folder: its directories plus path,
//! size and modification time of every file inside each function directory.
//! A change is reported once the folder has been left alone for the debounce
//! window, so an editor saving several files triggers a single reload.

use crate::function::registry::EXCLUDED_DIRS;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info};

const MAX_DEPTH: usize = 16;

/// Snapshot of the watched tree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fingerprint {
    entries: BTreeMap<PathBuf, (u64, Option<SystemTime>)>,
}

impl Fingerprint {
    /// Fingerprint `folder`. Unreadable entries are left out.
    pub fn take(folder: &Path) -> Self {
        let mut fingerprint = Self::default();
        let Ok(entries) = std::fs::read_dir(folder) else {
            return fingerprint;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            // Loose files in the root belong to no function.
            if !meta.is_dir() {
                continue;
            }
            let relative = PathBuf::from(entry.file_name());
            fingerprint.entries.insert(relative.clone(), (0, None));
            if !is_ignored(&relative) {
                fingerprint.walk(&path, &relative, 0);
            }
        }
        fingerprint
    }

    fn walk(&mut self, dir: &Path, relative: &Path, depth: usize) {
        if depth >= MAX_DEPTH {
            return;
        }
        let Ok(entries) = std::fs::read_dir(dir) else {
            return;
        };
        for entry in entries.flatten() {
            let name = PathBuf::from(entry.file_name());
            if is_ignored(&name) {
                continue;
            }
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            let child = relative.join(&name);
            if meta.is_dir() {
                self.walk(&entry.path(), &child, depth + 1);
            } else {
                self.entries.insert(child, (meta.len(), meta.modified().ok()));
            }
        }
    }

    /// Number of tracked entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn is_ignored(name: &Path) -> bool {
    let name = name.to_string_lossy();
    name.starts_with('.') || EXCLUDED_DIRS.contains(&&*name)
}

async fn fingerprint(folder: &Path) -> Fingerprint {
    let folder = folder.to_path_buf();
    tokio::task::spawn_blocking(move || Fingerprint::take(&folder))
        .await
        .unwrap_or_default()
}

/// Polling watcher over one function folder.
pub struct SourceWatcher {
    folder: PathBuf,
    poll_interval: Duration,
    debounce: Duration,
    last: Fingerprint,
}

impl SourceWatcher {
    /// Start watching from the folder's current state.
    pub async fn new(folder: impl Into<PathBuf>, poll_interval: Duration, debounce: Duration) -> Self {
        let folder = folder.into();
        let last = fingerprint(&folder).await;
        debug!(folder = %folder.display(), entries = last.len(), "Watching function folder");
        Self {
            folder,
            poll_interval,
            debounce,
            last,
        }
    }

    /// Resolve on the next settled change to the folder.
    pub async fn changed(&mut self) {
        loop {
            tokio::time::sleep(self.poll_interval).await;
            let current = fingerprint(&self.folder).await;
            if current == self.last {
                continue;
            }

            info!(folder = %self.folder.display(), "Change to function detected, reloading...");
            tokio::time::sleep(self.debounce).await;
            self.last = fingerprint(&self.folder).await;
            return;
        }
    }
}
