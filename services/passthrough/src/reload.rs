//! Routes file reload loop.
//!
//! Polls the routes file and swaps a freshly built table into the shared
//! snapshot whenever the file changes. A file that goes missing or fails to
//! load is reported once per change and the last applied table stays live.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::Result;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::proxy::{BackendTarget, RoutingTable, SharedRoutingTable};
use crate::routes_file::RoutesFile;

/// What a file looked like the last time it was checked.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Seen {
    Never,
    Missing,
    Present {
        modified: Option<SystemTime>,
        len: u64,
    },
}

/// Result of a single poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// File unchanged since the last poll.
    Unchanged,
    /// New table applied.
    Reloaded { target_count: usize },
    /// File changed but could not be applied; the previous table is kept.
    Failed,
}

/// Watches one routes file and applies it to a shared table.
pub struct RoutesWatcher {
    path: PathBuf,
    table: Arc<SharedRoutingTable>,
    fallback_default: Option<BackendTarget>,
    seen: Seen,
}

impl RoutesWatcher {
    pub fn new(path: impl Into<PathBuf>, table: Arc<SharedRoutingTable>) -> Self {
        Self {
            path: path.into(),
            table,
            fallback_default: None,
            seen: Seen::Never,
        }
    }

    /// Default target used when the file does not name one.
    pub fn with_fallback_default(mut self, default: Option<BackendTarget>) -> Self {
        self.fallback_default = default;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the file and apply it, failing if it cannot be read.
    ///
    /// Used at startup, where running without routes is a configuration
    /// error rather than something to wait out.
    pub fn load_initial(&mut self) -> Result<usize> {
        self.seen = self.observe();
        let file = RoutesFile::load(&self.path)?;
        Ok(self.apply(file))
    }

    /// Check the file once and reload it if it changed.
    pub fn poll(&mut self) -> ReloadOutcome {
        let current = self.observe();
        if current == self.seen {
            return ReloadOutcome::Unchanged;
        }
        self.seen = current;

        if self.seen == Seen::Missing {
            warn!(
                path = %self.path.display(),
                "Routes file unavailable, keeping last applied table"
            );
            return ReloadOutcome::Failed;
        }

        match RoutesFile::load(&self.path) {
            Ok(file) => ReloadOutcome::Reloaded {
                target_count: self.apply(file),
            },
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    error = ?e,
                    "Failed to reload routes file, keeping last applied table"
                );
                ReloadOutcome::Failed
            }
        }
    }

    fn observe(&self) -> Seen {
        match fs::metadata(&self.path) {
            Ok(meta) => Seen::Present {
                modified: meta.modified().ok(),
                len: meta.len(),
            },
            Err(_) => Seen::Missing,
        }
    }

    fn apply(&self, file: RoutesFile) -> usize {
        let target_count = file.targets.len();
        let default = file.default.or_else(|| self.fallback_default.clone());
        self.table.store(RoutingTable::new(file.targets, default));
        target_count
    }
}

/// Poll the routes file forever, applying changes to `table`.
pub async fn run_reload_loop(
    path: PathBuf,
    interval: Duration,
    table: Arc<SharedRoutingTable>,
    fallback_default: Option<BackendTarget>,
) {
    let mut watcher = RoutesWatcher::new(path, table).with_fallback_default(fallback_default);
    run_watcher(&mut watcher, interval).await
}

/// Drive an existing watcher, keeping what it has already seen.
pub async fn run_watcher(watcher: &mut RoutesWatcher, interval: Duration) {
    info!(
        path = %watcher.path().display(),
        interval_ms = interval.as_millis() as u64,
        "Watching routes file"
    );

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if let ReloadOutcome::Reloaded { target_count } = watcher.poll() {
            debug!(target_count, "Routes file reloaded");
        }
    }
}
