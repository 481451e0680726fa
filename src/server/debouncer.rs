//! Event debouncer for shard directory events
//!
//! Shard builders write a temporary file and rename it into place, and may
//! replace several shards in a row. Events are collected until the directory
//! has been quiet for the debounce window, then released as one batch that
//! triggers a single rescan.

use crate::server::watcher::WatcherConfig;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// Kind of change observed on a shard file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
}

/// Changes accumulated during one debounce window
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeBatch {
    pub created: Vec<PathBuf>,
    pub modified: Vec<PathBuf>,
    pub deleted: Vec<PathBuf>,
}

impl ChangeBatch {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }

    pub fn total_changes(&self) -> usize {
        self.created.len() + self.modified.len() + self.deleted.len()
    }
}

/// Debouncer that accumulates shard file changes within a time window
pub struct EventDebouncer {
    window: Duration,
    pending: HashMap<PathBuf, ChangeKind>,
    last_event: Option<Instant>,
}

impl EventDebouncer {
    pub fn new(config: &WatcherConfig) -> Self {
        Self {
            window: config.debounce_duration(),
            pending: HashMap::new(),
            last_event: None,
        }
    }

    /// Record an event, folding it into any pending change for the same path
    pub fn add_event(&mut self, path: PathBuf, kind: ChangeKind) {
        self.last_event = Some(Instant::now());

        let merged = match (self.pending.get(&path).copied(), kind) {
            (None, k) => Some(k),
            // Created then written is still a new file
            (Some(ChangeKind::Created), ChangeKind::Modified) => Some(ChangeKind::Created),
            // Created and gone within the window
            (Some(ChangeKind::Created), ChangeKind::Deleted) => None,
            // Replaced in place
            (Some(ChangeKind::Deleted), ChangeKind::Created) => Some(ChangeKind::Modified),
            (Some(_), k) => Some(k),
        };

        match merged {
            Some(k) => {
                self.pending.insert(path, k);
            }
            None => {
                self.pending.remove(&path);
            }
        }
    }

    /// Check if the debounce window has elapsed since the last event
    pub fn is_ready(&self) -> bool {
        self.last_event
            .is_some_and(|last| last.elapsed() >= self.window)
    }

    /// True once any event arrived since the last flush, even if it cancelled out
    pub fn has_pending(&self) -> bool {
        self.last_event.is_some()
    }

    /// Get the time until the next batch is ready (None if no pending events)
    pub fn time_until_ready(&self) -> Option<Duration> {
        self.last_event
            .map(|last| self.window.saturating_sub(last.elapsed()))
    }

    /// Drain pending changes; the batch may be empty when events cancelled out
    pub fn flush(&mut self) -> ChangeBatch {
        let mut batch = ChangeBatch::default();
        for (path, kind) in self.pending.drain() {
            match kind {
                ChangeKind::Created => batch.created.push(path),
                ChangeKind::Modified => batch.modified.push(path),
                ChangeKind::Deleted => batch.deleted.push(path),
            }
        }
        batch.created.sort();
        batch.modified.sort();
        batch.deleted.sort();
        self.last_event = None;
        batch
    }
}
