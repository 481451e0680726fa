//! Serving a directory of shards
//!
//! - [`watcher`] - Follows a shard directory and reports load/unload events
//! - [`debouncer`] - Coalesces bursts of filesystem events into one rescan
//! - [`loader`] - Opens shard files into a registry; a searcher over a directory

pub mod debouncer;
pub mod loader;
pub mod watcher;

pub use loader::{DirectorySearcher, ShardLoader};
pub use watcher::{DirectoryWatcher, Loader, ShardName, WatcherConfig};
