//! Multi-shard search: registry of loaded shards, parallel fan-out, merging
//! and ranking of results.

pub mod cancel;
pub mod priority;
pub mod registry;
pub mod repo_filter;
pub mod sharded;
pub mod stream;

pub use cancel::CancelToken;
pub use priority::PrioritySet;
pub use registry::{RankedShard, ShardRegistry, Snapshot};
pub use sharded::ShardedSearcher;

use crate::index::types::SearchOptions;
use crate::utils::app_data::{ConfigFile, env_override, num_cpus};
use std::time::Duration;

/// Default streaming flush window in milliseconds
pub const DEFAULT_FLUSH_WALL_MS: u64 = 0;

/// Configuration for query execution
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchConfig {
    /// Worker threads per query (0 = number of CPUs)
    pub workers: usize,
    pub flush_wall_ms: u64,
    /// 0 disables the deadline
    pub max_wall_ms: u64,
}

impl SearchConfig {
    /// Resolve 0 workers to the CPU count
    pub fn effective_workers(&self) -> usize {
        if self.workers == 0 {
            num_cpus()
        } else {
            self.workers
        }
    }

    /// Load config with priority: environment variables > config file > defaults
    pub fn load() -> Self {
        let mut config = Self::default();
        if let Some(file) = ConfigFile::load() {
            config.apply_file(&file);
        }
        config.apply_env();
        config
    }

    pub fn apply_file(&mut self, file: &ConfigFile) {
        if let Some(v) = file.search.workers {
            self.workers = v;
        }
        if let Some(v) = file.search.flush_wall_ms {
            self.flush_wall_ms = v;
        }
        if let Some(v) = file.search.max_wall_ms {
            self.max_wall_ms = v;
        }
    }

    fn apply_env(&mut self) {
        if let Some(v) = env_override("SHARDEX_WORKERS") {
            self.workers = v;
        }
        if let Some(v) = env_override("SHARDEX_FLUSH_WALL_MS") {
            self.flush_wall_ms = v;
        }
        if let Some(v) = env_override("SHARDEX_MAX_WALL_MS") {
            self.max_wall_ms = v;
        }
    }

    /// Search options seeded with the configured time limits
    pub fn search_options(&self) -> SearchOptions {
        SearchOptions {
            flush_wall_time: Duration::from_millis(self.flush_wall_ms),
            max_wall_time: Duration::from_millis(self.max_wall_ms),
            ..Default::default()
        }
    }
}
