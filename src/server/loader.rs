//! Glue between the directory watcher and the shard registry

use crate::error::SearchError;
use crate::index::reader::ShardReader;
use crate::index::searcher::{Searcher, Sender};
use crate::index::types::{ListOptions, RepoList, RepoStats, SearchOptions, SearchResult};
use crate::query::Q;
use crate::search::{CancelToken, SearchConfig, ShardRegistry, ShardedSearcher};
use crate::server::watcher::{DirectoryWatcher, Loader, WatcherConfig};
use anyhow::Result;
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

/// Opens shard files and publishes them to a registry
pub struct ShardLoader {
    registry: Arc<ShardRegistry>,
}

impl ShardLoader {
    pub fn new(registry: Arc<ShardRegistry>) -> Self {
        Self { registry }
    }
}

impl Loader for ShardLoader {
    fn load(&self, keys: &[String]) {
        let opened: Vec<(String, Option<Box<dyn Searcher>>)> = keys
            .par_iter()
            .map(|key| match ShardReader::open(Path::new(key)) {
                Ok(reader) => (key.clone(), Some(Box::new(reader) as Box<dyn Searcher>)),
                Err(e) => {
                    // A stale copy under the same key must not outlive a broken rewrite
                    warn!(shard = %key, error = %e, "failed to open shard");
                    (key.clone(), None)
                }
            })
            .collect();

        self.registry.replace(opened);
    }

    fn unload(&self, keys: &[String]) {
        self.registry
            .replace(keys.iter().map(|key| (key.clone(), None)));
    }
}

/// A searcher over a watched directory of shard files
pub struct DirectorySearcher {
    dir: PathBuf,
    searcher: ShardedSearcher,
    watcher: Mutex<Option<DirectoryWatcher>>,
}

impl DirectorySearcher {
    /// Load every shard in `dir` before returning, then follow changes
    pub fn open(dir: &Path, search: &SearchConfig, watch: WatcherConfig) -> Result<Self> {
        let registry = Arc::new(ShardRegistry::new());
        let loader = Arc::new(ShardLoader::new(Arc::clone(&registry)));
        let watcher = DirectoryWatcher::new(dir, loader, watch)?;
        registry.mark_ready();
        info!(dir = %dir.display(), shards = registry.len(), "shard directory loaded");

        Ok(Self::assemble(dir, registry, search, watcher))
    }

    /// Return immediately and load shards in the background. Until the
    /// initial scan completes, results carry a crash to flag them incomplete.
    pub fn open_fast(dir: &Path, search: &SearchConfig, watch: WatcherConfig) -> Result<Self> {
        let registry = Arc::new(ShardRegistry::new());
        let loader = Arc::new(ShardLoader::new(Arc::clone(&registry)));
        let ready = Arc::clone(&registry);
        let watcher = DirectoryWatcher::new_background(dir, loader, watch, move || {
            ready.mark_ready();
        })?;

        Ok(Self::assemble(dir, registry, search, watcher))
    }

    fn assemble(
        dir: &Path,
        registry: Arc<ShardRegistry>,
        search: &SearchConfig,
        watcher: DirectoryWatcher,
    ) -> Self {
        Self {
            dir: dir.to_path_buf(),
            searcher: ShardedSearcher::with_config(registry, search),
            watcher: Mutex::new(Some(watcher)),
        }
    }

    pub fn registry(&self) -> &Arc<ShardRegistry> {
        self.searcher.registry()
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl Searcher for DirectorySearcher {
    fn search(
        &self,
        ctx: &CancelToken,
        q: &Q,
        opts: &SearchOptions,
    ) -> Result<SearchResult, SearchError> {
        self.searcher.search(ctx, q, opts)
    }

    fn stream_search(
        &self,
        ctx: &CancelToken,
        q: &Q,
        opts: &SearchOptions,
        sender: &dyn Sender,
    ) -> Result<(), SearchError> {
        self.searcher.stream_search(ctx, q, opts, sender)
    }

    fn list(
        &self,
        ctx: &CancelToken,
        q: &Q,
        opts: Option<&ListOptions>,
    ) -> Result<RepoList, SearchError> {
        self.searcher.list(ctx, q, opts)
    }

    fn stats(&self) -> Result<RepoStats, SearchError> {
        self.searcher.stats()
    }

    /// Stop watching before dropping the shards so no load races the clear
    fn close(&self) {
        let watcher = self
            .watcher
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(mut watcher) = watcher {
            watcher.stop();
        }
        self.searcher.close();
    }

    fn name(&self) -> String {
        format!("directory({})", self.dir.display())
    }
}

impl Drop for DirectorySearcher {
    fn drop(&mut self) {
        self.close();
    }
}
