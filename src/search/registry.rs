//! Registry of loaded shards
//!
//! Readers take an immutable [`Snapshot`] with a pointer copy. Writers build
//! the next snapshot outside the read lock and publish it with a single swap,
//! so queries in flight keep searching the shard set they started with. A
//! shard is closed when the last snapshot referencing it is dropped.

use crate::index::searcher::Searcher;
use crate::index::types::Repository;
use crate::query::Q;
use crate::search::cancel::CancelToken;
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tracing::{debug, warn};

/// A loaded shard with its ranking metadata
pub struct RankedShard {
    pub key: String,
    pub searcher: Box<dyn Searcher>,
    /// Highest priority among the shard's repositories
    pub priority: f64,
    pub repos: Vec<Repository>,
    /// Insertion order, used to break priority ties
    seq: u64,
}

impl RankedShard {
    pub fn seq(&self) -> u64 {
        self.seq
    }
}

impl Drop for RankedShard {
    fn drop(&mut self) {
        debug!(shard = %self.key, "closing shard");
        self.searcher.close();
    }
}

impl std::fmt::Debug for RankedShard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RankedShard")
            .field("key", &self.key)
            .field("priority", &self.priority)
            .field("seq", &self.seq)
            .finish()
    }
}

/// Immutable view of the active shards, best priority first
#[derive(Debug, Default)]
pub struct Snapshot {
    pub shards: Vec<Arc<RankedShard>>,
    /// False until the initial load completed
    pub ready: bool,
}

impl Snapshot {
    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }
}

#[derive(Default)]
struct RegistryState {
    shards: HashMap<String, Arc<RankedShard>>,
    next_seq: u64,
    ready: bool,
}

impl RegistryState {
    fn build_snapshot(&self) -> Snapshot {
        let mut shards: Vec<Arc<RankedShard>> = self.shards.values().cloned().collect();
        shards.sort_by(|a, b| {
            b.priority
                .total_cmp(&a.priority)
                .then_with(|| a.seq.cmp(&b.seq))
        });
        Snapshot {
            shards,
            ready: self.ready,
        }
    }
}

#[derive(Default)]
pub struct ShardRegistry {
    current: RwLock<Arc<Snapshot>>,
    /// Serializes writers
    state: Mutex<RegistryState>,
}

impl ShardRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current snapshot; never waits for a replace beyond the pointer swap
    pub fn snapshot(&self) -> Arc<Snapshot> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Insert, overwrite (`Some`) or remove (`None`) shards by key and
    /// publish the resulting snapshot
    pub fn replace<I>(&self, batch: I)
    where
        I: IntoIterator<Item = (String, Option<Box<dyn Searcher>>)>,
    {
        // Ranking calls into the shard, keep it outside the writer lock
        let ranked: Vec<(String, Option<(Box<dyn Searcher>, f64, Vec<Repository>)>)> = batch
            .into_iter()
            .map(|(key, searcher)| {
                let entry = searcher.map(|s| {
                    let (priority, repos) = rank(&key, s.as_ref());
                    (s, priority, repos)
                });
                (key, entry)
            })
            .collect();

        let mut retired = Vec::new();
        {
            let mut state = self.lock_state();
            for (key, entry) in ranked {
                let old = match entry {
                    Some((searcher, priority, repos)) => {
                        let seq = state.next_seq;
                        state.next_seq += 1;
                        let shard = Arc::new(RankedShard {
                            key: key.clone(),
                            searcher,
                            priority,
                            repos,
                            seq,
                        });
                        state.shards.insert(key, shard)
                    }
                    None => state.shards.remove(&key),
                };
                retired.extend(old);
            }
            self.publish(&state);
        }
        // Dropped outside the locks; closes shards no snapshot references
        drop(retired);
    }

    /// Flip the registry to ready; later calls are no-ops
    pub fn mark_ready(&self) {
        let mut state = self.lock_state();
        if state.ready {
            return;
        }
        state.ready = true;
        self.publish(&state);
        debug!(shards = state.shards.len(), "shard registry ready");
    }

    pub fn is_ready(&self) -> bool {
        self.snapshot().ready
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    /// Drop every shard
    pub fn clear(&self) {
        let keys: Vec<String> = self.lock_state().shards.keys().cloned().collect();
        self.replace(keys.into_iter().map(|k| (k, None)));
    }

    fn publish(&self, state: &RegistryState) {
        let next = Arc::new(state.build_snapshot());
        let previous = {
            let mut guard = match self.current.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            std::mem::replace(&mut *guard, next)
        };
        drop(previous);
    }

    fn lock_state(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Priority and repositories of a shard, from a match-all listing. A shard
/// that fails or panics here still loads, unranked.
fn rank(key: &str, searcher: &dyn Searcher) -> (f64, Vec<Repository>) {
    let listed = catch_unwind(AssertUnwindSafe(|| {
        searcher.list(&CancelToken::new(), &Q::Const(true), None)
    }));
    let Ok(listed) = listed else {
        warn!(shard = %key, "shard panicked while listing repositories");
        return (0.0, Vec::new());
    };
    match listed {
        Ok(list) => {
            let repos: Vec<Repository> = list.repos.into_iter().map(|e| e.repository).collect();
            let priority = repos
                .iter()
                .map(Repository::priority)
                .fold(None, |acc: Option<f64>, p| Some(acc.map_or(p, |a| a.max(p))))
                .unwrap_or(0.0);
            (priority, repos)
        }
        Err(e) => {
            warn!(shard = %key, error = %e, "failed to list shard repositories");
            (0.0, Vec::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SearchError;
    use crate::index::types::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeShard {
        repo: Repository,
        closed: Arc<AtomicUsize>,
    }

    impl FakeShard {
        fn new(name: &str, priority: &str, closed: &Arc<AtomicUsize>) -> Box<dyn Searcher> {
            let mut repo = Repository::new(name);
            repo.raw_config.insert(RAW_PRIORITY.into(), priority.into());
            Box::new(FakeShard {
                repo,
                closed: Arc::clone(closed),
            })
        }
    }

    impl Searcher for FakeShard {
        fn search(
            &self,
            _ctx: &CancelToken,
            _q: &Q,
            _opts: &SearchOptions,
        ) -> Result<SearchResult, SearchError> {
            Ok(SearchResult::default())
        }

        fn list(
            &self,
            _ctx: &CancelToken,
            _q: &Q,
            _opts: Option<&ListOptions>,
        ) -> Result<RepoList, SearchError> {
            Ok(RepoList {
                repos: vec![RepoListEntry {
                    repository: self.repo.clone(),
                    stats: RepoStats::default(),
                }],
                ..Default::default()
            })
        }

        fn close(&self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }

        fn name(&self) -> String {
            self.repo.name.clone()
        }
    }

    struct PanickingShard;

    impl Searcher for PanickingShard {
        fn search(
            &self,
            _ctx: &CancelToken,
            _q: &Q,
            _opts: &SearchOptions,
        ) -> Result<SearchResult, SearchError> {
            Ok(SearchResult::default())
        }

        fn list(
            &self,
            _ctx: &CancelToken,
            _q: &Q,
            _opts: Option<&ListOptions>,
        ) -> Result<RepoList, SearchError> {
            panic!("list exploded")
        }

        fn name(&self) -> String {
            "panicking".to_string()
        }
    }

    fn names(snapshot: &Snapshot) -> Vec<String> {
        snapshot.shards.iter().map(|s| s.searcher.name()).collect()
    }

    #[test]
    fn test_snapshot_ordered_by_priority_then_insertion() {
        let closed = Arc::new(AtomicUsize::new(0));
        let registry = ShardRegistry::new();
        registry.replace(vec![
            ("a".to_string(), Some(FakeShard::new("weekend-project", "20", &closed))),
            ("b".to_string(), Some(FakeShard::new("super-star", "5000", &closed))),
            ("c".to_string(), Some(FakeShard::new("weekend-project-2", "20", &closed))),
            ("d".to_string(), Some(FakeShard::new("moderately-popular", "500", &closed))),
        ]);

        let snapshot = registry.snapshot();
        assert_eq!(
            names(&snapshot),
            vec![
                "super-star",
                "moderately-popular",
                "weekend-project",
                "weekend-project-2"
            ]
        );
        assert_eq!(snapshot.shards[0].priority, 5000.0);
    }

    #[test]
    fn test_replace_and_remove() {
        let closed = Arc::new(AtomicUsize::new(0));
        let registry = ShardRegistry::new();
        registry.replace(vec![("a".to_string(), Some(FakeShard::new("one", "1", &closed)))]);
        registry.replace(vec![("a".to_string(), Some(FakeShard::new("two", "2", &closed)))]);

        assert_eq!(names(&registry.snapshot()), vec!["two"]);
        assert_eq!(closed.load(Ordering::SeqCst), 1);

        registry.replace(vec![("a".to_string(), None)]);
        assert!(registry.is_empty());
        assert_eq!(closed.load(Ordering::SeqCst), 2);

        // Removing an unknown key is harmless
        registry.replace(vec![("missing".to_string(), None)]);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_close_deferred_until_snapshot_dropped() {
        let closed = Arc::new(AtomicUsize::new(0));
        let registry = ShardRegistry::new();
        registry.replace(vec![("a".to_string(), Some(FakeShard::new("one", "1", &closed)))]);

        let held = registry.snapshot();
        registry.replace(vec![("a".to_string(), None)]);
        assert_eq!(closed.load(Ordering::SeqCst), 0);
        assert_eq!(held.len(), 1);

        drop(held);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_list_loads_unranked() {
        let closed = Arc::new(AtomicUsize::new(0));
        let registry = ShardRegistry::new();
        registry.replace(vec![
            ("bad".to_string(), Some(Box::new(PanickingShard) as Box<dyn Searcher>)),
            ("good".to_string(), Some(FakeShard::new("good", "10", &closed))),
        ]);

        let snapshot = registry.snapshot();
        assert_eq!(names(&snapshot), vec!["good", "panicking"]);
        assert_eq!(snapshot.shards[1].priority, 0.0);
        assert!(snapshot.shards[1].repos.is_empty());
    }

    #[test]
    fn test_mark_ready_is_one_way() {
        let registry = ShardRegistry::new();
        assert!(!registry.is_ready());
        registry.mark_ready();
        registry.mark_ready();
        assert!(registry.is_ready());

        registry.clear();
        assert!(registry.is_ready());
    }

    #[test]
    fn test_clear_closes_everything() {
        let closed = Arc::new(AtomicUsize::new(0));
        let registry = ShardRegistry::new();
        registry.replace((0..5).map(|i| {
            (
                format!("k{i}"),
                Some(FakeShard::new(&format!("r{i}"), "1", &closed)),
            )
        }));
        assert_eq!(registry.len(), 5);
        registry.clear();
        assert!(registry.is_empty());
        assert_eq!(closed.load(Ordering::SeqCst), 5);
    }
}
