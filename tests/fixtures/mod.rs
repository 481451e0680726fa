//! Shared searchers and helpers for integration tests

#![allow(dead_code)]

use shardex::SearchError;
use shardex::index::types::*;
use shardex::index::{Searcher, ShardBuilder};
use shardex::query::Q;
use shardex::search::{CancelToken, ShardRegistry};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

/// Returns one file per search for a repository of the given rank
pub struct RankSearcher {
    pub repo: Repository,
    pub score: f64,
    pub delay: Duration,
    pub searches: Arc<AtomicUsize>,
}

impl RankSearcher {
    pub fn new(name: &str, rank: u16) -> Self {
        let mut repo = Repository::new(name);
        repo.rank = rank;
        repo.url = format!("https://example.com/{name}");
        repo.file_url_template = format!("https://example.com/{name}/blob/{{{{.Path}}}}");
        Self {
            repo,
            score: 100.0,
            delay: Duration::ZERO,
            searches: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_score(mut self, score: f64) -> Self {
        self.score = score;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn boxed(self) -> Option<Box<dyn Searcher>> {
        Some(Box::new(self))
    }
}

impl Searcher for RankSearcher {
    fn search(
        &self,
        _ctx: &CancelToken,
        _q: &Q,
        _opts: &SearchOptions,
    ) -> Result<SearchResult, SearchError> {
        self.searches.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }

        let mut result = SearchResult::default();
        result.files.push(FileMatch {
            file_name: format!("{}.rs", self.repo.name),
            repository: self.repo.name.clone(),
            repository_priority: self.repo.priority(),
            line_matches: vec![LineMatch {
                line: "needle".into(),
                line_number: 1,
                fragments: vec![LineFragment {
                    line_offset: 0,
                    offset: 0,
                    match_length: 6,
                }],
                ..Default::default()
            }],
            score: self.score,
            ..Default::default()
        });
        result.stats.file_count = 1;
        result.stats.match_count = 1;
        result.stats.shards_scanned = 1;
        result
            .repo_urls
            .insert(self.repo.name.clone(), self.repo.file_url_template.clone());
        Ok(result)
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
                stats: RepoStats {
                    repos: 1,
                    shards: 1,
                    documents: 1,
                    ..Default::default()
                },
            }],
            stats: RepoStats {
                repos: 1,
                shards: 1,
                documents: 1,
                ..Default::default()
            },
            ..Default::default()
        })
    }

    fn name(&self) -> String {
        format!("rank({})", self.repo.name)
    }
}

/// Fails every search with a contained crash
pub struct CrashSearcher;

impl Searcher for CrashSearcher {
    fn search(
        &self,
        _ctx: &CancelToken,
        _q: &Q,
        _opts: &SearchOptions,
    ) -> Result<SearchResult, SearchError> {
        Err(SearchError::ShardCrashed {
            shard: self.name(),
            reason: "corrupt posting list".into(),
        })
    }

    fn list(
        &self,
        _ctx: &CancelToken,
        _q: &Q,
        _opts: Option<&ListOptions>,
    ) -> Result<RepoList, SearchError> {
        Err(SearchError::ShardCrashed {
            shard: self.name(),
            reason: "corrupt metadata".into(),
        })
    }

    fn name(&self) -> String {
        "crash".into()
    }
}

/// Panics on every call
pub struct PanicSearcher;

impl Searcher for PanicSearcher {
    fn search(
        &self,
        _ctx: &CancelToken,
        _q: &Q,
        _opts: &SearchOptions,
    ) -> Result<SearchResult, SearchError> {
        panic!("index out of bounds");
    }

    fn list(
        &self,
        _ctx: &CancelToken,
        _q: &Q,
        _opts: Option<&ListOptions>,
    ) -> Result<RepoList, SearchError> {
        panic!("index out of bounds");
    }

    fn name(&self) -> String {
        "panic".into()
    }
}

/// Registry holding `shards`, already marked ready
pub fn ready_registry(shards: Vec<(String, Option<Box<dyn Searcher>>)>) -> Arc<ShardRegistry> {
    let registry = Arc::new(ShardRegistry::new());
    registry.replace(shards);
    registry.mark_ready();
    registry
}

/// Registry with one [`RankSearcher`] per rank, keyed `shard-<rank>`
pub fn ranked_registry(ranks: impl IntoIterator<Item = u16>) -> Arc<ShardRegistry> {
    ready_registry(
        ranks
            .into_iter()
            .map(|rank| {
                (
                    format!("shard-{rank}"),
                    RankSearcher::new(&format!("repo-{rank:02}"), rank).boxed(),
                )
            })
            .collect(),
    )
}

/// Write a one-document shard for `repo` into `dir`
pub fn write_shard(dir: &Path, repo: &str, version: u32, content: &str) -> PathBuf {
    let mut builder = ShardBuilder::new(Repository::new(repo));
    builder.add_file("main.rs", content);
    builder.write(dir, version, 0).unwrap()
}

pub fn file_names(result: &SearchResult) -> Vec<String> {
    result.files.iter().map(|f| f.file_name.clone()).collect()
}
