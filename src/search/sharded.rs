//! Fan a query out over every shard of a registry snapshot and merge the
//! results into one ranked answer.
//!
//! Each shard runs on a scoped worker thread. A shard that panics or reports
//! [`SearchError::ShardCrashed`] is counted in `Stats::crashes` and
//! contributes nothing; any other shard error fails the whole query.

use crate::error::SearchError;
use crate::index::searcher::{Searcher, Sender};
use crate::index::types::*;
use crate::query::Q;
use crate::search::SearchConfig;
use crate::search::cancel::CancelToken;
use crate::search::priority::PrioritySet;
use crate::search::registry::{RankedShard, ShardRegistry};
use crate::search::repo_filter::select_repo_set;
use crate::search::stream::{FlushCollector, send_by_repository, sort_files};
use std::any::Any;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// How often the streaming loop wakes up to check the flush deadline
const FLUSH_TICK: Duration = Duration::from_millis(5);

/// What happened to one shard
enum ShardOutcome<T> {
    Done(T),
    Crashed(String),
    Failed(SearchError),
    /// Not started because the query was cancelled
    Skipped,
}

struct ShardReport<T> {
    index: usize,
    key: String,
    priority: f64,
    /// Time between dispatch and the shard starting
    wait: Duration,
    outcome: ShardOutcome<T>,
}

enum FanOutEvent<T> {
    Report(ShardReport<T>),
    Tick,
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}

/// Searcher over all shards of a [`ShardRegistry`]
pub struct ShardedSearcher {
    registry: Arc<ShardRegistry>,
    workers: usize,
}

impl ShardedSearcher {
    pub fn new(registry: Arc<ShardRegistry>) -> Self {
        Self::with_config(registry, &SearchConfig::default())
    }

    pub fn with_config(registry: Arc<ShardRegistry>, config: &SearchConfig) -> Self {
        Self {
            registry,
            workers: config.effective_workers(),
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn registry(&self) -> &Arc<ShardRegistry> {
        &self.registry
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Run `run` on every shard with at most `self.workers` threads, in
    /// slice order, and hand each outcome to `handle` on the calling thread.
    fn fan_out<T, F, H>(
        &self,
        shards: &[Arc<RankedShard>],
        ctx: &CancelToken,
        tick: Option<Duration>,
        run: F,
        mut handle: H,
    ) where
        T: Send,
        F: Fn(&RankedShard) -> Result<T, SearchError> + Sync,
        H: FnMut(FanOutEvent<T>),
    {
        if shards.is_empty() {
            return;
        }

        let next = AtomicUsize::new(0);
        let started = Instant::now();
        let workers = self.workers.clamp(1, shards.len());
        let (tx, rx) = mpsc::channel::<ShardReport<T>>();

        thread::scope(|s| {
            for _ in 0..workers {
                let tx = tx.clone();
                let next = &next;
                let run = &run;
                s.spawn(move || {
                    loop {
                        let index = next.fetch_add(1, Ordering::SeqCst);
                        let Some(shard) = shards.get(index) else {
                            break;
                        };
                        let wait = started.elapsed();

                        let outcome = if ctx.is_cancelled() {
                            ShardOutcome::Skipped
                        } else {
                            match catch_unwind(AssertUnwindSafe(|| run(shard))) {
                                Ok(Ok(value)) => ShardOutcome::Done(value),
                                Ok(Err(e)) if e.is_crash() => ShardOutcome::Crashed(e.to_string()),
                                Ok(Err(e)) => ShardOutcome::Failed(e),
                                Err(payload) => ShardOutcome::Crashed(panic_message(payload.as_ref())),
                            }
                        };

                        let report = ShardReport {
                            index,
                            key: shard.key.clone(),
                            priority: shard.priority,
                            wait,
                            outcome,
                        };
                        if tx.send(report).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(tx);

            loop {
                let report = match tick {
                    Some(interval) => match rx.recv_timeout(interval) {
                        Ok(report) => report,
                        Err(RecvTimeoutError::Timeout) => {
                            handle(FanOutEvent::Tick);
                            continue;
                        }
                        Err(RecvTimeoutError::Disconnected) => break,
                    },
                    None => match rx.recv() {
                        Ok(report) => report,
                        Err(_) => break,
                    },
                };
                handle(FanOutEvent::Report(report));
            }
        });
    }

    /// Validate inputs and prepare the shard list for a query
    fn prepare(
        &self,
        ctx: &CancelToken,
        q: &Q,
        opts: &SearchOptions,
    ) -> Result<QueryPlan, SearchError> {
        q.validate()?;
        opts.validate()?;

        let snapshot = self.registry.snapshot();
        let mut stats = Stats::default();
        if !snapshot.ready {
            stats.crashes += 1;
        }

        let (shards, filtered) = select_repo_set(&snapshot.shards, q);
        stats.shards_skipped_filter += filtered;

        let pending = PrioritySet::new();
        for shard in &shards {
            pending.insert(shard.priority);
        }

        let deadline = (!opts.max_wall_time.is_zero()).then(|| Instant::now() + opts.max_wall_time);

        Ok(QueryPlan {
            shards,
            stats,
            pending,
            ctx: ctx.child(deadline),
            started: Instant::now(),
        })
    }
}

struct QueryPlan {
    shards: Vec<Arc<RankedShard>>,
    /// Stats accounted before dispatch
    stats: Stats,
    pending: PrioritySet,
    /// Cancelled on error, cutoff or deadline
    ctx: CancelToken,
    started: Instant,
}

impl QueryPlan {
    /// Cancel the remaining shards once enough matches were found and the
    /// shard that just finished outranks everything still pending
    fn check_cutoff(&self, opts: &SearchOptions, match_count: usize, priority: f64) {
        if opts.total_max_match_count > 0
            && match_count >= opts.total_max_match_count
            && priority > self.pending.max()
        {
            debug!(match_count, "match limit reached, cancelling remaining shards");
            self.ctx.cancel();
        }
    }
}

impl Searcher for ShardedSearcher {
    fn search(
        &self,
        ctx: &CancelToken,
        q: &Q,
        opts: &SearchOptions,
    ) -> Result<SearchResult, SearchError> {
        let plan = self.prepare(ctx, q, opts)?;
        let mut aggregate = SearchResult {
            stats: plan.stats.clone(),
            ..Default::default()
        };
        let mut per_shard: Vec<Option<SearchResult>> = (0..plan.shards.len()).map(|_| None).collect();
        let mut failure: Option<SearchError> = None;

        self.fan_out(
            &plan.shards,
            &plan.ctx,
            None,
            |shard| shard.searcher.search(&plan.ctx, q, opts),
            |event| {
                let FanOutEvent::Report(report) = event else {
                    return;
                };
                plan.pending.remove(report.priority);
                aggregate.stats.wait += report.wait;

                match report.outcome {
                    ShardOutcome::Done(result) => {
                        aggregate.stats.add(&result.stats);
                        plan.check_cutoff(opts, aggregate.stats.match_count, report.priority);
                        per_shard[report.index] = Some(result);
                    }
                    ShardOutcome::Crashed(reason) => {
                        warn!(shard = %report.key, %reason, "shard crashed during search");
                        aggregate.stats.crashes += 1;
                    }
                    ShardOutcome::Failed(e) => {
                        if failure.is_none() {
                            failure = Some(e);
                            plan.ctx.cancel();
                        }
                    }
                    ShardOutcome::Skipped => aggregate.stats.shards_skipped += 1,
                }
            },
        );

        if let Some(e) = failure {
            return Err(e);
        }

        for result in per_shard.into_iter().flatten() {
            aggregate.files.extend(result.files);
            aggregate.repo_urls.extend(result.repo_urls);
        }
        sort_files(&mut aggregate.files);
        if opts.max_doc_display_count > 0 {
            aggregate.files.truncate(opts.max_doc_display_count);
        }
        aggregate.stats.duration = plan.started.elapsed();

        debug!(
            shards = plan.shards.len(),
            files = aggregate.files.len(),
            crashes = aggregate.stats.crashes,
            skipped = aggregate.stats.shards_skipped,
            duration_ms = aggregate.stats.duration.as_millis() as u64,
            "search finished"
        );
        Ok(aggregate)
    }

    fn stream_search(
        &self,
        ctx: &CancelToken,
        q: &Q,
        opts: &SearchOptions,
        sender: &dyn Sender,
    ) -> Result<(), SearchError> {
        let plan = self.prepare(ctx, q, opts)?;

        sender.send(SearchResult {
            stats: plan.stats.clone(),
            progress: Progress {
                priority: f64::NEG_INFINITY,
                max_pending_priority: plan.pending.max(),
            },
            ..Default::default()
        });

        let ranked = opts.ranked_streaming();
        let flush_deadline = plan.started + opts.flush_wall_time;
        let mut collector = FlushCollector::new(sender, opts.max_doc_display_count);
        let mut match_count = 0;
        // Counters of shards that produced no result event
        let mut leftover = Stats::default();
        let mut failure: Option<SearchError> = None;

        self.fan_out(
            &plan.shards,
            &plan.ctx,
            ranked.then_some(FLUSH_TICK),
            |shard| shard.searcher.search(&plan.ctx, q, opts),
            |event| {
                if ranked && Instant::now() >= flush_deadline {
                    collector.flush();
                }
                let FanOutEvent::Report(report) = event else {
                    return;
                };
                plan.pending.remove(report.priority);
                let progress = Progress {
                    priority: report.priority,
                    max_pending_priority: plan.pending.max(),
                };

                match report.outcome {
                    ShardOutcome::Done(mut result) => {
                        result.stats.wait += report.wait;
                        result.progress = progress;
                        match_count += result.stats.match_count;
                        plan.check_cutoff(opts, match_count, report.priority);
                        if ranked {
                            collector.add(report.index, result);
                        } else {
                            sort_files(&mut result.files);
                            send_by_repository(result, sender);
                        }
                    }
                    ShardOutcome::Crashed(reason) => {
                        warn!(shard = %report.key, %reason, "shard crashed during search");
                        leftover.crashes += 1;
                        leftover.wait += report.wait;
                    }
                    ShardOutcome::Failed(e) => {
                        if failure.is_none() {
                            failure = Some(e);
                            plan.ctx.cancel();
                        }
                    }
                    ShardOutcome::Skipped => {
                        leftover.shards_skipped += 1;
                        leftover.wait += report.wait;
                    }
                }
            },
        );

        if let Some(e) = failure {
            return Err(e);
        }

        let tail = (!leftover.is_zero()).then(|| SearchResult {
            stats: leftover,
            progress: Progress::default(),
            ..Default::default()
        });
        if ranked {
            if let Some(tail) = tail {
                collector.add(plan.shards.len(), tail);
            }
            collector.flush();
        } else if let Some(tail) = tail {
            sender.send(tail);
        }

        debug!(
            shards = plan.shards.len(),
            duration_ms = plan.started.elapsed().as_millis() as u64,
            "streaming search finished"
        );
        Ok(())
    }

    fn list(
        &self,
        ctx: &CancelToken,
        q: &Q,
        opts: Option<&ListOptions>,
    ) -> Result<RepoList, SearchError> {
        let plan = self.prepare(ctx, q, &SearchOptions::default())?;
        let mut per_shard: Vec<Option<RepoList>> = (0..plan.shards.len()).map(|_| None).collect();
        let mut crashes = plan.stats.crashes;
        let mut failure: Option<SearchError> = None;

        self.fan_out(
            &plan.shards,
            &plan.ctx,
            None,
            |shard| shard.searcher.list(&plan.ctx, q, opts),
            |event| {
                let FanOutEvent::Report(report) = event else {
                    return;
                };
                match report.outcome {
                    ShardOutcome::Done(list) => per_shard[report.index] = Some(list),
                    ShardOutcome::Crashed(reason) => {
                        warn!(shard = %report.key, %reason, "shard crashed during list");
                        crashes += 1;
                    }
                    ShardOutcome::Failed(e) => {
                        if failure.is_none() {
                            failure = Some(e);
                            plan.ctx.cancel();
                        }
                    }
                    ShardOutcome::Skipped => {}
                }
            },
        );

        if let Some(e) = failure {
            return Err(e);
        }

        let field = opts.map(|o| o.field).unwrap_or_default();
        let mut merged = merge_repo_lists(per_shard.into_iter().flatten(), field);
        merged.crashes += crashes;
        Ok(merged)
    }

    fn close(&self) {
        self.registry.clear();
    }

    fn name(&self) -> String {
        "sharded".to_string()
    }
}

/// Keep the metadata with the most branches; the first seen wins ties
fn prefer_more_branches(existing: &[RepositoryBranch], candidate: &[RepositoryBranch]) -> bool {
    candidate.len() > existing.len()
}

/// Merge per-shard listings, deduplicating repositories that span shards
fn merge_repo_lists(lists: impl Iterator<Item = RepoList>, field: RepoListField) -> RepoList {
    let mut merged = RepoList::default();
    let mut by_name: HashMap<String, usize> = HashMap::new();

    for list in lists {
        merged.crashes += list.crashes;
        merged.stats.add(&list.stats);

        for entry in list.repos {
            match by_name.entry(entry.repository.name.clone()) {
                Entry::Occupied(slot) => {
                    let existing = &mut merged.repos[*slot.get()];
                    existing.stats.add(&entry.stats);
                    if prefer_more_branches(&existing.repository.branches, &entry.repository.branches) {
                        existing.repository = entry.repository;
                    }
                }
                Entry::Vacant(slot) => {
                    slot.insert(merged.repos.len());
                    merged.repos.push(entry);
                }
            }
        }

        for (id, minimal) in list.repos_map {
            match merged.repos_map.entry(id) {
                Entry::Occupied(mut slot) => {
                    if prefer_more_branches(&slot.get().branches, &minimal.branches) {
                        slot.insert(minimal);
                    }
                }
                Entry::Vacant(slot) => {
                    slot.insert(minimal);
                }
            }
        }
    }

    if field == RepoListField::ReposMap {
        let (with_id, without_id): (Vec<_>, Vec<_>) =
            merged.repos.into_iter().partition(|e| e.repository.id != 0);
        merged.repos = without_id;
        for entry in with_id {
            let minimal = MinimalRepoListEntry {
                has_symbols: entry.repository.has_symbols,
                branches: entry.repository.branches,
            };
            match merged.repos_map.entry(entry.repository.id) {
                Entry::Occupied(mut slot) => {
                    if prefer_more_branches(&slot.get().branches, &minimal.branches) {
                        slot.insert(minimal);
                    }
                }
                Entry::Vacant(slot) => {
                    slot.insert(minimal);
                }
            }
        }
    }

    merged.stats.repos = merged.repos.len() + merged.repos_map.len();
    merged
}
