//! Integration tests for searching across many shards

mod fixtures;

use fixtures::*;
use pretty_assertions::assert_eq;
use shardex::SearchError;
use shardex::index::types::*;
use shardex::index::{Searcher, SenderFunc, ShardReader};
use shardex::query::{Q, parse_query};
use shardex::search::{CancelToken, SearchConfig, ShardRegistry, ShardedSearcher};
use shardex::server::{DirectorySearcher, WatcherConfig};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

fn needle() -> Q {
    Q::substring("needle")
}

fn doc(name: &str, rank: f64) -> Document {
    Document {
        name: name.into(),
        content: "let needle = 1;\n".into(),
        rank,
        ..Default::default()
    }
}

fn reader(repo: &str, documents: Vec<Document>) -> Option<Box<dyn Searcher>> {
    Some(Box::new(ShardReader::from_shard(
        repo,
        ShardFile {
            repository: Repository::new(repo),
            documents,
        },
    )))
}

fn collect_stream(
    searcher: &ShardedSearcher,
    q: &Q,
    opts: &SearchOptions,
) -> Vec<SearchResult> {
    let events = Mutex::new(Vec::new());
    let sender = SenderFunc(|r: SearchResult| events.lock().unwrap().push(r));
    searcher
        .stream_search(&CancelToken::new(), q, opts, &sender)
        .unwrap();
    events.into_inner().unwrap()
}

#[test]
fn test_crashes_counted_until_ready() {
    let registry = Arc::new(ShardRegistry::new());
    registry.replace(vec![
        ("good".to_string(), RankSearcher::new("good", 1).boxed()),
        ("bad".to_string(), Some(Box::new(CrashSearcher) as Box<dyn Searcher>)),
    ]);
    let searcher = ShardedSearcher::new(Arc::clone(&registry));

    let result = searcher
        .search(&CancelToken::new(), &needle(), &SearchOptions::default())
        .unwrap();
    assert_eq!(result.stats.crashes, 2);
    assert_eq!(result.files.len(), 1);

    registry.mark_ready();
    let result = searcher
        .search(&CancelToken::new(), &needle(), &SearchOptions::default())
        .unwrap();
    assert_eq!(result.stats.crashes, 1);
    assert_eq!(result.files.len(), 1);
}

#[test]
fn test_panicking_shard_is_contained() {
    let registry = ready_registry(vec![
        ("a".to_string(), RankSearcher::new("a", 1).boxed()),
        ("p".to_string(), Some(Box::new(PanicSearcher) as Box<dyn Searcher>)),
        ("b".to_string(), RankSearcher::new("b", 2).boxed()),
    ]);
    let searcher = ShardedSearcher::new(registry);

    let result = searcher
        .search(&CancelToken::new(), &needle(), &SearchOptions::default())
        .unwrap();
    assert_eq!(result.stats.crashes, 1);
    assert_eq!(result.files.len(), 2);
    assert_eq!(result.stats.shards_scanned, 2);

    let list = searcher
        .list(&CancelToken::new(), &Q::Const(true), None)
        .unwrap();
    assert_eq!(list.crashes, 1);
    assert_eq!(list.repos.len(), 2);
}

#[test]
fn test_equal_scores_ordered_by_priority() {
    let registry = ranked_registry([3, 9, 1, 5]);
    let searcher = ShardedSearcher::new(registry);

    let result = searcher
        .search(&CancelToken::new(), &needle(), &SearchOptions::default())
        .unwrap();
    assert_eq!(
        file_names(&result),
        vec!["repo-09.rs", "repo-05.rs", "repo-03.rs", "repo-01.rs"]
    );
    assert_eq!(result.stats.file_count, 4);
    assert_eq!(result.stats.match_count, 4);
    assert_eq!(result.repo_urls.len(), 4);
}

#[test]
fn test_score_beats_priority() {
    let registry = ready_registry(vec![
        ("low".to_string(), RankSearcher::new("low", 1).with_score(900.0).boxed()),
        ("high".to_string(), RankSearcher::new("high", 100).boxed()),
    ]);
    let searcher = ShardedSearcher::new(registry);

    let result = searcher
        .search(&CancelToken::new(), &needle(), &SearchOptions::default())
        .unwrap();
    assert_eq!(file_names(&result), vec!["low.rs", "high.rs"]);
}

#[test]
fn test_max_doc_display_count_truncates() {
    let searcher = ShardedSearcher::new(ranked_registry(1..=6));
    let opts = SearchOptions {
        max_doc_display_count: 2,
        ..Default::default()
    };
    let result = searcher.search(&CancelToken::new(), &needle(), &opts).unwrap();
    assert_eq!(file_names(&result), vec!["repo-06.rs", "repo-05.rs"]);
    // Stats still describe every file found
    assert_eq!(result.stats.file_count, 6);
}

#[test]
fn test_total_max_match_count_cuts_off_low_priority_shards() {
    let n = 10u16;
    let registry = ready_registry(
        (1..=n)
            .map(|rank| {
                (
                    format!("shard-{rank}"),
                    RankSearcher::new(&format!("repo-{rank:02}"), rank)
                        .with_delay(Duration::from_millis(20))
                        .boxed(),
                )
            })
            .collect(),
    );
    let searcher = ShardedSearcher::new(registry).with_workers(1);
    let opts = SearchOptions {
        total_max_match_count: 3,
        ..Default::default()
    };

    let result = searcher.search(&CancelToken::new(), &needle(), &opts).unwrap();
    assert!(result.files.len() >= 3, "got {} files", result.files.len());
    assert!(result.files.len() < n as usize, "cutoff never triggered");
    assert!(result.stats.shards_skipped > 0);
    // The best shards are always searched first
    assert_eq!(&file_names(&result)[..3], ["repo-10.rs", "repo-09.rs", "repo-08.rs"]);
}

#[test]
fn test_cutoff_with_parallel_workers() {
    let workers = 4;
    let n = (workers * 8) as u16;
    let registry = ready_registry(
        (1..=n)
            .map(|rank| {
                (
                    format!("shard-{rank}"),
                    RankSearcher::new(&format!("repo-{rank:02}"), rank)
                        .with_delay(Duration::from_millis(10))
                        .boxed(),
                )
            })
            .collect(),
    );
    let searcher = ShardedSearcher::new(registry).with_workers(workers);
    let opts = SearchOptions {
        total_max_match_count: 3,
        ..Default::default()
    };

    let result = searcher.search(&CancelToken::new(), &needle(), &opts).unwrap();
    assert!(result.files.len() >= 3, "got {} files", result.files.len());
    assert!(result.files.len() < n as usize, "cutoff never triggered");
    assert!(result.stats.shards_skipped > 0);
    for pair in result.files.windows(2) {
        assert!(
            pair[0].repository_priority > pair[1].repository_priority,
            "{} ranked before {}",
            pair[0].repository,
            pair[1].repository
        );
    }
    assert_eq!(result.files[0].repository, format!("repo-{n:02}"));
}

#[test]
fn test_cancelled_context_returns_partial_result() {
    let searcher = ShardedSearcher::new(ranked_registry(1..=4));
    let ctx = CancelToken::new();
    ctx.cancel();

    let result = searcher
        .search(&ctx, &needle(), &SearchOptions::default())
        .unwrap();
    assert!(result.files.is_empty());
    assert_eq!(result.stats.shards_skipped, 4);
}

#[test]
fn test_invalid_query_fails_before_dispatch() {
    let shard = RankSearcher::new("a", 1);
    let searches = Arc::clone(&shard.searches);
    let registry = ready_registry(vec![("a".to_string(), shard.boxed())]);
    let searcher = ShardedSearcher::new(registry);

    let err = searcher
        .search(&CancelToken::new(), &Q::substring(""), &SearchOptions::default())
        .unwrap_err();
    assert!(matches!(err, SearchError::InvalidQuery(_)));

    let opts = SearchOptions {
        document_ranks_weight: -1.0,
        ..Default::default()
    };
    let err = searcher
        .search(&CancelToken::new(), &needle(), &opts)
        .unwrap_err();
    assert!(matches!(err, SearchError::InvalidOptions(_)));
    assert_eq!(searches.load(Ordering::SeqCst), 0);
}

#[test]
fn test_repo_filter_skips_shards() {
    let searcher = ShardedSearcher::new(ranked_registry(1..=5));
    let q = Q::And(vec![Q::repo_set(["repo-02", "repo-04"]), needle()]);

    let result = searcher
        .search(&CancelToken::new(), &q, &SearchOptions::default())
        .unwrap();
    assert_eq!(file_names(&result), vec!["repo-04.rs", "repo-02.rs"]);
    assert_eq!(result.stats.shards_skipped_filter, 3);
}

#[test]
fn test_parsed_repo_query_skips_shards() {
    let searcher = ShardedSearcher::new(ranked_registry(1..=5));
    let q = parse_query("repo:repo-0[13] needle").unwrap();

    let result = searcher
        .search(&CancelToken::new(), &q, &SearchOptions::default())
        .unwrap();
    assert_eq!(file_names(&result), vec!["repo-03.rs", "repo-01.rs"]);
}

#[test]
fn test_document_ranks_across_shards() {
    let registry = ready_registry(vec![
        ("a".to_string(), reader("acme/a", vec![doc("f1", 2.0), doc("f3", 8.0)])),
        (
            "b".to_string(),
            reader("acme/b", vec![doc("f2", 4.0), doc("f4", 16.0), doc("f5", 0.0)]),
        ),
    ]);
    let searcher = ShardedSearcher::new(registry);
    let opts = SearchOptions {
        use_document_ranks: true,
        ..Default::default()
    };

    let result = searcher.search(&CancelToken::new(), &needle(), &opts).unwrap();
    assert_eq!(file_names(&result), vec!["f4", "f3", "f2", "f1", "f5"]);
}

#[test]
fn test_ranked_stream_sends_one_flush() {
    let registry = ready_registry(vec![
        ("a".to_string(), reader("acme/a", vec![doc("f1", 2.0), doc("f3", 8.0)])),
        (
            "b".to_string(),
            reader("acme/b", vec![doc("f2", 4.0), doc("f4", 16.0), doc("f5", 0.0)]),
        ),
    ]);
    let searcher = ShardedSearcher::new(registry);
    let opts = SearchOptions {
        use_document_ranks: true,
        flush_wall_time: Duration::from_secs(10),
        ..Default::default()
    };

    let events = collect_stream(&searcher, &needle(), &opts);
    assert_eq!(events.len(), 2);
    assert!(events[0].files.is_empty());
    assert_eq!(file_names(&events[1]), vec!["f4", "f3", "f2", "f1", "f5"]);
    assert_eq!(events[1].stats.file_count, 5);
}

#[test]
fn test_ranked_stream_matches_blocking_order_on_ties() {
    let registry = ready_registry(vec![
        (
            "slow".to_string(),
            RankSearcher::new("slow", 5)
                .with_delay(Duration::from_millis(60))
                .boxed(),
        ),
        ("fast".to_string(), RankSearcher::new("fast", 5).boxed()),
    ]);
    let searcher = ShardedSearcher::new(registry).with_workers(4);
    let opts = SearchOptions {
        use_document_ranks: true,
        flush_wall_time: Duration::from_secs(10),
        ..Default::default()
    };

    let blocking = searcher.search(&CancelToken::new(), &needle(), &opts).unwrap();
    assert_eq!(file_names(&blocking), vec!["slow.rs", "fast.rs"]);

    let events = collect_stream(&searcher, &needle(), &opts);
    assert_eq!(events.len(), 2);
    assert_eq!(file_names(&events[1]), file_names(&blocking));
}

#[test]
fn test_unranked_stream_groups_by_repository() {
    let searcher = ShardedSearcher::new(ranked_registry([1, 2, 3]));

    let events = collect_stream(&searcher, &needle(), &SearchOptions::default());
    // Progress event, then one event per shard
    assert_eq!(events.len(), 4);
    assert_eq!(events[0].progress.max_pending_priority, 3.0);

    let mut repos: Vec<String> = events[1..]
        .iter()
        .map(|e| {
            assert_eq!(e.files.len(), 1);
            assert_eq!(e.repo_urls.len(), 1);
            e.files[0].repository.clone()
        })
        .collect();
    repos.sort();
    assert_eq!(repos, vec!["repo-01", "repo-02", "repo-03"]);

    let total: usize = events.iter().map(|e| e.stats.file_count).sum();
    assert_eq!(total, 3);
}

#[test]
fn test_stream_reports_crash_in_tail() {
    let registry = ready_registry(vec![
        ("a".to_string(), RankSearcher::new("a", 1).boxed()),
        ("bad".to_string(), Some(Box::new(CrashSearcher) as Box<dyn Searcher>)),
    ]);
    let searcher = ShardedSearcher::new(registry);

    let events = collect_stream(&searcher, &needle(), &SearchOptions::default());
    let crashes: usize = events.iter().map(|e| e.stats.crashes).sum();
    assert_eq!(crashes, 1);
    let files: usize = events.iter().map(|e| e.files.len()).sum();
    assert_eq!(files, 1);
}

#[test]
fn test_list_dedups_repositories_across_shards() {
    let mut main_only = Repository::new("acme/widgets");
    main_only.branches.push(RepositoryBranch {
        name: "main".into(),
        version: "1".into(),
    });
    let mut two_branches = main_only.clone();
    two_branches.branches.push(RepositoryBranch {
        name: "dev".into(),
        version: "2".into(),
    });

    let shard = |repo: Repository| -> Option<Box<dyn Searcher>> {
        Some(Box::new(ShardReader::from_shard(
            repo.name.clone(),
            ShardFile {
                repository: repo,
                documents: vec![doc("a.rs", 0.0)],
            },
        )))
    };
    let registry = ready_registry(vec![
        ("s1".to_string(), shard(main_only)),
        ("s2".to_string(), shard(two_branches)),
        ("s3".to_string(), shard(Repository::new("acme/gadgets"))),
    ]);
    let searcher = ShardedSearcher::new(registry);

    let list = searcher
        .list(&CancelToken::new(), &Q::Const(true), None)
        .unwrap();
    assert_eq!(list.repos.len(), 2);
    assert_eq!(list.stats.repos, 2);
    assert_eq!(list.stats.shards, 3);

    let widgets = list
        .repos
        .iter()
        .find(|e| e.repository.name == "acme/widgets")
        .unwrap();
    assert_eq!(widgets.repository.branches.len(), 2);
    assert_eq!(widgets.stats.shards, 2);
}

#[test]
fn test_stats_sums_shards() {
    let searcher = ShardedSearcher::new(ranked_registry(1..=3));
    let stats = searcher.stats().unwrap();
    assert_eq!(stats.repos, 3);
    assert_eq!(stats.documents, 3);
}

#[test]
fn test_close_empties_registry() {
    let registry = ranked_registry(1..=3);
    let searcher = ShardedSearcher::new(Arc::clone(&registry));
    searcher.close();
    assert!(registry.is_empty());

    let result = searcher
        .search(&CancelToken::new(), &needle(), &SearchOptions::default())
        .unwrap();
    assert!(result.files.is_empty());
    assert_eq!(result.stats.crashes, 0);
}

#[test]
fn test_snapshot_isolation_during_replace() {
    let registry = ranked_registry(1..=2);
    let snapshot = registry.snapshot();
    registry.replace(vec![("shard-1".to_string(), None)]);

    assert_eq!(snapshot.len(), 2);
    assert_eq!(registry.len(), 1);
}

#[test]
fn test_empty_directory_searcher() {
    let temp = TempDir::new().unwrap();
    let searcher =
        DirectorySearcher::open(temp.path(), &SearchConfig::default(), WatcherConfig::default())
            .unwrap();

    let result = searcher
        .search(&CancelToken::new(), &needle(), &SearchOptions::default())
        .unwrap();
    assert!(result.files.is_empty());
    assert_eq!(result.stats.crashes, 0);

    let list = searcher
        .list(&CancelToken::new(), &Q::Const(true), None)
        .unwrap();
    assert!(list.repos.is_empty());
}

#[test]
fn test_directory_searcher_over_shard_files() {
    let temp = TempDir::new().unwrap();
    write_shard(temp.path(), "acme/widgets", 1, "fn needle() {}\n");
    write_shard(temp.path(), "acme/gadgets", 1, "nothing here\n");
    // Superseded by version 2
    write_shard(temp.path(), "acme/tools", 1, "let needle = 0;\n");
    write_shard(temp.path(), "acme/tools", 2, "let haystack = 0;\n");

    let searcher =
        DirectorySearcher::open(temp.path(), &SearchConfig::default(), WatcherConfig::default())
            .unwrap();
    assert_eq!(searcher.registry().len(), 3);

    let result = searcher
        .search(&CancelToken::new(), &needle(), &SearchOptions::default())
        .unwrap();
    let repos: Vec<&str> = result.files.iter().map(|f| f.repository.as_str()).collect();
    assert_eq!(repos, vec!["acme/widgets"]);
}
