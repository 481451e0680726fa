//! Helpers for delivering streamed results

use crate::index::searcher::Sender;
use crate::index::types::{FileMatch, Progress, SearchResult};
use std::collections::{BTreeMap, HashMap, btree_map};

/// Order files by score, then repository priority; stable for equal keys
pub fn sort_files(files: &mut [FileMatch]) {
    files.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| b.repository_priority.total_cmp(&a.repository_priority))
    });
}

/// Fold `other` into `acc`
pub fn merge_result(acc: &mut SearchResult, other: SearchResult) {
    acc.files.extend(other.files);
    acc.stats.add(&other.stats);
    acc.repo_urls.extend(other.repo_urls);
    acc.progress = other.progress;
}

/// Send `result` as one event per repository
///
/// Files keep their relative order within a repository and repositories are
/// sent in order of first appearance. Stats travel with the first event only,
/// so summing the stats of all events yields the original stats.
pub fn send_by_repository(result: SearchResult, sender: &dyn Sender) {
    if result.files.is_empty() {
        sender.send(result);
        return;
    }

    let SearchResult {
        files,
        stats,
        progress,
        mut repo_urls,
    } = result;

    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<FileMatch>> = HashMap::new();
    for file in files {
        let group = groups.entry(file.repository.clone()).or_insert_with(|| {
            order.push(file.repository.clone());
            Vec::new()
        });
        group.push(file);
    }

    let mut stats = Some(stats);
    for repo in order {
        let files = groups.remove(&repo).unwrap_or_default();
        let mut urls = HashMap::new();
        if let Some(url) = repo_urls.remove(&repo) {
            urls.insert(repo, url);
        }
        sender.send(SearchResult {
            files,
            stats: stats.take().unwrap_or_default(),
            progress,
            repo_urls: urls,
        });
    }
}

/// Collects results until flushed, then sends them as a single ranked event;
/// after the flush every result is forwarded as it arrives
///
/// Buffered results are joined by their shard position, not their arrival
/// order, so the flushed event ranks ties exactly like a blocking search.
pub struct FlushCollector<'a> {
    sender: &'a dyn Sender,
    pending: BTreeMap<usize, SearchResult>,
    /// Progress of the most recent arrival
    progress: Option<Progress>,
    flushed: bool,
    max_doc_display_count: usize,
}

impl<'a> FlushCollector<'a> {
    pub fn new(sender: &'a dyn Sender, max_doc_display_count: usize) -> Self {
        Self {
            sender,
            pending: BTreeMap::new(),
            progress: None,
            flushed: false,
            max_doc_display_count,
        }
    }

    /// Buffer the result of the shard at `position` in the snapshot
    pub fn add(&mut self, position: usize, result: SearchResult) {
        if self.flushed {
            self.sender.send(result);
            return;
        }
        self.progress = Some(result.progress);
        match self.pending.entry(position) {
            btree_map::Entry::Occupied(mut slot) => merge_result(slot.get_mut(), result),
            btree_map::Entry::Vacant(slot) => {
                slot.insert(result);
            }
        }
    }

    pub fn is_flushed(&self) -> bool {
        self.flushed
    }

    /// Send everything collected so far; only the first call has an effect
    pub fn flush(&mut self) {
        if self.flushed {
            return;
        }
        self.flushed = true;

        let mut parts = std::mem::take(&mut self.pending).into_values();
        let Some(mut result) = parts.next() else {
            return;
        };
        for part in parts {
            merge_result(&mut result, part);
        }
        if let Some(progress) = self.progress.take() {
            result.progress = progress;
        }
        sort_files(&mut result.files);
        if self.max_doc_display_count > 0 {
            result.files.truncate(self.max_doc_display_count);
        }
        self.sender.send(result);
    }
}
