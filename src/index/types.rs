use crate::error::SearchError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::ops::AddAssign;
use std::time::Duration;

/// Numeric repository identifier, unique across shards
pub type RepoId = u32;

/// Raw config keys understood by the visibility filters
pub const RAW_PUBLIC: &str = "public";
pub const RAW_FORK: &str = "fork";
pub const RAW_ARCHIVED: &str = "archived";
pub const RAW_PRIORITY: &str = "priority";

/// A branch name and the commit it was indexed at
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryBranch {
    pub name: String,
    #[serde(default)]
    pub version: String,
}

/// Repository metadata stored in every shard
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Repository {
    #[serde(default)]
    pub id: RepoId,
    pub name: String,
    #[serde(default)]
    pub url: String,
    /// URL template used by frontends to link to a file
    #[serde(default)]
    pub file_url_template: String,
    #[serde(default)]
    pub branches: Vec<RepositoryBranch>,
    /// Static repository rank, higher is more important
    #[serde(default)]
    pub rank: u16,
    /// Free-form key/value metadata (visibility flags, priority, ...)
    #[serde(default)]
    pub raw_config: BTreeMap<String, String>,
    #[serde(default)]
    pub has_symbols: bool,
}

impl Repository {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Ranking priority: the `priority` raw config value when it parses,
    /// otherwise the static rank.
    pub fn priority(&self) -> f64 {
        self.raw_config
            .get(RAW_PRIORITY)
            .and_then(|v| v.trim().parse::<f64>().ok())
            .filter(|p| p.is_finite())
            .unwrap_or(self.rank as f64)
    }

    /// Boolean raw config flag ("1" or "true")
    pub fn raw_flag(&self, key: &str) -> bool {
        matches!(
            self.raw_config.get(key).map(String::as_str),
            Some("1") | Some("true")
        )
    }

    pub fn has_branch(&self, branch: &str) -> bool {
        self.branches.iter().any(|b| b.name == branch)
    }
}

/// A single match inside a line
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineFragment {
    /// Byte offset of the match within the line
    pub line_offset: usize,
    /// Byte offset of the match within the file
    pub offset: usize,
    pub match_length: usize,
}

/// A matching line (or the file name when `file_name` is set)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LineMatch {
    pub line: String,
    /// 1-based line number, 0 for file name matches
    pub line_number: usize,
    pub fragments: Vec<LineFragment>,
    pub score: f64,
    pub file_name: bool,
}

/// A file that matched a query, with its score
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileMatch {
    pub file_name: String,
    pub repository: String,
    pub repository_id: RepoId,
    pub repository_priority: f64,
    pub branches: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    pub line_matches: Vec<LineMatch>,
    pub score: f64,
    /// Per-signal score breakdown, set when debug scoring is enabled
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug: Option<String>,
}

impl FileMatch {
    pub fn match_count(&self) -> usize {
        self.line_matches.iter().map(|l| l.fragments.len()).sum()
    }
}

/// Additive search counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Stats {
    pub content_bytes_loaded: u64,
    pub index_bytes_loaded: u64,
    /// Number of shards that failed and were contained
    pub crashes: usize,
    pub duration: Duration,
    /// Time spent waiting for a worker
    pub wait: Duration,
    /// Number of files containing a match
    pub file_count: usize,
    pub files_considered: usize,
    pub files_loaded: usize,
    pub files_skipped: usize,
    pub shards_scanned: usize,
    pub shards_skipped: usize,
    /// Shards skipped because no repository could match the query
    pub shards_skipped_filter: usize,
    pub match_count: usize,
    pub ngram_matches: usize,
}

impl Stats {
    pub fn add(&mut self, other: &Stats) {
        self.content_bytes_loaded += other.content_bytes_loaded;
        self.index_bytes_loaded += other.index_bytes_loaded;
        self.crashes += other.crashes;
        self.duration += other.duration;
        self.wait += other.wait;
        self.file_count += other.file_count;
        self.files_considered += other.files_considered;
        self.files_loaded += other.files_loaded;
        self.files_skipped += other.files_skipped;
        self.shards_scanned += other.shards_scanned;
        self.shards_skipped += other.shards_skipped;
        self.shards_skipped_filter += other.shards_skipped_filter;
        self.match_count += other.match_count;
        self.ngram_matches += other.ngram_matches;
    }

    /// True when no counter has moved
    pub fn is_zero(&self) -> bool {
        *self == Stats::default()
    }
}

impl AddAssign<&Stats> for Stats {
    fn add_assign(&mut self, rhs: &Stats) {
        self.add(rhs);
    }
}

/// Streaming progress attached to each result event
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    /// Priority of the shard that produced this event
    pub priority: f64,
    /// Highest priority among shards still pending
    pub max_pending_priority: f64,
}

impl Default for Progress {
    fn default() -> Self {
        Self {
            priority: 0.0,
            max_pending_priority: f64::NEG_INFINITY,
        }
    }
}

/// Result of a search, or one event of a streamed search
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub files: Vec<FileMatch>,
    pub stats: Stats,
    pub progress: Progress,
    /// Repository name to file URL template
    pub repo_urls: HashMap<String, String>,
}

/// Options controlling scoring and result limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchOptions {
    /// Add the per-document rank signal to the score
    pub use_document_ranks: bool,
    /// Weight of the document rank signal; 0 selects the default
    pub document_ranks_weight: f64,
    /// Score with BM25 instead of the additive model
    pub use_bm25_scoring: bool,
    /// Stop dispatching shards once this many matches were found (0 = no limit)
    pub total_max_match_count: usize,
    /// Per-shard match limit (0 = no limit)
    pub shard_max_match_count: usize,
    /// Truncate the merged result to this many files (0 = no limit)
    pub max_doc_display_count: usize,
    /// Streaming only: collect and rank results for this long before flushing
    pub flush_wall_time: Duration,
    /// Abandon shards still running after this long (zero = no limit)
    pub max_wall_time: Duration,
    /// Return the full file content
    pub whole: bool,
    /// Attach a score breakdown to every file match
    pub debug_score: bool,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            use_document_ranks: false,
            document_ranks_weight: 0.0,
            use_bm25_scoring: false,
            total_max_match_count: 0,
            shard_max_match_count: 0,
            max_doc_display_count: 0,
            flush_wall_time: Duration::ZERO,
            max_wall_time: Duration::ZERO,
            whole: false,
            debug_score: false,
        }
    }
}

impl SearchOptions {
    pub fn validate(&self) -> Result<(), SearchError> {
        if !self.document_ranks_weight.is_finite() || self.document_ranks_weight < 0.0 {
            return Err(SearchError::InvalidOptions(format!(
                "document_ranks_weight must be a non-negative number, got {}",
                self.document_ranks_weight
            )));
        }
        Ok(())
    }

    /// Whether results must be collected and sorted before streaming
    pub fn ranked_streaming(&self) -> bool {
        (self.use_document_ranks || self.use_bm25_scoring) && !self.flush_wall_time.is_zero()
    }
}

/// Which field of [`RepoList`] a listing fills
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RepoListField {
    #[default]
    Repos,
    ReposMap,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListOptions {
    pub field: RepoListField,
}

/// Size and content counters for one or more repositories
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoStats {
    /// Number of distinct repositories; not additive across shards
    pub repos: usize,
    pub shards: usize,
    pub documents: usize,
    pub index_bytes: u64,
    pub content_bytes: u64,
    pub new_lines_count: u64,
    pub default_branch_new_lines_count: u64,
    pub other_branches_new_lines_count: u64,
}

impl RepoStats {
    /// Add everything except `repos`, since one repository may span shards
    pub fn add(&mut self, other: &RepoStats) {
        self.shards += other.shards;
        self.documents += other.documents;
        self.index_bytes += other.index_bytes;
        self.content_bytes += other.content_bytes;
        self.new_lines_count += other.new_lines_count;
        self.default_branch_new_lines_count += other.default_branch_new_lines_count;
        self.other_branches_new_lines_count += other.other_branches_new_lines_count;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RepoListEntry {
    pub repository: Repository,
    pub stats: RepoStats,
}

/// Compact listing entry keyed by repository id
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinimalRepoListEntry {
    pub has_symbols: bool,
    pub branches: Vec<RepositoryBranch>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RepoList {
    pub repos: Vec<RepoListEntry>,
    pub repos_map: HashMap<RepoId, MinimalRepoListEntry>,
    pub crashes: usize,
    pub stats: RepoStats,
}

/// A file stored in a shard
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub name: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub branches: Vec<String>,
    /// Precomputed document rank (log scale, typically 0..32)
    #[serde(default)]
    pub rank: f64,
}

/// On-disk shard layout
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShardFile {
    pub repository: Repository,
    #[serde(default)]
    pub documents: Vec<Document>,
}
