//! Error types for search and list operations

use thiserror::Error;

/// Errors returned by a [`Searcher`](crate::index::Searcher)
#[derive(Debug, Error)]
pub enum SearchError {
    /// The query failed validation before any shard was consulted
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// The search options failed validation
    #[error("invalid search options: {0}")]
    InvalidOptions(String),

    /// A shard failed in a way that is contained and counted as a crash
    #[error("shard {shard} crashed: {reason}")]
    ShardCrashed { shard: String, reason: String },

    /// A shard file could not be decoded
    #[error("corrupt shard {path}: {reason}")]
    Corrupt { path: String, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SearchError {
    /// Whether the aggregator should count this error as a crash instead of
    /// failing the whole query
    pub fn is_crash(&self) -> bool {
        matches!(self, SearchError::ShardCrashed { .. })
    }
}

pub type Result<T, E = SearchError> = std::result::Result<T, E>;
