//! The interface every shard and every aggregate of shards implements

use crate::error::SearchError;
use crate::index::types::{ListOptions, RepoList, RepoStats, SearchOptions, SearchResult};
use crate::query::Q;
use crate::search::cancel::CancelToken;

/// Receives streamed search results
///
/// Called from worker threads; implementations must be safe to call
/// concurrently.
pub trait Sender: Send + Sync {
    fn send(&self, result: SearchResult);
}

/// Adapts a closure into a [`Sender`]
pub struct SenderFunc<F>(pub F);

impl<F> Sender for SenderFunc<F>
where
    F: Fn(SearchResult) + Send + Sync,
{
    fn send(&self, result: SearchResult) {
        (self.0)(result)
    }
}

pub trait Searcher: Send + Sync {
    fn search(
        &self,
        ctx: &CancelToken,
        q: &Q,
        opts: &SearchOptions,
    ) -> Result<SearchResult, SearchError>;

    /// Stream results to `sender`; the default runs a blocking search and
    /// sends the whole result once
    fn stream_search(
        &self,
        ctx: &CancelToken,
        q: &Q,
        opts: &SearchOptions,
        sender: &dyn Sender,
    ) -> Result<(), SearchError> {
        let result = self.search(ctx, q, opts)?;
        sender.send(result);
        Ok(())
    }

    /// List repositories with at least one document matching `q`
    fn list(
        &self,
        ctx: &CancelToken,
        q: &Q,
        opts: Option<&ListOptions>,
    ) -> Result<RepoList, SearchError>;

    fn stats(&self) -> Result<RepoStats, SearchError> {
        let list = self.list(&CancelToken::new(), &Q::Const(true), None)?;
        Ok(list.stats)
    }

    /// Release resources; called exactly once, after the last query
    fn close(&self) {}

    fn name(&self) -> String;
}
