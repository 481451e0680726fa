//! # shardex - multi-shard code search aggregation
//!
//! shardex answers code search queries over a directory of independently
//! built index shards. Every shard is searched in parallel, matches are
//! scored, and the per-shard results are merged into one ranked answer,
//! either all at once or as a stream.
//!
//! ## Architecture
//!
//! - [`query`] - Query AST, parser and the scoring model
//! - [`index`] - Shard files: builder, reader, and the [`Searcher`](index::Searcher) interface
//! - [`search`] - Shard registry, parallel fan-out, merging and streaming
//! - [`server`] - Directory watcher that keeps the registry in sync with disk
//! - [`output`] - Result formatting for the CLI
//! - [`utils`] - Config file and application directories
//!
//! ## Quick Start
//!
//! ```ignore
//! use shardex::index::Searcher;
//! use shardex::query::parse_query;
//! use shardex::search::{CancelToken, SearchConfig};
//! use shardex::server::{DirectorySearcher, WatcherConfig};
//! use std::path::Path;
//!
//! let searcher = DirectorySearcher::open(
//!     Path::new("/var/lib/shards"),
//!     &SearchConfig::load(),
//!     WatcherConfig::load(),
//! )?;
//!
//! let q = parse_query("repo:widgets fn main")?;
//! let result = searcher.search(&CancelToken::new(), &q, &Default::default())?;
//! for file in &result.files {
//!     println!("{} {} {:.2}", file.repository, file.file_name, file.score);
//! }
//! ```

pub mod error;
pub mod index;
pub mod output;
pub mod query;
pub mod search;
pub mod server;
pub mod utils;

pub use error::SearchError;
