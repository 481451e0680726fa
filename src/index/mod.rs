pub mod builder;
pub mod reader;
pub mod searcher;
pub mod stats;
pub mod types;

pub use builder::ShardBuilder;
pub use reader::ShardReader;
pub use searcher::{Searcher, Sender, SenderFunc};
pub use types::*;
