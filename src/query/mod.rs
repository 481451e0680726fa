pub mod ast;
pub mod parser;
pub mod scorer;

pub use ast::{BranchRepos, Q, RawConfig, RegexpQuery, Substring};
pub use parser::parse_query;
pub use scorer::{Bm25Context, FileScore, ScoreContext, Scorer, ScoringWeights};
