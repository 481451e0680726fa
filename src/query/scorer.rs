//! Scoring module for search results
//!
//! Two models are available:
//! - an additive model where independent signals are summed: matched atoms,
//!   best line match (boosted by its position in the file), document rank,
//!   document order and repository rank
//! - BM25 over the matched terms, which ignores every other signal

use crate::index::types::SearchOptions;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

/// Score of a match that starts and ends on word boundaries
pub const SCORE_WORD_MATCH: f64 = 500.0;
/// Score of a match with a word boundary on one side
pub const SCORE_PARTIAL_WORD_MATCH: f64 = 50.0;

/// Configurable weights for scoring factors
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringWeights {
    /// Boost reached asymptotically as more distinct atoms match
    pub atom_match_boost: f64,
    /// Bonus for earlier matches in a file
    pub line_order_factor: f64,
    /// Default weight of the document rank signal
    pub file_rank_weight: f64,
    /// Bonus for documents earlier in the shard
    pub file_order_factor: f64,
    /// Bonus for higher ranked repositories
    pub repo_rank_factor: f64,
    pub bm25_k1: f64,
    pub bm25_b: f64,
    /// Term frequency credited for one file name occurrence
    pub bm25_file_name_weight: usize,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            atom_match_boost: 400.0,
            line_order_factor: 1.0,
            file_rank_weight: 9000.0,
            file_order_factor: 10.0,
            repo_rank_factor: 20.0,
            bm25_k1: 1.2,
            bm25_b: 0.75,
            bm25_file_name_weight: 5,
        }
    }
}

/// Score calculation context for a single file
#[derive(Debug, Default)]
pub struct ScoreContext {
    /// Number of distinct query atoms that matched this file
    pub atom_count: usize,
    /// Raw match score of every matched line, in file order
    pub line_scores: Vec<f64>,
    /// Precomputed document rank
    pub doc_rank: f64,
    /// Position of the document within its shard
    pub doc_position: usize,
    /// Number of documents in the shard
    pub doc_count: usize,
    pub repo_rank: u16,
}

/// Term statistics for BM25 scoring of a single file
#[derive(Debug, Default)]
pub struct Bm25Context {
    /// Occurrences per matched term, file name matches already weighted
    pub term_frequencies: FxHashMap<String, usize>,
    /// Length of the document in bytes
    pub doc_len: usize,
    /// Average document length in the shard
    pub avg_doc_len: f64,
}

/// Computed score for a file
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileScore {
    pub score: f64,
    /// Line scores after the order boost, same order as the input lines
    pub line_scores: Vec<f64>,
    pub debug: Option<String>,
}

/// Accumulates signal contributions and the optional debug trace
struct ScoreTrace {
    score: f64,
    debug: Option<String>,
}

impl ScoreTrace {
    fn new(debug: bool) -> Self {
        Self {
            score: 0.0,
            debug: debug.then(String::new),
        }
    }

    fn add(&mut self, what: &str, computed: f64, raw: f64) {
        if computed != 0.0 {
            if let Some(debug) = self.debug.as_mut() {
                debug.push_str(&format!("{what}({raw}):{computed:.2}, "));
            }
        }
        self.score += computed;
    }

    fn finish(self) -> (f64, Option<String>) {
        let debug = self
            .debug
            .map(|d| d.trim_end_matches(", ").to_string());
        (self.score, debug)
    }
}

/// Scorer calculates relevance scores for search results
#[derive(Debug, Clone, Default)]
pub struct Scorer {
    weights: ScoringWeights,
}

impl Scorer {
    pub fn new(weights: ScoringWeights) -> Self {
        Self { weights }
    }

    /// Create a scorer with default weights
    pub fn with_defaults() -> Self {
        Self::new(ScoringWeights::default())
    }

    /// Calculate the additive score for a file
    pub fn calculate_score(&self, ctx: &ScoreContext, opts: &SearchOptions) -> FileScore {
        let mut trace = ScoreTrace::new(opts.debug_score);

        trace.add("atom", self.atom_boost(ctx.atom_count), ctx.atom_count as f64);

        let line_scores = self.boost_lines(&ctx.line_scores);
        let best = line_scores.iter().copied().fold(0.0_f64, f64::max);
        let best_raw = ctx.line_scores.iter().copied().fold(0.0_f64, f64::max);
        trace.add("fragment", best, best_raw);

        if opts.use_document_ranks {
            let weight = if opts.document_ranks_weight > 0.0 {
                opts.document_ranks_weight
            } else {
                self.weights.file_rank_weight
            };
            trace.add(
                "file-rank",
                weight * (ctx.doc_rank / 32.0).min(1.0),
                ctx.doc_rank,
            );
        }

        trace.add(
            "doc-order",
            self.doc_order(ctx.doc_position, ctx.doc_count),
            ctx.doc_position as f64,
        );
        trace.add(
            "repo-rank",
            self.weights.repo_rank_factor * ctx.repo_rank as f64 / u16::MAX as f64,
            ctx.repo_rank as f64,
        );

        let (score, debug) = trace.finish();
        FileScore {
            score,
            line_scores,
            debug,
        }
    }

    /// `(1 - 1/k) * boost`, zero when nothing matched
    pub fn atom_boost(&self, atoms: usize) -> f64 {
        if atoms == 0 {
            return 0.0;
        }
        (1.0 - 1.0 / atoms as f64) * self.weights.atom_match_boost
    }

    /// Boost each line score by how early it appears in the file
    pub fn boost_lines(&self, scores: &[f64]) -> Vec<f64> {
        let total = scores.len() as f64;
        scores
            .iter()
            .enumerate()
            .map(|(i, s)| s + self.weights.line_order_factor * (1.0 - i as f64 / total))
            .collect()
    }

    fn doc_order(&self, position: usize, count: usize) -> f64 {
        if count == 0 {
            return 0.0;
        }
        self.weights.file_order_factor * (1.0 - position as f64 / count as f64)
    }

    /// Calculate the BM25 score for a file
    pub fn bm25_score(&self, ctx: &Bm25Context, opts: &SearchOptions) -> FileScore {
        let k1 = self.weights.bm25_k1;
        let b = self.weights.bm25_b;

        let avg = if ctx.avg_doc_len > 0.0 {
            ctx.avg_doc_len
        } else {
            1.0
        };
        let length_ratio = ctx.doc_len as f64 / avg;

        let score: f64 = ctx
            .term_frequencies
            .values()
            .map(|&tf| {
                let tf = tf as f64;
                ((k1 + 1.0) * tf) / (k1 * (1.0 - b + b * length_ratio) + tf)
            })
            .sum();

        let debug = opts.debug_score.then(|| {
            let tf_sum: usize = ctx.term_frequencies.values().sum();
            format!(
                "bm25-score: {score:.2} <- sum-term-frequencies: {tf_sum}, length-ratio: {length_ratio:.2}"
            )
        });

        FileScore {
            score,
            line_scores: Vec::new(),
            debug,
        }
    }

    pub fn weights(&self) -> &ScoringWeights {
        &self.weights
    }
}

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Score a match at `start..end` of `line` by its word boundaries
pub fn match_score(line: &[u8], start: usize, end: usize) -> f64 {
    let start_boundary = start == 0 || start > line.len() || !is_word_byte(line[start - 1]);
    let end_boundary = end >= line.len() || !is_word_byte(line[end]);

    match (start_boundary, end_boundary) {
        (true, true) => SCORE_WORD_MATCH,
        (true, false) | (false, true) => SCORE_PARTIAL_WORD_MATCH,
        (false, false) => 0.0,
    }
}
