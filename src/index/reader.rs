//! Reference shard searcher over JSON shard files
//!
//! A shard holds the documents of one repository. The file is memory-mapped
//! and decoded once on open; queries scan every document, which is fine for
//! the shard sizes this reader targets.

use crate::error::SearchError;
use crate::index::searcher::Searcher;
use crate::index::types::*;
use crate::query::ast::{Q, RegexpQuery, Substring};
use crate::query::scorer::{Bm25Context, ScoreContext, Scorer, match_score};
use crate::search::cancel::CancelToken;
use memchr::memmem;
use memmap2::Mmap;
use rustc_hash::FxHashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Lowercased copies used for case-insensitive matching
///
/// ASCII folding keeps byte offsets identical to the original text.
struct FoldedDoc {
    name: Vec<u8>,
    content: Vec<u8>,
    /// Byte offsets of every '\n' in the content
    newlines: Vec<usize>,
}

impl FoldedDoc {
    fn new(doc: &Document) -> Self {
        Self {
            name: doc.name.as_bytes().to_ascii_lowercase(),
            content: doc.content.as_bytes().to_ascii_lowercase(),
            newlines: memchr::memchr_iter(b'\n', doc.content.as_bytes()).collect(),
        }
    }

    /// 1-based line number and byte range of the line containing `offset`
    fn line_at(&self, offset: usize, content_len: usize) -> (usize, usize, usize) {
        let idx = self.newlines.partition_point(|&nl| nl < offset);
        let start = if idx == 0 { 0 } else { self.newlines[idx - 1] + 1 };
        let end = self.newlines.get(idx).copied().unwrap_or(content_len);
        (idx + 1, start, end)
    }
}

/// A single occurrence of an atom in a document
#[derive(Debug, Clone, Copy)]
struct Hit {
    in_name: bool,
    start: usize,
    end: usize,
}

enum AtomKind {
    Substring(memmem::Finder<'static>),
    Regexp(regex::bytes::Regex),
}

struct Atom {
    kind: AtomKind,
    case_sensitive: bool,
    file_name_only: bool,
    content_only: bool,
    /// Term key for BM25
    term: String,
    /// Contributes to scoring (not under a negation)
    positive: bool,
}

impl Atom {
    fn from_substring(s: &Substring, positive: bool) -> Self {
        let needle = if s.case_sensitive {
            s.pattern.as_bytes().to_vec()
        } else {
            s.pattern.as_bytes().to_ascii_lowercase()
        };
        Self {
            kind: AtomKind::Substring(memmem::Finder::new(&needle).into_owned()),
            case_sensitive: s.case_sensitive,
            file_name_only: s.file_name,
            content_only: s.content,
            term: s.pattern.to_lowercase(),
            positive,
        }
    }

    fn from_regexp(r: &RegexpQuery, positive: bool) -> Result<Self, SearchError> {
        let regex = regex::bytes::RegexBuilder::new(r.regex.as_str())
            .case_insensitive(!r.case_sensitive)
            .build()
            .map_err(|e| SearchError::InvalidQuery(e.to_string()))?;
        Ok(Self {
            kind: AtomKind::Regexp(regex),
            // Regexes carry their own case handling
            case_sensitive: true,
            file_name_only: r.file_name,
            content_only: r.content,
            term: r.regex.as_str().to_string(),
            positive,
        })
    }

    fn find_in(&self, text: &[u8], in_name: bool, hits: &mut Vec<Hit>) {
        match &self.kind {
            AtomKind::Substring(finder) => {
                let len = finder.needle().len();
                hits.extend(finder.find_iter(text).map(|start| Hit {
                    in_name,
                    start,
                    end: start + len,
                }));
            }
            AtomKind::Regexp(re) => {
                hits.extend(
                    re.find_iter(text)
                        .filter(|m| !m.is_empty())
                        .map(|m| Hit {
                            in_name,
                            start: m.start(),
                            end: m.end(),
                        }),
                );
            }
        }
    }

    fn find(&self, doc: &Document, folded: &FoldedDoc) -> Vec<Hit> {
        let mut hits = Vec::new();
        let (name, content) = if self.case_sensitive {
            (doc.name.as_bytes(), doc.content.as_bytes())
        } else {
            (folded.name.as_slice(), folded.content.as_slice())
        };
        if !self.content_only {
            self.find_in(name, true, &mut hits);
        }
        if !self.file_name_only {
            self.find_in(content, false, &mut hits);
        }
        hits
    }
}

/// Query compiled against one shard's repository
enum Node {
    Const(bool),
    Atom(usize),
    Branch(String),
    And(Vec<Node>),
    Or(Vec<Node>),
    Not(Box<Node>),
}

struct Matcher {
    root: Node,
    atoms: Vec<Atom>,
}

impl Matcher {
    fn compile(q: &Q) -> Result<Self, SearchError> {
        let mut atoms = Vec::new();
        let root = Self::compile_node(q, true, &mut atoms)?;
        Ok(Self { root, atoms })
    }

    fn compile_node(q: &Q, positive: bool, atoms: &mut Vec<Atom>) -> Result<Node, SearchError> {
        Ok(match q {
            Q::Const(b) => Node::Const(*b),
            Q::Substring(s) => {
                atoms.push(Atom::from_substring(s, positive));
                Node::Atom(atoms.len() - 1)
            }
            Q::Regexp(r) => {
                atoms.push(Atom::from_regexp(r, positive)?);
                Node::Atom(atoms.len() - 1)
            }
            Q::Branch(b) => Node::Branch(b.clone()),
            Q::And(children) => Node::And(
                children
                    .iter()
                    .map(|c| Self::compile_node(c, positive, atoms))
                    .collect::<Result<_, _>>()?,
            ),
            Q::Or(children) => Node::Or(
                children
                    .iter()
                    .map(|c| Self::compile_node(c, positive, atoms))
                    .collect::<Result<_, _>>()?,
            ),
            Q::Not(inner) => Node::Not(Box::new(Self::compile_node(inner, !positive, atoms)?)),
            // Repository atoms are resolved before compiling
            Q::Repo(_) | Q::RepoSet(_) | Q::RepoIds(_) | Q::BranchesRepos(_) | Q::RawConfig(_) => {
                Node::Const(false)
            }
        })
    }

    fn eval(node: &Node, hits: &[Vec<Hit>], doc_branches: &[String], repo: &Repository) -> bool {
        match node {
            Node::Const(b) => *b,
            Node::Atom(i) => !hits[*i].is_empty(),
            Node::Branch(b) => {
                if doc_branches.is_empty() {
                    repo.has_branch(b)
                } else {
                    doc_branches.iter().any(|d| d == b)
                }
            }
            Node::And(children) => children
                .iter()
                .all(|c| Self::eval(c, hits, doc_branches, repo)),
            Node::Or(children) => children
                .iter()
                .any(|c| Self::eval(c, hits, doc_branches, repo)),
            Node::Not(inner) => !Self::eval(inner, hits, doc_branches, repo),
        }
    }
}

/// Searcher over a single decoded shard file
pub struct ShardReader {
    name: String,
    path: Option<PathBuf>,
    shard: ShardFile,
    folded: Vec<FoldedDoc>,
    index_bytes: u64,
    avg_doc_len: f64,
    scorer: Scorer,
}

impl ShardReader {
    /// Open and decode a shard file
    pub fn open(path: &Path) -> Result<Self, SearchError> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        if len == 0 {
            return Err(SearchError::Corrupt {
                path: path.display().to_string(),
                reason: "empty file".to_string(),
            });
        }

        let mmap = unsafe { Mmap::map(&file)? };
        let shard: ShardFile =
            serde_json::from_slice(&mmap).map_err(|e| SearchError::Corrupt {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        debug!(shard = %name, documents = shard.documents.len(), "opened shard");

        let mut reader = Self::from_shard(name, shard);
        reader.path = Some(path.to_path_buf());
        reader.index_bytes = len;
        Ok(reader)
    }

    /// Build a reader from an in-memory shard
    pub fn from_shard(name: impl Into<String>, shard: ShardFile) -> Self {
        let folded: Vec<FoldedDoc> = shard.documents.iter().map(FoldedDoc::new).collect();
        let total: usize = shard.documents.iter().map(|d| d.content.len()).sum();
        let avg_doc_len = if shard.documents.is_empty() {
            0.0
        } else {
            total as f64 / shard.documents.len() as f64
        };
        let index_bytes = serde_json::to_vec(&shard).map(|v| v.len() as u64).unwrap_or(0);

        Self {
            name: name.into(),
            path: None,
            shard,
            folded,
            index_bytes,
            avg_doc_len,
            scorer: Scorer::with_defaults(),
        }
    }

    pub fn with_scorer(mut self, scorer: Scorer) -> Self {
        self.scorer = scorer;
        self
    }

    pub fn repository(&self) -> &Repository {
        &self.shard.repository
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn documents(&self) -> &[Document] {
        &self.shard.documents
    }

    fn doc_branches(&self, doc: &Document) -> Vec<String> {
        if doc.branches.is_empty() {
            self.shard
                .repository
                .branches
                .iter()
                .map(|b| b.name.clone())
                .collect()
        } else {
            doc.branches.clone()
        }
    }

    /// Turn the positive hits of a matched document into a scored file match
    fn build_file_match(
        &self,
        idx: usize,
        matcher: &Matcher,
        hits: &[Vec<Hit>],
        opts: &SearchOptions,
    ) -> FileMatch {
        let doc = &self.shard.documents[idx];
        let folded = &self.folded[idx];
        let repo = &self.shard.repository;

        let mut name_hits: Vec<Hit> = Vec::new();
        let mut content_hits: Vec<Hit> = Vec::new();
        let mut atom_count = 0;
        let mut term_frequencies: FxHashMap<String, usize> = FxHashMap::default();

        for (atom, atom_hits) in matcher.atoms.iter().zip(hits) {
            if !atom.positive || atom_hits.is_empty() {
                continue;
            }
            atom_count += 1;
            let mut tf = 0;
            for hit in atom_hits {
                if hit.in_name {
                    tf += self.scorer.weights().bm25_file_name_weight;
                    name_hits.push(*hit);
                } else {
                    tf += 1;
                    content_hits.push(*hit);
                }
            }
            *term_frequencies.entry(atom.term.clone()).or_insert(0) += tf;
        }

        let mut line_matches = Vec::new();
        if !name_hits.is_empty() {
            line_matches.push(name_line_match(&doc.name, &mut name_hits));
        }
        line_matches.extend(content_line_matches(doc, folded, &mut content_hits));

        let file_score = if opts.use_bm25_scoring {
            let ctx = Bm25Context {
                term_frequencies,
                doc_len: doc.content.len(),
                avg_doc_len: self.avg_doc_len,
            };
            self.scorer.bm25_score(&ctx, opts)
        } else {
            let ctx = ScoreContext {
                atom_count,
                line_scores: line_matches.iter().map(|l| l.score).collect(),
                doc_rank: doc.rank,
                doc_position: idx,
                doc_count: self.shard.documents.len(),
                repo_rank: repo.rank,
            };
            self.scorer.calculate_score(&ctx, opts)
        };

        for (line, score) in line_matches.iter_mut().zip(&file_score.line_scores) {
            line.score = *score;
        }

        FileMatch {
            file_name: doc.name.clone(),
            repository: repo.name.clone(),
            repository_id: repo.id,
            repository_priority: repo.priority(),
            branches: self.doc_branches(doc),
            content: opts.whole.then(|| doc.content.clone()),
            line_matches,
            score: file_score.score,
            debug: file_score.debug,
        }
    }

    /// Indices of documents matching `matcher`, stopping early on cancellation
    fn matching_documents(
        &self,
        ctx: &CancelToken,
        matcher: &Matcher,
        mut visit: impl FnMut(usize, &[Vec<Hit>]) -> bool,
    ) -> usize {
        let repo = &self.shard.repository;
        let mut considered = 0;
        for (idx, (doc, folded)) in self.shard.documents.iter().zip(&self.folded).enumerate() {
            if ctx.is_cancelled() {
                break;
            }
            considered += 1;
            let hits: Vec<Vec<Hit>> = matcher.atoms.iter().map(|a| a.find(doc, folded)).collect();
            if Matcher::eval(&matcher.root, &hits, &doc.branches, repo) && !visit(idx, &hits) {
                break;
            }
        }
        considered
    }

    fn repo_stats(&self) -> RepoStats {
        let default_branch = self.shard.repository.branches.first().map(|b| b.name.as_str());
        let mut stats = RepoStats {
            repos: 1,
            shards: 1,
            documents: self.shard.documents.len(),
            index_bytes: self.index_bytes,
            ..Default::default()
        };
        for (doc, folded) in self.shard.documents.iter().zip(&self.folded) {
            let lines = folded.newlines.len() as u64;
            stats.content_bytes += (doc.content.len() + doc.name.len()) as u64;
            stats.new_lines_count += lines;
            let on_default = doc.branches.is_empty()
                || default_branch.is_some_and(|b| doc.branches.iter().any(|d| d == b));
            if on_default {
                stats.default_branch_new_lines_count += lines;
            } else {
                stats.other_branches_new_lines_count += lines;
            }
        }
        stats
    }
}

fn name_line_match(name: &str, hits: &mut [Hit]) -> LineMatch {
    hits.sort_by_key(|h| (h.start, h.end));
    let fragments: Vec<LineFragment> = hits
        .iter()
        .map(|h| LineFragment {
            line_offset: h.start,
            offset: h.start,
            match_length: h.end - h.start,
        })
        .collect();
    let score = hits
        .iter()
        .map(|h| match_score(name.as_bytes(), h.start, h.end))
        .fold(0.0, f64::max);
    LineMatch {
        line: name.to_string(),
        line_number: 0,
        fragments,
        score,
        file_name: true,
    }
}

/// Group content hits into one line match per line, in file order
fn content_line_matches(doc: &Document, folded: &FoldedDoc, hits: &mut Vec<Hit>) -> Vec<LineMatch> {
    hits.sort_by_key(|h| (h.start, h.end));
    hits.dedup_by_key(|h| (h.start, h.end));

    let content = doc.content.as_bytes();
    let mut lines: Vec<LineMatch> = Vec::new();
    let mut current_start = usize::MAX;

    for hit in hits.iter() {
        let (line_number, start, end) = folded.line_at(hit.start, content.len());
        let line_bytes = &content[start..end];
        let line_offset = hit.start - start;
        let line_end = (hit.end - start).min(line_bytes.len());
        let score = match_score(line_bytes, line_offset, line_end);
        let fragment = LineFragment {
            line_offset,
            offset: hit.start,
            match_length: hit.end - hit.start,
        };

        if start == current_start {
            if let Some(line) = lines.last_mut() {
                line.fragments.push(fragment);
                line.score = line.score.max(score);
            }
        } else {
            current_start = start;
            lines.push(LineMatch {
                line: String::from_utf8_lossy(line_bytes).into_owned(),
                line_number,
                fragments: vec![fragment],
                score,
                file_name: false,
            });
        }
    }
    lines
}

impl Searcher for ShardReader {
    fn search(
        &self,
        ctx: &CancelToken,
        q: &Q,
        opts: &SearchOptions,
    ) -> Result<SearchResult, SearchError> {
        let repo = &self.shard.repository;
        let mut result = SearchResult::default();
        result.stats.shards_scanned = 1;
        result.stats.index_bytes_loaded = self.index_bytes;

        let q = q.simplify_for_repo(repo);
        if q.is_const(false) {
            result.stats.files_skipped = self.shard.documents.len();
            return Ok(result);
        }
        let matcher = Matcher::compile(&q)?;

        let mut files = Vec::new();
        let mut match_count = 0;
        let considered = self.matching_documents(ctx, &matcher, |idx, hits| {
            let fm = self.build_file_match(idx, &matcher, hits, opts);
            match_count += fm.match_count().max(1);
            files.push(fm);
            opts.shard_max_match_count == 0 || match_count < opts.shard_max_match_count
        });

        let stats = &mut result.stats;
        stats.files_considered = considered;
        stats.files_skipped = self.shard.documents.len() - considered;
        stats.content_bytes_loaded = self.shard.documents[..considered]
            .iter()
            .map(|d| d.content.len() as u64)
            .sum();
        stats.file_count = files.len();
        stats.files_loaded = files.len();
        stats.match_count = match_count;

        if !files.is_empty() && !repo.file_url_template.is_empty() {
            result
                .repo_urls
                .insert(repo.name.clone(), repo.file_url_template.clone());
        }

        files.sort_by(|a, b| b.score.total_cmp(&a.score));
        result.files = files;
        Ok(result)
    }

    fn list(
        &self,
        ctx: &CancelToken,
        q: &Q,
        opts: Option<&ListOptions>,
    ) -> Result<RepoList, SearchError> {
        let repo = &self.shard.repository;
        let q = q.simplify_for_repo(repo);

        let include = match q {
            Q::Const(b) => b,
            ref other => {
                let matcher = Matcher::compile(other)?;
                let mut found = false;
                self.matching_documents(ctx, &matcher, |_, _| {
                    found = true;
                    false
                });
                found
            }
        };

        let mut list = RepoList::default();
        if !include {
            return Ok(list);
        }

        let stats = self.repo_stats();
        list.stats = stats.clone();
        let field = opts.map(|o| o.field).unwrap_or_default();
        if field == RepoListField::ReposMap && repo.id != 0 {
            list.repos_map.insert(
                repo.id,
                MinimalRepoListEntry {
                    has_symbols: repo.has_symbols,
                    branches: repo.branches.clone(),
                },
            );
        } else {
            list.repos.push(RepoListEntry {
                repository: repo.clone(),
                stats,
            });
        }
        Ok(list)
    }

    fn stats(&self) -> Result<RepoStats, SearchError> {
        Ok(self.repo_stats())
    }

    fn name(&self) -> String {
        self.name.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::parse_query;

    fn doc(name: &str, content: &str) -> Document {
        Document {
            name: name.to_string(),
            content: content.to_string(),
            ..Default::default()
        }
    }

    fn reader(docs: Vec<Document>) -> ShardReader {
        let mut repo = Repository::new("github.com/acme/widgets");
        repo.id = 42;
        repo.branches.push(RepositoryBranch {
            name: "main".into(),
            version: "abc".into(),
        });
        repo.file_url_template = "https://example.com/{path}".into();
        ShardReader::from_shard(
            "widgets_v16.00000.shard",
            ShardFile {
                repository: repo,
                documents: docs,
            },
        )
    }

    fn search(reader: &ShardReader, query: &str, opts: &SearchOptions) -> SearchResult {
        let q = parse_query(query).unwrap();
        reader.search(&CancelToken::new(), &q, opts).unwrap()
    }

    #[test]
    fn test_substring_line_matches() {
        let r = reader(vec![doc("main.rs", "fn main() {\n    let foo = 1;\n}\n")]);
        let result = search(&r, "foo", &SearchOptions::default());

        assert_eq!(result.files.len(), 1);
        let fm = &result.files[0];
        assert_eq!(fm.repository, "github.com/acme/widgets");
        assert_eq!(fm.repository_id, 42);
        assert_eq!(fm.branches, vec!["main".to_string()]);
        assert_eq!(fm.line_matches.len(), 1);

        let line = &fm.line_matches[0];
        assert_eq!(line.line_number, 2);
        assert_eq!(line.line, "    let foo = 1;");
        assert_eq!(line.fragments[0].line_offset, 8);
        assert_eq!(line.fragments[0].offset, 20);
        assert_eq!(line.fragments[0].match_length, 3);
        assert_eq!(result.stats.match_count, 1);
        assert_eq!(
            result.repo_urls.get("github.com/acme/widgets").map(String::as_str),
            Some("https://example.com/{path}")
        );
    }

    #[test]
    fn test_case_insensitive_by_default() {
        let r = reader(vec![doc("a.txt", "Hello World")]);
        assert_eq!(search(&r, "hello", &SearchOptions::default()).files.len(), 1);
        assert_eq!(
            search(&r, "hello case:yes", &SearchOptions::default()).files.len(),
            0
        );
    }

    #[test]
    fn test_file_name_match() {
        let r = reader(vec![doc("foo.rs", "nothing here"), doc("bar.rs", "foo")]);
        let result = search(&r, "file:foo", &SearchOptions::default());
        assert_eq!(result.files.len(), 1);
        assert_eq!(result.files[0].file_name, "foo.rs");
        assert!(result.files[0].line_matches[0].file_name);
    }

    #[test]
    fn test_negation_and_regex() {
        let r = reader(vec![doc("a.rs", "alpha beta"), doc("b.rs", "alpha gamma")]);
        let result = search(&r, "alpha -gamma", &SearchOptions::default());
        assert_eq!(result.files.len(), 1);
        assert_eq!(result.files[0].file_name, "a.rs");

        let result = search(&r, "re:/g[a-z]+a/", &SearchOptions::default());
        assert_eq!(result.files.len(), 1);
        assert_eq!(result.files[0].file_name, "b.rs");
    }

    #[test]
    fn test_repo_filter_short_circuits() {
        let r = reader(vec![doc("a.rs", "alpha")]);
        let result = search(&r, "repo:^other alpha", &SearchOptions::default());
        assert!(result.files.is_empty());
        assert_eq!(result.stats.files_skipped, 1);

        let result = search(&r, "repo:widgets alpha", &SearchOptions::default());
        assert_eq!(result.files.len(), 1);
    }

    #[test]
    fn test_word_match_scores_higher() {
        let r = reader(vec![doc("a.rs", "foobar"), doc("b.rs", "foo bar")]);
        let result = search(&r, "foo", &SearchOptions::default());
        assert_eq!(result.files.len(), 2);
        assert_eq!(result.files[0].file_name, "b.rs");
        assert!(result.files[0].score > result.files[1].score);
    }

    #[test]
    fn test_bm25_ranking() {
        let r = reader(vec![
            doc("f1", "one two two three"),
            doc("f2", "one two one two"),
            doc("f3", "one three three three"),
        ]);
        let opts = SearchOptions {
            use_bm25_scoring: true,
            ..Default::default()
        };
        let result = search(&r, "one | three", &opts);
        let names: Vec<&str> = result.files.iter().map(|f| f.file_name.as_str()).collect();
        assert_eq!(names, vec!["f3", "f1", "f2"]);
    }

    #[test]
    fn test_shard_max_match_count() {
        let r = reader(vec![doc("a", "x"), doc("b", "x"), doc("c", "x")]);
        let opts = SearchOptions {
            shard_max_match_count: 2,
            ..Default::default()
        };
        let result = search(&r, "x", &opts);
        assert_eq!(result.files.len(), 2);
        assert_eq!(result.stats.files_skipped, 1);
    }

    #[test]
    fn test_cancelled_search_returns_nothing() {
        let r = reader(vec![doc("a", "x")]);
        let ctx = CancelToken::new();
        ctx.cancel();
        let result = r
            .search(&ctx, &Q::substring("x"), &SearchOptions::default())
            .unwrap();
        assert!(result.files.is_empty());
        assert_eq!(result.stats.files_skipped, 1);
    }

    #[test]
    fn test_list_and_stats() {
        let r = reader(vec![doc("a", "one\ntwo\n"), doc("b", "three\n")]);
        let list = r
            .list(&CancelToken::new(), &Q::Const(true), None)
            .unwrap();
        assert_eq!(list.repos.len(), 1);
        assert_eq!(list.stats.documents, 2);
        assert_eq!(list.stats.new_lines_count, 3);
        assert_eq!(list.stats.content_bytes, 16);

        let list = r
            .list(&CancelToken::new(), &Q::substring("nope"), None)
            .unwrap();
        assert!(list.repos.is_empty());

        let opts = ListOptions {
            field: RepoListField::ReposMap,
        };
        let list = r
            .list(&CancelToken::new(), &Q::Const(true), Some(&opts))
            .unwrap();
        assert!(list.repos.is_empty());
        assert!(list.repos_map.contains_key(&42));
    }

    #[test]
    fn test_whole_and_debug() {
        let r = reader(vec![doc("a", "needle")]);
        let opts = SearchOptions {
            whole: true,
            debug_score: true,
            ..Default::default()
        };
        let result = search(&r, "needle", &opts);
        assert_eq!(result.files[0].content.as_deref(), Some("needle"));
        assert!(result.files[0].debug.as_deref().unwrap().contains("fragment"));
    }
}
