//! Query tree evaluated by shards
//!
//! Content atoms (`Substring`, `Regexp`) are matched per document. Repository
//! atoms (`Repo`, `RepoSet`, `RepoIds`, `BranchesRepos`, `RawConfig`) depend
//! only on shard metadata and are resolved up front by [`Q::simplify_for_repo`].

use crate::error::SearchError;
use crate::index::types::{RAW_ARCHIVED, RAW_FORK, RAW_PUBLIC, RepoId, Repository};
use regex::{Regex, RegexBuilder};
use roaring::RoaringBitmap;
use std::collections::BTreeSet;
use std::fmt;

/// Literal substring atom
#[derive(Debug, Clone)]
pub struct Substring {
    pub pattern: String,
    pub case_sensitive: bool,
    /// Only match file names
    pub file_name: bool,
    /// Only match file content
    pub content: bool,
}

impl Substring {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            case_sensitive: false,
            file_name: false,
            content: false,
        }
    }

    pub fn file_name(pattern: impl Into<String>) -> Self {
        Self {
            file_name: true,
            ..Self::new(pattern)
        }
    }

    pub fn content(pattern: impl Into<String>) -> Self {
        Self {
            content: true,
            ..Self::new(pattern)
        }
    }
}

/// Regular expression atom
#[derive(Debug, Clone)]
pub struct RegexpQuery {
    pub regex: Regex,
    pub case_sensitive: bool,
    pub file_name: bool,
    pub content: bool,
}

impl RegexpQuery {
    pub fn new(pattern: &str, case_sensitive: bool) -> Result<Self, SearchError> {
        let regex = RegexBuilder::new(pattern)
            .case_insensitive(!case_sensitive)
            .build()
            .map_err(|e| SearchError::InvalidQuery(e.to_string()))?;
        Ok(Self {
            regex,
            case_sensitive,
            file_name: false,
            content: false,
        })
    }
}

/// Repositories indexed on a given branch
#[derive(Debug, Clone, PartialEq)]
pub struct BranchRepos {
    pub branch: String,
    pub repos: RoaringBitmap,
}

/// Visibility flags evaluated against a repository's raw config
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct RawConfig(pub u8);

impl RawConfig {
    pub const ONLY_PUBLIC: u8 = 1 << 0;
    pub const ONLY_PRIVATE: u8 = 1 << 1;
    pub const NO_FORKS: u8 = 1 << 2;
    pub const ONLY_FORKS: u8 = 1 << 3;
    pub const NO_ARCHIVED: u8 = 1 << 4;
    pub const ONLY_ARCHIVED: u8 = 1 << 5;

    pub fn has(&self, flag: u8) -> bool {
        self.0 & flag != 0
    }

    /// True when the repository passes every set flag
    pub fn matches(&self, repo: &Repository) -> bool {
        let public = repo.raw_flag(RAW_PUBLIC);
        let fork = repo.raw_flag(RAW_FORK);
        let archived = repo.raw_flag(RAW_ARCHIVED);

        !(self.has(Self::ONLY_PUBLIC) && !public
            || self.has(Self::ONLY_PRIVATE) && public
            || self.has(Self::NO_FORKS) && fork
            || self.has(Self::ONLY_FORKS) && !fork
            || self.has(Self::NO_ARCHIVED) && archived
            || self.has(Self::ONLY_ARCHIVED) && !archived)
    }
}

impl fmt::Display for RawConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Self::ONLY_PUBLIC, "onlyPublic"),
            (Self::ONLY_PRIVATE, "onlyPrivate"),
            (Self::NO_FORKS, "noForks"),
            (Self::ONLY_FORKS, "onlyForks"),
            (Self::NO_ARCHIVED, "noArchived"),
            (Self::ONLY_ARCHIVED, "onlyArchived"),
        ];
        let set: Vec<&str> = names
            .iter()
            .filter(|(flag, _)| self.has(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "rawConfig:{}", set.join("|"))
    }
}

/// Query tree
#[derive(Debug, Clone)]
pub enum Q {
    Const(bool),
    Substring(Substring),
    Regexp(RegexpQuery),
    And(Vec<Q>),
    Or(Vec<Q>),
    Not(Box<Q>),
    /// Repository name regex
    Repo(Regex),
    /// Exact repository names
    RepoSet(BTreeSet<String>),
    RepoIds(RoaringBitmap),
    BranchesRepos(Vec<BranchRepos>),
    /// Documents on a branch
    Branch(String),
    RawConfig(RawConfig),
}

impl Q {
    pub fn substring(pattern: impl Into<String>) -> Q {
        Q::Substring(Substring::new(pattern))
    }

    pub fn repo_regex(pattern: &str) -> Result<Q, SearchError> {
        Regex::new(pattern)
            .map(Q::Repo)
            .map_err(|e| SearchError::InvalidQuery(e.to_string()))
    }

    pub fn repo_set<I, S>(names: I) -> Q
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Q::RepoSet(names.into_iter().map(Into::into).collect())
    }

    pub fn repo_ids<I: IntoIterator<Item = RepoId>>(ids: I) -> Q {
        Q::RepoIds(ids.into_iter().collect())
    }

    /// Reject queries no shard can evaluate
    pub fn validate(&self) -> Result<(), SearchError> {
        match self {
            Q::Substring(s) if s.pattern.is_empty() => {
                Err(SearchError::InvalidQuery("empty substring".to_string()))
            }
            Q::Substring(s) if s.file_name && s.content => Err(SearchError::InvalidQuery(
                "substring cannot be restricted to both file name and content".to_string(),
            )),
            Q::Branch(b) if b.is_empty() => {
                Err(SearchError::InvalidQuery("empty branch".to_string()))
            }
            Q::And(children) | Q::Or(children) => children.iter().try_for_each(Q::validate),
            Q::Not(inner) => inner.validate(),
            _ => Ok(()),
        }
    }

    /// Resolve repository atoms against `repo` and fold constants
    pub fn simplify_for_repo(&self, repo: &Repository) -> Q {
        let resolved = match self {
            Q::Repo(re) => Q::Const(re.is_match(&repo.name)),
            Q::RepoSet(names) => Q::Const(names.contains(&repo.name)),
            Q::RepoIds(ids) => Q::Const(ids.contains(repo.id)),
            Q::RawConfig(rc) => Q::Const(rc.matches(repo)),
            Q::BranchesRepos(list) => {
                let branches: Vec<Q> = list
                    .iter()
                    .filter(|br| br.repos.contains(repo.id) && repo.has_branch(&br.branch))
                    .map(|br| Q::Branch(br.branch.clone()))
                    .collect();
                Q::Or(branches)
            }
            Q::Branch(b) if !repo.has_branch(b) => Q::Const(false),
            Q::And(children) => {
                Q::And(children.iter().map(|c| c.simplify_for_repo(repo)).collect())
            }
            Q::Or(children) => Q::Or(children.iter().map(|c| c.simplify_for_repo(repo)).collect()),
            Q::Not(inner) => Q::Not(Box::new(inner.simplify_for_repo(repo))),
            other => other.clone(),
        };
        resolved.simplify()
    }

    /// Constant folding and flattening of nested and/or nodes
    pub fn simplify(self) -> Q {
        match self {
            Q::And(children) => {
                let mut out = Vec::with_capacity(children.len());
                for child in children.into_iter().map(Q::simplify) {
                    match child {
                        Q::Const(true) => {}
                        Q::Const(false) => return Q::Const(false),
                        Q::And(nested) => out.extend(nested),
                        other => out.push(other),
                    }
                }
                match out.len() {
                    0 => Q::Const(true),
                    1 => out.swap_remove(0),
                    _ => Q::And(out),
                }
            }
            Q::Or(children) => {
                let mut out = Vec::with_capacity(children.len());
                for child in children.into_iter().map(Q::simplify) {
                    match child {
                        Q::Const(false) => {}
                        Q::Const(true) => return Q::Const(true),
                        Q::Or(nested) => out.extend(nested),
                        other => out.push(other),
                    }
                }
                match out.len() {
                    0 => Q::Const(false),
                    1 => out.swap_remove(0),
                    _ => Q::Or(out),
                }
            }
            Q::Not(inner) => match inner.simplify() {
                Q::Const(b) => Q::Const(!b),
                Q::Not(double) => *double,
                other => Q::Not(Box::new(other)),
            },
            other => other,
        }
    }

    /// Whether this is a match-all constant
    pub fn is_const(&self, value: bool) -> bool {
        matches!(self, Q::Const(b) if *b == value)
    }

    /// Number of content atoms (substrings and regexes) in the tree
    pub fn atom_count(&self) -> usize {
        match self {
            Q::Substring(_) | Q::Regexp(_) => 1,
            Q::And(children) | Q::Or(children) => children.iter().map(Q::atom_count).sum(),
            Q::Not(inner) => inner.atom_count(),
            _ => 0,
        }
    }
}

impl fmt::Display for Q {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn list(f: &mut fmt::Formatter<'_>, op: &str, children: &[Q]) -> fmt::Result {
            write!(f, "({op}")?;
            for child in children {
                write!(f, " {child}")?;
            }
            write!(f, ")")
        }

        match self {
            Q::Const(b) => write!(f, "const:{b}"),
            Q::Substring(s) => {
                let prefix = if s.file_name {
                    "file_"
                } else if s.content {
                    "content_"
                } else {
                    ""
                };
                let case = if s.case_sensitive { "case_" } else { "" };
                write!(f, "{prefix}{case}substr:{:?}", s.pattern)
            }
            Q::Regexp(r) => {
                let prefix = if r.file_name { "file_" } else { "" };
                write!(f, "{prefix}regex:{:?}", r.regex.as_str())
            }
            Q::And(children) => list(f, "and", children),
            Q::Or(children) => list(f, "or", children),
            Q::Not(inner) => write!(f, "(not {inner})"),
            Q::Repo(re) => write!(f, "repo:{}", re.as_str()),
            Q::RepoSet(names) => {
                let names: Vec<&str> = names.iter().map(String::as_str).collect();
                write!(f, "reposet:{}", names.join(","))
            }
            Q::RepoIds(ids) => write!(f, "repoids:{}", ids.len()),
            Q::BranchesRepos(list) => {
                let parts: Vec<String> = list
                    .iter()
                    .map(|br| format!("{}:{}", br.branch, br.repos.len()))
                    .collect();
                write!(f, "branchesrepos:{}", parts.join(","))
            }
            Q::Branch(b) => write!(f, "branch:{b:?}"),
            Q::RawConfig(rc) => write!(f, "{rc}"),
        }
    }
}
