//! Shard file writer
//!
//! Shards are written to a temporary file and renamed into place so a
//! directory watcher never observes a partially written shard.

use crate::index::types::{Document, Repository, ShardFile};
use anyhow::{Context, Result};
use ignore::WalkBuilder;
use rayon::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Default extension of shard files
pub const SHARD_EXTENSION: &str = "shard";

/// Files larger than this are not indexed
pub const MAX_FILE_SIZE: u64 = 1 << 20;

/// File name for a shard: `<escaped-repo-name>_v<version>.<shardnum:05>.<ext>`
pub fn shard_file_name(repo_name: &str, version: u32, shard_num: u32, ext: &str) -> String {
    format!(
        "{}_v{}.{:05}.{}",
        escape_repo_name(repo_name),
        version,
        shard_num,
        ext
    )
}

/// Escape characters that cannot appear in a file name
pub fn escape_repo_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for ch in name.chars() {
        match ch {
            '/' => out.push_str("%2F"),
            '%' => out.push_str("%25"),
            '\\' => out.push_str("%5C"),
            ':' => out.push_str("%3A"),
            _ => out.push(ch),
        }
    }
    out
}

/// Accumulates documents for one repository
#[derive(Debug, Clone)]
pub struct ShardBuilder {
    shard: ShardFile,
}

impl ShardBuilder {
    pub fn new(repository: Repository) -> Self {
        Self {
            shard: ShardFile {
                repository,
                documents: Vec::new(),
            },
        }
    }

    pub fn add(&mut self, doc: Document) -> &mut Self {
        self.shard.documents.push(doc);
        self
    }

    pub fn add_file(&mut self, name: impl Into<String>, content: impl Into<String>) -> &mut Self {
        self.add(Document {
            name: name.into(),
            content: content.into(),
            ..Default::default()
        })
    }

    pub fn doc_count(&self) -> usize {
        self.shard.documents.len()
    }

    pub fn finish(self) -> ShardFile {
        self.shard
    }

    /// Write the shard into `dir` under its conventional file name
    pub fn write(&self, dir: &Path, version: u32, shard_num: u32) -> Result<PathBuf> {
        let name = shard_file_name(
            &self.shard.repository.name,
            version,
            shard_num,
            SHARD_EXTENSION,
        );
        let path = dir.join(name);
        self.write_to(&path)?;
        Ok(path)
    }

    /// Write the shard to an explicit path
    pub fn write_to(&self, path: &Path) -> Result<()> {
        let data = serde_json::to_vec(&self.shard).context("Failed to serialize shard")?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, data)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, path)
            .with_context(|| format!("Failed to move shard into place at {}", path.display()))?;
        debug!(path = %path.display(), documents = self.doc_count(), "wrote shard");
        Ok(())
    }
}

/// Check if content looks like a binary file
fn is_binary(content: &[u8]) -> bool {
    let sample = &content[..content.len().min(8192)];
    memchr::memchr(0, sample).is_some()
}

/// Index every text file under `root` into a single shard in `out_dir`
pub fn build_shard_from_dir(
    root: &Path,
    repository: Repository,
    out_dir: &Path,
    version: u32,
) -> Result<PathBuf> {
    let root = root.canonicalize().context("Invalid path")?;
    fs::create_dir_all(out_dir)
        .with_context(|| format!("Failed to create {}", out_dir.display()))?;

    let walker = WalkBuilder::new(&root)
        .hidden(true)
        .git_ignore(true)
        .git_global(true)
        .git_exclude(true)
        .filter_entry(|entry| {
            let name = entry.file_name().to_string_lossy();
            !matches!(
                name.as_ref(),
                ".git" | "node_modules" | "target" | "__pycache__" | ".venv" | "venv"
            )
        })
        .build();

    let mut paths: Vec<(PathBuf, String)> = walker
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_file())
        .filter_map(|entry| {
            let path = entry.path().to_path_buf();
            let rel = path.strip_prefix(&root).ok()?.to_string_lossy().replace('\\', "/");
            Some((path, rel))
        })
        .collect();
    // Deterministic document order
    paths.sort_by(|a, b| a.1.cmp(&b.1));

    let documents: Vec<Document> = paths
        .par_iter()
        .filter_map(|(path, rel)| {
            let content = fs::read(path).ok()?;
            if content.len() as u64 > MAX_FILE_SIZE || is_binary(&content) {
                return None;
            }
            let content = String::from_utf8(content).ok()?;
            Some(Document {
                name: rel.clone(),
                content,
                ..Default::default()
            })
        })
        .collect();

    info!(
        root = %root.display(),
        files = documents.len(),
        skipped = paths.len() - documents.len(),
        "indexed directory"
    );

    let mut builder = ShardBuilder::new(repository);
    for doc in documents {
        builder.add(doc);
    }
    builder.write(out_dir, version, 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_shard_file_name() {
        assert_eq!(
            shard_file_name("github.com/acme/widgets", 16, 0, "shard"),
            "github.com%2Facme%2Fwidgets_v16.00000.shard"
        );
    }

    #[test]
    fn test_write_and_read_back() {
        let dir = TempDir::new().unwrap();
        let mut builder = ShardBuilder::new(Repository::new("repo"));
        builder.add_file("a.rs", "fn a() {}").add_file("b.rs", "fn b() {}");

        let path = builder.write(dir.path(), 1, 3).unwrap();
        assert_eq!(path.file_name().unwrap(), "repo_v1.00003.shard");
        assert!(!path.with_extension("tmp").exists());

        let data = fs::read(&path).unwrap();
        let shard: ShardFile = serde_json::from_slice(&data).unwrap();
        assert_eq!(shard.documents.len(), 2);
        assert_eq!(shard.documents[1].name, "b.rs");
    }

    #[test]
    fn test_build_from_dir_skips_binary() {
        let src = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        fs::write(src.path().join("main.rs"), "fn main() {}").unwrap();
        fs::create_dir(src.path().join("sub")).unwrap();
        fs::write(src.path().join("sub/lib.rs"), "pub fn lib() {}").unwrap();
        fs::write(src.path().join("blob.bin"), [0u8, 1, 2, 3]).unwrap();

        let path = build_shard_from_dir(src.path(), Repository::new("demo"), out.path(), 1).unwrap();
        let shard: ShardFile = serde_json::from_slice(&fs::read(path).unwrap()).unwrap();
        let names: Vec<&str> = shard.documents.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["main.rs", "sub/lib.rs"]);
    }
}
