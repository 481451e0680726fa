use crate::index::searcher::Searcher;
use crate::index::types::RepoStats;
use anyhow::Result;
use std::fmt::Write as _;
use std::path::Path;

/// Display statistics for the shards loaded by `searcher` from `dir`
pub fn show_stats(searcher: &dyn Searcher, dir: &Path) -> Result<()> {
    let stats = searcher.stats()?;
    let on_disk = dir_size(dir).unwrap_or(0);

    println!("Shard Statistics");
    println!("================");
    println!();
    println!("Shard directory:  {}", dir.display());
    print!("{}", format_stats(&stats, on_disk));
    Ok(())
}

/// Render repository statistics as aligned `label: value` lines
pub fn format_stats(stats: &RepoStats, on_disk: u64) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Repositories:     {}", stats.repos);
    let _ = writeln!(out, "Shards:           {}", stats.shards);
    let _ = writeln!(out, "Documents:        {}", stats.documents);
    let _ = writeln!(out, "Content size:     {}", format_size(stats.content_bytes));
    let _ = writeln!(out, "Index size:       {}", format_size(stats.index_bytes));
    let _ = writeln!(out, "On disk:          {}", format_size(on_disk));
    let _ = writeln!(out, "Lines:            {}", stats.new_lines_count);
    let _ = writeln!(
        out,
        "  default branch: {}",
        stats.default_branch_new_lines_count
    );
    let _ = writeln!(
        out,
        "  other branches: {}",
        stats.other_branches_new_lines_count
    );
    out
}

/// Total size of the files directly inside `path`
fn dir_size(path: &Path) -> std::io::Result<u64> {
    let mut size = 0;
    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        let metadata = entry.metadata()?;
        if metadata.is_file() {
            size += metadata.len();
        }
    }
    Ok(size)
}

/// Format byte size to human readable
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}
