use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use shardex::index::builder::build_shard_from_dir;
use shardex::index::stats::show_stats;
use shardex::index::types::{ListOptions, RepoListField, Repository, SearchOptions};
use shardex::index::Searcher;
use shardex::output::{self, PrintOptions};
use shardex::query::parse_query;
use shardex::search::{CancelToken, SearchConfig};
use shardex::server::{DirectorySearcher, WatcherConfig};
use shardex::utils::get_default_shard_dir;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "shardex")]
#[command(about = "Ranked code search over a directory of index shards")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build a shard from a source tree
    Index {
        /// Source tree to index
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Repository name (defaults to the directory name)
        #[arg(short, long)]
        repo: Option<String>,

        /// Shard directory to write into
        #[arg(short, long)]
        dir: Option<PathBuf>,

        /// Shard version; a higher version replaces older ones
        #[arg(long, default_value_t = 1)]
        version: u32,
    },
    /// Search all shards
    Search {
        /// Search query
        #[arg(required = true, trailing_var_arg = true)]
        query: Vec<String>,

        /// Shard directory
        #[arg(short, long)]
        dir: Option<PathBuf>,

        /// Maximum number of files to show
        #[arg(short = 'n', long, default_value_t = 50)]
        limit: usize,

        /// Rank with BM25 instead of the additive model
        #[arg(long)]
        bm25: bool,

        /// Use per-document ranks
        #[arg(long)]
        doc_ranks: bool,

        /// Print file names only
        #[arg(short = 'l', long)]
        files_with_matches: bool,

        /// Print the number of matches per file
        #[arg(short, long)]
        count: bool,

        /// Group lines under a file heading and show scores
        #[arg(long)]
        heading: bool,

        /// Include the score breakdown
        #[arg(long)]
        debug_score: bool,

        /// Print the raw result as JSON
        #[arg(long)]
        json: bool,
    },
    /// List repositories matching a query
    List {
        /// Query restricting the listed repositories
        query: Vec<String>,

        #[arg(short, long)]
        dir: Option<PathBuf>,

        /// Only print repository ids
        #[arg(long)]
        minimal: bool,

        #[arg(long)]
        json: bool,
    },
    /// Show shard statistics
    Stats {
        #[arg(short, long)]
        dir: Option<PathBuf>,
    },
    /// Load a shard directory and follow changes until interrupted
    Watch {
        #[arg(short, long)]
        dir: Option<PathBuf>,
    },
}

fn init_logging() {
    let filter = std::env::var("SHARDEX_LOG")
        .ok()
        .and_then(|v| EnvFilter::try_new(v).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn shard_dir(dir: Option<PathBuf>) -> Result<PathBuf> {
    match dir {
        Some(dir) => Ok(dir),
        None => get_default_shard_dir(),
    }
}

fn open(dir: &Path) -> Result<DirectorySearcher> {
    DirectorySearcher::open(dir, &SearchConfig::load(), WatcherConfig::load())
        .with_context(|| format!("Failed to open shard directory {}", dir.display()))
}

fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    match cli.command {
        Commands::Index {
            path,
            repo,
            dir,
            version,
        } => {
            let name = match repo {
                Some(name) => name,
                None => path
                    .canonicalize()?
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .context("Cannot derive a repository name, pass --repo")?,
            };
            let out = shard_dir(dir)?;
            let shard = build_shard_from_dir(&path, Repository::new(name), &out, version)?;
            println!("Wrote {}", shard.display());
        }
        Commands::Search {
            query,
            dir,
            limit,
            bm25,
            doc_ranks,
            files_with_matches,
            count,
            heading,
            debug_score,
            json,
        } => {
            let q = parse_query(&query.join(" "))?;
            let searcher = open(&shard_dir(dir)?)?;
            let opts = SearchOptions {
                use_bm25_scoring: bm25,
                use_document_ranks: doc_ranks,
                max_doc_display_count: limit,
                debug_score,
                ..SearchConfig::load().search_options()
            };

            let result = searcher.search(&CancelToken::new(), &q, &opts)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else if files_with_matches {
                output::print_files_only(&result.files, true)?;
            } else if count {
                output::print_match_counts(&result.files, true)?;
            } else {
                output::print_file_matches(
                    &result.files,
                    PrintOptions {
                        color: true,
                        heading,
                        scores: heading || debug_score,
                    },
                )?;
                output::print_stats_summary(&result.stats, result.files.len())?;
            }
        }
        Commands::List {
            query,
            dir,
            minimal,
            json,
        } => {
            let q = parse_query(&query.join(" "))?;
            let searcher = open(&shard_dir(dir)?)?;
            let opts = ListOptions {
                field: if minimal {
                    RepoListField::ReposMap
                } else {
                    RepoListField::Repos
                },
            };
            let list = searcher.list(&CancelToken::new(), &q, Some(&opts))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&list)?);
            } else {
                output::print_repo_list(&list, true)?;
            }
        }
        Commands::Stats { dir } => {
            let dir = shard_dir(dir)?;
            let searcher = open(&dir)?;
            show_stats(&searcher, &dir)?;
        }
        Commands::Watch { dir } => {
            let dir = shard_dir(dir)?;
            let searcher = open(&dir)?;
            info!(dir = %dir.display(), "watching, press Ctrl+C to stop");

            let mut last = usize::MAX;
            loop {
                let shards = searcher.registry().len();
                if shards != last {
                    info!(shards, "active shards");
                    last = shards;
                }
                std::thread::sleep(Duration::from_secs(1));
            }
        }
    }

    Ok(())
}
