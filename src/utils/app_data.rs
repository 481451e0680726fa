use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::warn;

const APP_NAME: &str = "shardex";
const CONFIG_FILE: &str = "config.toml";

/// Configuration file format (TOML)
/// Located at ~/Library/Application Support/shardex/config.toml (macOS)
/// or %LOCALAPPDATA%/shardex/config.toml (Windows)
/// or ~/.local/share/shardex/config.toml (Linux)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub search: SearchConfigFile,
    #[serde(default)]
    pub watcher: WatcherConfigFile,
}

/// `[search]` section
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchConfigFile {
    /// Worker threads per query (0 = number of CPUs)
    pub workers: Option<usize>,
    /// Collect-and-rank window for streaming searches, in milliseconds
    pub flush_wall_ms: Option<u64>,
    /// Abandon shards still running after this many milliseconds
    pub max_wall_ms: Option<u64>,
}

/// `[watcher]` section
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WatcherConfigFile {
    pub debounce_ms: Option<u64>,
    pub rescan_interval_secs: Option<u64>,
    pub shard_pattern: Option<String>,
}

impl ConfigFile {
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse config file")
    }

    /// Load the config file from the app data directory
    /// Returns None if the file doesn't exist or can't be parsed
    pub fn load() -> Option<Self> {
        let config_path = get_config_path().ok()?;
        if !config_path.exists() {
            return None;
        }

        let content = fs::read_to_string(&config_path).ok()?;
        match Self::parse(&content) {
            Ok(config) => Some(config),
            Err(e) => {
                warn!(path = %config_path.display(), error = %e, "ignoring invalid config file");
                None
            }
        }
    }
}

/// Parsed value of an environment variable, if set and valid
pub fn env_override<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

/// Get the number of CPUs available
pub fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// Get the path to the config file
pub fn get_config_path() -> Result<PathBuf> {
    let app_dir = get_app_data_dir()?;
    Ok(app_dir.join(CONFIG_FILE))
}

/// Get the application data directory
pub fn get_app_data_dir() -> Result<PathBuf> {
    let base = if cfg!(target_os = "macos") {
        dirs::home_dir().map(|h| h.join("Library").join("Application Support"))
    } else if cfg!(target_os = "windows") {
        dirs::data_local_dir()
    } else {
        // Linux/Unix: use XDG_DATA_HOME or ~/.local/share
        dirs::data_dir()
    };

    let base = base.context("Could not determine app data directory")?;
    let app_dir = base.join(APP_NAME);

    fs::create_dir_all(&app_dir)?;
    Ok(app_dir)
}

/// Default directory holding shard files
pub fn get_default_shard_dir() -> Result<PathBuf> {
    let dir = get_app_data_dir()?.join("shards");
    fs::create_dir_all(&dir)?;
    Ok(dir)
}
