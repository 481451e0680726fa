//! Shard directory watcher
//!
//! Keeps a loader in sync with a directory of shard files. Each rescan lists
//! the files matching the shard pattern, keeps only the newest version of
//! every logical shard, and diffs the result against the previous scan.
//! Filesystem events only decide *when* to rescan.

use crate::server::debouncer::{ChangeKind, EventDebouncer};
use crate::utils::app_data::{ConfigFile, env_override};
use anyhow::{Context, Result, bail};
use globset::{Glob, GlobMatcher};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, info, warn};

pub const DEFAULT_DEBOUNCE_MS: u64 = 100;
pub const DEFAULT_RESCAN_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_SHARD_PATTERN: &str = "*.shard";

/// Upper bound on how long the watcher thread sleeps between shutdown checks
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Receives shard lifecycle notifications. Keys are full file paths.
///
/// Calls come from the watcher thread only, but implementations must tolerate
/// repeated keys.
pub trait Loader: Send + Sync {
    fn load(&self, keys: &[String]);
    fn unload(&self, keys: &[String]);
}

/// Configuration for the directory watcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatcherConfig {
    /// Quiet period before a burst of events triggers a rescan
    pub debounce_ms: u64,
    /// Full rescan interval, in case events are missed (0 disables)
    pub rescan_interval_secs: u64,
    pub shard_pattern: String,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            rescan_interval_secs: DEFAULT_RESCAN_INTERVAL_SECS,
            shard_pattern: DEFAULT_SHARD_PATTERN.to_string(),
        }
    }
}

impl WatcherConfig {
    /// Load config with priority: environment variables > config file > defaults
    pub fn load() -> Self {
        let mut config = Self::default();
        if let Some(file) = ConfigFile::load() {
            config.apply_file(&file);
        }
        if let Some(v) = env_override("SHARDEX_DEBOUNCE_MS") {
            config.debounce_ms = v;
        }
        if let Some(v) = env_override("SHARDEX_RESCAN_SECS") {
            config.rescan_interval_secs = v;
        }
        config
    }

    pub fn apply_file(&mut self, file: &ConfigFile) {
        if let Some(v) = file.watcher.debounce_ms {
            self.debounce_ms = v;
        }
        if let Some(v) = file.watcher.rescan_interval_secs {
            self.rescan_interval_secs = v;
        }
        if let Some(v) = &file.watcher.shard_pattern {
            self.shard_pattern = v.clone();
        }
    }

    pub fn debounce_duration(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn rescan_interval(&self) -> Option<Duration> {
        (self.rescan_interval_secs > 0).then(|| Duration::from_secs(self.rescan_interval_secs))
    }
}

/// A shard file name split into `{name}_v{version}.{shardnum}.{ext}`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardName {
    /// Logical shard name; all versions of one repository share it
    pub name: String,
    pub version: u32,
}

impl ShardName {
    /// Parse a file name. Names without a `_v<N>` suffix are version 0 and
    /// keep the whole file name as their logical name.
    pub fn parse(file_name: &str) -> Self {
        let unversioned = || Self {
            name: file_name.to_string(),
            version: 0,
        };

        let Some(und) = file_name.rfind("_v") else {
            return unversioned();
        };
        let rest = &file_name[und + 2..];
        let digits = rest.find('.').map_or(rest, |dot| &rest[..dot]);
        match digits.parse::<u32>() {
            Ok(version) => Self {
                name: file_name[..und].to_string(),
                version,
            },
            Err(_) => unversioned(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Fingerprint {
    modified: Option<SystemTime>,
    len: u64,
}

/// Keys to unload and to load after one rescan
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanDiff {
    pub unload: Vec<String>,
    pub load: Vec<String>,
}

impl ScanDiff {
    pub fn is_empty(&self) -> bool {
        self.unload.is_empty() && self.load.is_empty()
    }
}

/// Mutable watcher state, owned by whichever thread performs scans
struct ScanState {
    dir: PathBuf,
    matcher: GlobMatcher,
    loader: Arc<dyn Loader>,
    known: HashMap<String, Fingerprint>,
}

impl ScanState {
    fn matches(&self, path: &Path) -> bool {
        path.file_name()
            .is_some_and(|name| self.matcher.is_match(Path::new(name)))
    }

    /// List the newest version of every shard in the directory
    fn scan(&self) -> Result<HashMap<String, Fingerprint>> {
        let entries = fs::read_dir(&self.dir)
            .with_context(|| format!("Failed to read shard directory {}", self.dir.display()))?;

        let mut latest: HashMap<String, (u32, Vec<(String, Fingerprint)>)> = HashMap::new();
        for entry in entries {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!(error = %e, "skipping unreadable directory entry");
                    continue;
                }
            };
            let path = entry.path();
            if !self.matches(&path) {
                continue;
            }
            let metadata = match entry.metadata() {
                Ok(m) if m.is_file() => m,
                Ok(_) => continue,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to stat shard file");
                    continue;
                }
            };

            let file_name = entry.file_name().to_string_lossy().into_owned();
            let shard = ShardName::parse(&file_name);
            let fingerprint = Fingerprint {
                modified: metadata.modified().ok(),
                len: metadata.len(),
            };
            let key = path.to_string_lossy().into_owned();

            let slot = latest.entry(shard.name).or_insert((shard.version, Vec::new()));
            if shard.version > slot.0 {
                *slot = (shard.version, Vec::new());
            }
            if shard.version == slot.0 {
                slot.1.push((key, fingerprint));
            }
        }

        Ok(latest
            .into_values()
            .flat_map(|(_, files)| files)
            .collect())
    }

    fn diff(&self, current: &HashMap<String, Fingerprint>) -> ScanDiff {
        let mut diff = ScanDiff::default();
        for key in self.known.keys() {
            if !current.contains_key(key) {
                diff.unload.push(key.clone());
            }
        }
        for (key, fingerprint) in current {
            if self.known.get(key) != Some(fingerprint) {
                diff.load.push(key.clone());
            }
        }
        diff.unload.sort();
        diff.load.sort();
        diff
    }

    /// Scan, notify the loader of the differences and remember the new state
    fn rescan(&mut self) -> Result<ScanDiff> {
        let current = self.scan()?;
        let diff = self.diff(&current);

        if !diff.unload.is_empty() {
            info!(count = diff.unload.len(), "unloading shards");
            self.loader.unload(&diff.unload);
        }
        if !diff.load.is_empty() {
            info!(count = diff.load.len(), "loading shards");
            self.loader.load(&diff.load);
        }

        self.known = current;
        Ok(diff)
    }

    fn rescan_logged(&mut self) {
        if let Err(e) = self.rescan() {
            warn!(dir = %self.dir.display(), error = %e, "shard directory scan failed");
        }
    }
}

/// Handle to a running directory watcher. Dropping it stops the watcher.
pub struct DirectoryWatcher {
    dir: PathBuf,
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl DirectoryWatcher {
    /// Scan `dir` once, deliver the initial shard set to `loader`, then keep
    /// watching on a background thread.
    pub fn new(dir: &Path, loader: Arc<dyn Loader>, config: WatcherConfig) -> Result<Self> {
        let mut state = Self::prepare(dir, loader, &config)?;
        state.rescan()?;
        Self::spawn(state, config, None)
    }

    /// Like [`DirectoryWatcher::new`], but the initial scan runs on the
    /// watcher thread and `on_ready` is called once it has completed.
    pub fn new_background<F>(
        dir: &Path,
        loader: Arc<dyn Loader>,
        config: WatcherConfig,
        on_ready: F,
    ) -> Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let state = Self::prepare(dir, loader, &config)?;
        Self::spawn(state, config, Some(Box::new(on_ready)))
    }

    fn prepare(dir: &Path, loader: Arc<dyn Loader>, config: &WatcherConfig) -> Result<ScanState> {
        if !dir.is_dir() {
            bail!("Shard directory does not exist: {}", dir.display());
        }
        let matcher = Glob::new(&config.shard_pattern)
            .with_context(|| format!("Invalid shard pattern: {}", config.shard_pattern))?
            .compile_matcher();

        Ok(ScanState {
            dir: dir.to_path_buf(),
            matcher,
            loader,
            known: HashMap::new(),
        })
    }

    fn spawn(
        state: ScanState,
        config: WatcherConfig,
        on_ready: Option<Box<dyn FnOnce() + Send>>,
    ) -> Result<Self> {
        let dir = state.dir.clone();
        let shutdown = Arc::new(AtomicBool::new(false));
        let thread_shutdown = Arc::clone(&shutdown);

        let thread = thread::Builder::new()
            .name("shardex-watcher".to_string())
            .spawn(move || run_watcher_thread(state, config, on_ready, thread_shutdown))
            .context("Failed to spawn watcher thread")?;

        Ok(Self {
            dir,
            shutdown,
            thread: Some(thread),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Stop watching. No scan starts after this returns.
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                warn!(dir = %self.dir.display(), "watcher thread panicked");
            }
            debug!(dir = %self.dir.display(), "watcher stopped");
        }
    }
}

impl Drop for DirectoryWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn change_kind(kind: &EventKind) -> Option<ChangeKind> {
    match kind {
        EventKind::Create(_) => Some(ChangeKind::Created),
        EventKind::Modify(_) => Some(ChangeKind::Modified),
        EventKind::Remove(_) => Some(ChangeKind::Deleted),
        _ => None,
    }
}

fn run_watcher_thread(
    mut state: ScanState,
    config: WatcherConfig,
    on_ready: Option<Box<dyn FnOnce() + Send>>,
    shutdown: Arc<AtomicBool>,
) {
    if let Some(on_ready) = on_ready {
        state.rescan_logged();
        on_ready();
    }

    let (event_tx, event_rx) = mpsc::channel::<Event>();

    // Without native events the periodic rescan still picks up changes
    let _watcher = match RecommendedWatcher::new(
        move |res: Result<Event, notify::Error>| {
            if let Ok(event) = res {
                let _ = event_tx.send(event);
            }
        },
        notify::Config::default(),
    )
    .and_then(|mut w| w.watch(&state.dir, RecursiveMode::NonRecursive).map(|_| w))
    {
        Ok(w) => Some(w),
        Err(e) => {
            warn!(dir = %state.dir.display(), error = %e, "filesystem events unavailable, relying on rescans");
            None
        }
    };

    info!(dir = %state.dir.display(), "watching shard directory");

    let mut debouncer = EventDebouncer::new(&config);
    let rescan_interval = config.rescan_interval();
    let mut last_scan = Instant::now();

    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        let timeout = debouncer
            .time_until_ready()
            .map_or(POLL_INTERVAL, |t| t.min(POLL_INTERVAL));

        match event_rx.recv_timeout(timeout) {
            Ok(event) => {
                if let Some(kind) = change_kind(&event.kind) {
                    for path in event.paths {
                        if state.matches(&path) {
                            debouncer.add_event(path, kind);
                        }
                    }
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            // No native watcher; keep polling at the same pace
            Err(mpsc::RecvTimeoutError::Disconnected) => thread::sleep(timeout),
        }

        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        if debouncer.has_pending() && debouncer.is_ready() {
            let batch = debouncer.flush();
            debug!(
                created = batch.created.len(),
                modified = batch.modified.len(),
                deleted = batch.deleted.len(),
                "shard directory changed"
            );
            state.rescan_logged();
            last_scan = Instant::now();
        } else if rescan_interval.is_some_and(|interval| last_scan.elapsed() >= interval) {
            state.rescan_logged();
            last_scan = Instant::now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingLoader {
        events: Mutex<Vec<(String, Vec<String>)>>,
    }

    impl Loader for RecordingLoader {
        fn load(&self, keys: &[String]) {
            self.events.lock().unwrap().push(("load".into(), keys.to_vec()));
        }

        fn unload(&self, keys: &[String]) {
            self.events.lock().unwrap().push(("unload".into(), keys.to_vec()));
        }
    }

    fn state(dir: &Path, loader: Arc<RecordingLoader>) -> ScanState {
        DirectoryWatcher::prepare(dir, loader, &WatcherConfig::default()).unwrap()
    }

    fn file_names(keys: &[String]) -> Vec<String> {
        keys.iter()
            .map(|k| Path::new(k).file_name().unwrap().to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_parse_shard_name() {
        assert_eq!(
            ShardName::parse("github.com%2Facme%2Fwidgets_v16.00000.shard"),
            ShardName {
                name: "github.com%2Facme%2Fwidgets".into(),
                version: 16
            }
        );
        assert_eq!(
            ShardName::parse("foo.shard"),
            ShardName {
                name: "foo.shard".into(),
                version: 0
            }
        );
        // Not a version number
        assert_eq!(ShardName::parse("my_vendor.shard").version, 0);
        assert_eq!(ShardName::parse("my_vendor.shard").name, "my_vendor.shard");
        assert_eq!(ShardName::parse("a_v3").version, 3);
    }

    #[test]
    fn test_config_from_file() {
        let file = ConfigFile::parse("[watcher]\ndebounce_ms = 5\nrescan_interval_secs = 0").unwrap();
        let mut config = WatcherConfig::default();
        config.apply_file(&file);
        assert_eq!(config.debounce_duration(), Duration::from_millis(5));
        assert!(config.rescan_interval().is_none());
        assert_eq!(config.shard_pattern, DEFAULT_SHARD_PATTERN);
    }

    #[test]
    fn test_rescan_keeps_latest_version() {
        let temp = TempDir::new().unwrap();
        for v in 1..=3 {
            fs::write(temp.path().join(format!("foo_v{v}.00000.shard")), "{}").unwrap();
        }
        fs::write(temp.path().join("bar.shard"), "{}").unwrap();
        fs::write(temp.path().join("notes.txt"), "x").unwrap();

        let loader = Arc::new(RecordingLoader::default());
        let mut st = state(temp.path(), Arc::clone(&loader));
        let diff = st.rescan().unwrap();

        assert!(diff.unload.is_empty());
        assert_eq!(file_names(&diff.load), vec!["bar.shard", "foo_v3.00000.shard"]);
    }

    #[test]
    fn test_rescan_all_shards_of_latest_version() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("foo_v2.00000.shard"), "{}").unwrap();
        fs::write(temp.path().join("foo_v2.00001.shard"), "{}").unwrap();
        fs::write(temp.path().join("foo_v1.00000.shard"), "{}").unwrap();

        let loader = Arc::new(RecordingLoader::default());
        let mut st = state(temp.path(), loader);
        let diff = st.rescan().unwrap();
        assert_eq!(
            file_names(&diff.load),
            vec!["foo_v2.00000.shard", "foo_v2.00001.shard"]
        );
    }

    #[test]
    fn test_rescan_superseded_version_unloads_first() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("foo_v1.00000.shard"), "{}").unwrap();

        let loader = Arc::new(RecordingLoader::default());
        let mut st = state(temp.path(), Arc::clone(&loader));
        st.rescan().unwrap();

        fs::write(temp.path().join("foo_v2.00000.shard"), "{}").unwrap();
        let diff = st.rescan().unwrap();
        assert_eq!(file_names(&diff.unload), vec!["foo_v1.00000.shard"]);
        assert_eq!(file_names(&diff.load), vec!["foo_v2.00000.shard"]);

        let events = loader.events.lock().unwrap();
        let kinds: Vec<&str> = events.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(kinds, vec!["load", "unload", "load"]);
    }

    #[test]
    fn test_rescan_unchanged_is_quiet() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("a.shard"), "{}").unwrap();

        let loader = Arc::new(RecordingLoader::default());
        let mut st = state(temp.path(), Arc::clone(&loader));
        st.rescan().unwrap();
        assert!(st.rescan().unwrap().is_empty());
        assert_eq!(loader.events.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_rescan_detects_size_change() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("a.shard");
        fs::write(&path, "{}").unwrap();

        let loader = Arc::new(RecordingLoader::default());
        let mut st = state(temp.path(), loader);
        st.rescan().unwrap();

        fs::write(&path, "{\"longer\": true}").unwrap();
        let diff = st.rescan().unwrap();
        assert_eq!(file_names(&diff.load), vec!["a.shard"]);
        assert!(diff.unload.is_empty());

        fs::remove_file(&path).unwrap();
        let diff = st.rescan().unwrap();
        assert_eq!(file_names(&diff.unload), vec!["a.shard"]);
    }

    #[test]
    fn test_custom_pattern() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("a.zoekt"), "{}").unwrap();
        fs::write(temp.path().join("b.shard"), "{}").unwrap();

        let config = WatcherConfig {
            shard_pattern: "*.zoekt".into(),
            ..Default::default()
        };
        let loader = Arc::new(RecordingLoader::default());
        let mut st = DirectoryWatcher::prepare(temp.path(), loader, &config).unwrap();
        assert_eq!(file_names(&st.rescan().unwrap().load), vec!["a.zoekt"]);
    }

    #[test]
    fn test_missing_directory_is_error() {
        let temp = TempDir::new().unwrap();
        let loader: Arc<dyn Loader> = Arc::new(RecordingLoader::default());
        let result = DirectoryWatcher::new(
            &temp.path().join("missing"),
            loader,
            WatcherConfig::default(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_stop_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let loader: Arc<dyn Loader> = Arc::new(RecordingLoader::default());
        let mut watcher =
            DirectoryWatcher::new(temp.path(), loader, WatcherConfig::default()).unwrap();
        assert_eq!(watcher.dir(), temp.path());
        watcher.stop();
        watcher.stop();
    }
}
