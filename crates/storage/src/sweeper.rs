//! Pool size enforcement
//!
//! The sweeper keeps the total size of `<base>/store` under a quota by
//! deleting least-recently-accessed files first. Files with more than one
//! hard link are still published in somebody's download area and are never
//! deleted; removing them would not free the space anyway.

use std::collections::VecDeque;
use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::pool::{create_dir_tolerant, StorageError};

/// Default time between two sweeps
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(90);

/// A regular file found while scanning the pool
#[derive(Debug, Clone)]
struct PoolEntry {
    path: PathBuf,
    size: u64,
    accessed: SystemTime,
    links: u64,
}

/// Outcome of a single sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned_files: usize,
    pub total_bytes: u64,
    pub quota_bytes: u64,
    pub freed_bytes: u64,
    pub removed: Vec<PathBuf>,
    /// Files kept because another hard link still references them
    pub pinned: usize,
    pub failures: usize,
}

impl SweepReport {
    pub fn over_quota(&self) -> bool {
        self.total_bytes > self.quota_bytes
    }
}

fn scan(root: &Path) -> Vec<PoolEntry> {
    let mut entries = Vec::new();
    let mut pending = VecDeque::from([root.to_path_buf()]);

    while let Some(dir) = pending.pop_front() {
        let listing = match fs::read_dir(&dir) {
            Ok(listing) => listing,
            Err(e) => {
                warn!(path = %dir.display(), error = %e, "Unable to list pool directory");
                continue;
            }
        };

        for item in listing.flatten() {
            let path = item.path();
            // Files may disappear underneath us while transfers are cancelled.
            let meta = match fs::symlink_metadata(&path) {
                Ok(meta) => meta,
                Err(_) => continue,
            };
            if meta.is_dir() {
                pending.push_back(path);
            } else if meta.is_file() {
                entries.push(PoolEntry {
                    path,
                    size: meta.len(),
                    accessed: meta.accessed().unwrap_or(SystemTime::UNIX_EPOCH),
                    links: meta.nlink(),
                });
            }
        }
    }

    entries
}

/// Run one sweep over `root`, deleting the oldest files until the pool
/// fits in `quota_bytes`.
pub fn sweep_pool(root: &Path, quota_bytes: u64) -> Result<SweepReport, StorageError> {
    create_dir_tolerant(root)?;

    let mut entries = scan(root);
    let mut report = SweepReport {
        scanned_files: entries.len(),
        total_bytes: entries.iter().map(|e| e.size).sum(),
        quota_bytes,
        ..Default::default()
    };

    debug!(
        root = %root.display(),
        files = report.scanned_files,
        total_bytes = report.total_bytes,
        quota_bytes,
        "Scanned pool"
    );

    if !report.over_quota() {
        return Ok(report);
    }

    let needed = report.total_bytes - quota_bytes;
    entries.sort_by_key(|e| e.accessed);

    for entry in entries {
        if report.freed_bytes >= needed {
            break;
        }
        if entry.links > 1 {
            report.pinned += 1;
            continue;
        }
        match fs::remove_file(&entry.path) {
            Ok(()) => {
                debug!(path = %entry.path.display(), size = entry.size, "Evicted pool file");
                report.freed_bytes += entry.size;
                report.removed.push(entry.path);
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                report.freed_bytes += entry.size;
            }
            Err(e) => {
                warn!(path = %entry.path.display(), error = %e, "Unable to evict pool file");
                report.failures += 1;
            }
        }
    }

    info!(
        root = %root.display(),
        removed = report.removed.len(),
        freed_bytes = report.freed_bytes,
        needed_bytes = needed,
        pinned = report.pinned,
        "Pool sweep complete"
    );

    Ok(report)
}

/// Sweeper configuration
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    pub root: PathBuf,
    pub quota_bytes: u64,
    pub interval: Duration,
}

/// Background task running `sweep_pool` every `interval`.
///
/// The next sweep is scheduled only once the previous one has finished.
pub struct CacheSweeper {
    config: SweeperConfig,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl CacheSweeper {
    /// Spawn the sweep loop on the current runtime.
    pub fn start(config: SweeperConfig) -> Self {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(config.clone(), cancel.clone()));
        Self {
            config,
            cancel,
            handle: Mutex::new(Some(handle)),
        }
    }

    pub fn config(&self) -> &SweeperConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Run a sweep right now, outside the schedule.
    pub async fn sweep_now(&self) -> Result<SweepReport, StorageError> {
        sweep_blocking(&self.config).await
    }

    /// Ask the loop to stop after the current sweep.
    pub fn kill(&self) {
        self.cancel.cancel();
    }

    /// Stop the loop and wait for it to exit.
    pub async fn stop(&self) {
        self.kill();
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "Sweeper task did not exit cleanly");
            }
        }
    }
}

impl Drop for CacheSweeper {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn sweep_blocking(config: &SweeperConfig) -> Result<SweepReport, StorageError> {
    let root = config.root.clone();
    let quota = config.quota_bytes;
    match tokio::task::spawn_blocking(move || sweep_pool(&root, quota)).await {
        Ok(result) => result,
        Err(e) => Err(StorageError::Io {
            path: config.root.clone(),
            source: io::Error::new(io::ErrorKind::Other, e.to_string()),
        }),
    }
}

async fn run(config: SweeperConfig, cancel: CancellationToken) {
    info!(
        root = %config.root.display(),
        quota_bytes = config.quota_bytes,
        interval_secs = config.interval.as_secs(),
        "Pool sweeper started"
    );

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(config.interval) => {}
        }

        if let Err(e) = sweep_blocking(&config).await {
            error!(root = %config.root.display(), error = %e, "Pool sweep failed");
        }
    }

    info!(root = %config.root.display(), "Pool sweeper stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{File, FileTimes};

    fn write_file(path: &Path, size: usize, accessed_secs_ago: u64) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, vec![0u8; size]).unwrap();
        let atime = SystemTime::now() - Duration::from_secs(accessed_secs_ago);
        let file = File::options().write(true).open(path).unwrap();
        file.set_times(FileTimes::new().set_accessed(atime)).unwrap();
    }

    #[test]
    fn test_under_quota_removes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("store");
        write_file(&root.join("a/one.root"), 100, 10);
        write_file(&root.join("b/two.root"), 100, 20);

        let report = sweep_pool(&root, 1000).unwrap();
        assert_eq!(report.scanned_files, 2);
        assert_eq!(report.total_bytes, 200);
        assert!(report.removed.is_empty());
    }

    #[test]
    fn test_oldest_files_go_first() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("store");
        write_file(&root.join("old.root"), 400, 300);
        write_file(&root.join("mid.root"), 400, 200);
        write_file(&root.join("new.root"), 400, 100);

        let report = sweep_pool(&root, 500).unwrap();
        assert_eq!(report.removed, vec![root.join("old.root"), root.join("mid.root")]);
        assert_eq!(report.freed_bytes, 800);
        assert!(root.join("new.root").exists());
    }

    #[test]
    fn test_stops_once_enough_is_freed() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("store");
        write_file(&root.join("old.root"), 600, 300);
        write_file(&root.join("new.root"), 100, 100);

        let report = sweep_pool(&root, 200).unwrap();
        assert_eq!(report.removed, vec![root.join("old.root")]);
        assert!(root.join("new.root").exists());
    }

    #[test]
    fn test_linked_files_are_pinned() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("store");
        write_file(&root.join("published.root"), 400, 300);
        write_file(&root.join("plain.root"), 400, 200);
        fs::hard_link(root.join("published.root"), dir.path().join("user-copy")).unwrap();

        let report = sweep_pool(&root, 300).unwrap();
        assert_eq!(report.pinned, 1);
        assert_eq!(report.removed, vec![root.join("plain.root")]);
        assert!(root.join("published.root").exists());
    }

    #[test]
    fn test_missing_root_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("store");
        let report = sweep_pool(&root, 10).unwrap();
        assert!(root.is_dir());
        assert_eq!(report.scanned_files, 0);
    }

    #[tokio::test]
    async fn test_background_sweeper_runs_and_stops() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("store");
        write_file(&root.join("big.root"), 1000, 60);

        let sweeper = CacheSweeper::start(SweeperConfig {
            root: root.clone(),
            quota_bytes: 10,
            interval: Duration::from_millis(20),
        });
        assert!(sweeper.is_running());

        for _ in 0..100 {
            if !root.join("big.root").exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!root.join("big.root").exists());

        sweeper.stop().await;
        assert!(!sweeper.is_running());
    }
}
