//! Per-user download area
//!
//! A completed pool file is handed to a user as a hard link
//! `<root>/<user>/<name>` plus a symlink `<root>/<user>/softlinks/<name>`
//! pointing back at the pool path. The hard link keeps the pool file's link
//! count above one, which stops the sweeper from evicting it while the user
//! still wants it. The symlink lets `list` notice pool files that vanished.
//!
//! `clean` ages views out: once a file has not been read for a while the
//! user's links go, and the pool file too unless another user still links
//! to it.

use std::fs;
use std::io;
use std::os::unix::fs::{symlink, MetadataExt};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

use crate::pool::{checked_relative, create_dir_tolerant, StorageError, StoragePool};

const SOFTLINK_DIR: &str = "softlinks";

/// One published file as seen from the user's directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadEntry {
    pub file_name: String,
    pub link: PathBuf,
    pub size: u64,
}

/// What `clean` removed, or would remove on a dry run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanReport {
    /// Expired hard and soft links
    pub links: Vec<PathBuf>,
    /// Pool files nobody else links to
    pub pool_files: Vec<PathBuf>,
    /// Expired views whose pool file is still linked by another user
    pub shared: usize,
}

/// Per-user download views of pool files
#[derive(Debug, Clone)]
pub struct DownloadArea {
    root: PathBuf,
    pool: StoragePool,
}

impl DownloadArea {
    pub fn new(root: impl Into<PathBuf>, pool: StoragePool) -> Self {
        Self {
            root: root.into(),
            pool,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding the user's hard links.
    pub fn user_dir(&self, user: &str) -> Result<PathBuf, StorageError> {
        let valid = !user.is_empty()
            && user != "."
            && user != ".."
            && !user.contains('/')
            && !user.contains('\0');
        if !valid {
            return Err(StorageError::InvalidUser(user.to_string()));
        }
        Ok(self.root.join(user))
    }

    fn link_paths(&self, user: &str, relative: &str) -> Result<(PathBuf, PathBuf), StorageError> {
        let user_dir = self.user_dir(user)?;
        let name = checked_relative(relative)?
            .file_name()
            .ok_or_else(|| StorageError::InvalidPath(relative.to_string()))?
            .to_owned();
        Ok((user_dir.join(&name), user_dir.join(SOFTLINK_DIR).join(name)))
    }

    /// Create both links for a completed pool file and return the hard
    /// link. Publishing the same file twice is a no-op.
    pub fn publish(&self, user: &str, relative: &str) -> Result<PathBuf, StorageError> {
        let source = self.pool.path_for(relative)?;
        if !source.is_file() {
            return Err(StorageError::NotFound(source));
        }

        let (hard, soft) = self.link_paths(user, relative)?;
        if let Some(parent) = soft.parent() {
            create_dir_tolerant(parent)?;
        }

        match fs::hard_link(&source, &hard) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                if !same_file(&source, &hard)? {
                    warn!(user, link = %hard.display(), "Download name already used by another file");
                    return Err(StorageError::LinkConflict(hard));
                }
                debug!(path = %hard.display(), "Hard link already present");
            }
            Err(e) => return Err(StorageError::from_io(&hard, e)),
        }

        match symlink(&source, &soft) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                if fs::read_link(&soft).ok().as_deref() != Some(source.as_path()) {
                    warn!(user, link = %soft.display(), "Softlink points at another file");
                    return Err(StorageError::LinkConflict(soft));
                }
                debug!(path = %soft.display(), "Symlink already present");
            }
            Err(e) => return Err(StorageError::from_io(&soft, e)),
        }

        info!(user, file = %source.display(), link = %hard.display(), "Published file");
        Ok(hard)
    }

    /// Drop the user's links. The pool file itself goes too when nobody
    /// else links to it. Returns whether the pool file was deleted.
    pub fn remove(&self, user: &str, relative: &str) -> Result<bool, StorageError> {
        let (hard, soft) = self.link_paths(user, relative)?;
        for link in [&soft, &hard] {
            match fs::remove_file(link) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(StorageError::from_io(link, e)),
            }
        }

        let source = self.pool.path_for(relative)?;
        let links = match fs::metadata(&source) {
            Ok(meta) => meta.nlink(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(StorageError::from_io(&source, e)),
        };
        if links > 1 {
            debug!(user, file = %source.display(), links, "Pool file still linked elsewhere");
            return Ok(false);
        }

        fs::remove_file(&source).map_err(|e| StorageError::from_io(&source, e))?;
        info!(user, file = %source.display(), "Removed pool file");
        Ok(true)
    }

    /// List the user's published files. A softlink whose pool file is gone
    /// is an orphan: it is pruned together with its hard link.
    pub fn list(&self, user: &str) -> Result<Vec<DownloadEntry>, StorageError> {
        let user_dir = self.user_dir(user)?;
        let soft_dir = user_dir.join(SOFTLINK_DIR);
        let listing = match fs::read_dir(&soft_dir) {
            Ok(listing) => listing,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StorageError::from_io(&soft_dir, e)),
        };

        let mut entries = Vec::new();
        for item in listing.flatten() {
            let soft = item.path();
            let hard = user_dir.join(item.file_name());
            match fs::metadata(&soft) {
                Ok(target) => entries.push(DownloadEntry {
                    file_name: item.file_name().to_string_lossy().into_owned(),
                    link: hard,
                    size: target.len(),
                }),
                Err(_) => {
                    for link in [&soft, &hard] {
                        match fs::remove_file(link) {
                            Ok(()) => debug!(path = %link.display(), "Pruned orphan link"),
                            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                            Err(e) => {
                                warn!(path = %link.display(), error = %e, "Unable to prune orphan link")
                            }
                        }
                    }
                }
            }
        }

        entries.sort_by(|a, b| a.file_name.cmp(&b.file_name));
        Ok(entries)
    }

    /// Remove every user's views of files not read within `max_age`, and
    /// orphaned views. With `dry_run` nothing is touched.
    pub fn clean(&self, max_age: Duration, dry_run: bool) -> Result<CleanReport, StorageError> {
        let mut report = CleanReport::default();
        let Some(cutoff) = SystemTime::now().checked_sub(max_age) else {
            return Ok(report);
        };
        let users = match fs::read_dir(&self.root) {
            Ok(users) => users,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(report),
            Err(e) => return Err(StorageError::from_io(&self.root, e)),
        };

        for user in users.flatten() {
            if !user.file_type().map_or(false, |t| t.is_dir()) {
                continue;
            }
            self.clean_user(&user.path(), cutoff, dry_run, &mut report)?;
        }

        info!(
            links = report.links.len(),
            pool_files = report.pool_files.len(),
            shared = report.shared,
            dry_run,
            "Download area cleaned"
        );
        Ok(report)
    }

    fn clean_user(
        &self,
        user_dir: &Path,
        cutoff: SystemTime,
        dry_run: bool,
        report: &mut CleanReport,
    ) -> Result<(), StorageError> {
        let soft_dir = user_dir.join(SOFTLINK_DIR);
        let listing = match fs::read_dir(&soft_dir) {
            Ok(listing) => listing,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(StorageError::from_io(&soft_dir, e)),
        };

        for item in listing.flatten() {
            let soft = item.path();
            let hard = user_dir.join(item.file_name());
            // Both links share the pool file's inode, so one atime covers all.
            let target = fs::metadata(&soft).ok();
            let expired = target
                .as_ref()
                .map_or(true, |meta| meta.accessed().map_or(false, |at| at < cutoff));
            if !expired {
                continue;
            }
            let pool_file = fs::read_link(&soft)
                .ok()
                .filter(|path| path.starts_with(self.pool.base()));
            let own_link = match (&target, fs::symlink_metadata(&hard)) {
                (Some(meta), Ok(hard_meta)) => hard_meta.ino() == meta.ino() && hard_meta.dev() == meta.dev(),
                _ => false,
            };

            for link in [&soft, &hard] {
                if fs::symlink_metadata(link).is_err() {
                    continue;
                }
                if !dry_run {
                    remove_if_present(link)?;
                }
                report.links.push(link.clone());
            }

            let (Some(meta), Some(pool_file)) = (target, pool_file) else {
                continue;
            };
            let other_links = meta.nlink().saturating_sub(if own_link { 2 } else { 1 });
            if other_links > 0 {
                debug!(file = %pool_file.display(), links = meta.nlink(), "Pool file still linked by another user");
                report.shared += 1;
                continue;
            }
            if !dry_run {
                remove_if_present(&pool_file)?;
            }
            report.pool_files.push(pool_file);
        }
        Ok(())
    }
}

fn same_file(a: &Path, b: &Path) -> Result<bool, StorageError> {
    let a_meta = fs::metadata(a).map_err(|e| StorageError::from_io(a, e))?;
    let b_meta = fs::metadata(b).map_err(|e| StorageError::from_io(b, e))?;
    Ok(a_meta.dev() == b_meta.dev() && a_meta.ino() == b_meta.ino())
}

fn remove_if_present(path: &Path) -> Result<(), StorageError> {
    match fs::remove_file(path) {
        Ok(()) => {
            debug!(path = %path.display(), "Removed expired file");
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StorageError::from_io(path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LFN: &str = "/store/mc/sample/file.root";

    fn setup() -> (tempfile::TempDir, StoragePool, DownloadArea) {
        let dir = tempfile::tempdir().unwrap();
        let pool = StoragePool::open(dir.path().join("pool")).unwrap();
        let area = DownloadArea::new(dir.path().join("users"), pool.clone());
        let path = pool.ensure_parent(LFN).unwrap();
        fs::write(path, b"payload").unwrap();
        (dir, pool, area)
    }

    #[test]
    fn test_publish_creates_links() {
        let (dir, pool, area) = setup();
        let link = area.publish("alice", LFN).unwrap();

        assert_eq!(link, dir.path().join("users/alice/file.root"));
        assert_eq!(fs::read(&link).unwrap(), b"payload");
        let soft = dir.path().join("users/alice/softlinks/file.root");
        assert_eq!(fs::read_link(soft).unwrap(), pool.path_for(LFN).unwrap());
        let source = pool.path_for(LFN).unwrap();
        assert_eq!(fs::metadata(source).unwrap().nlink(), 2);

        // Second publish is harmless.
        area.publish("alice", LFN).unwrap();
    }

    #[test]
    fn test_publish_missing_file() {
        let (_dir, _pool, area) = setup();
        assert!(matches!(
            area.publish("alice", "/store/mc/missing.root"),
            Err(StorageError::NotFound(_))
        ));
    }

    #[test]
    fn test_remove_keeps_file_shared_with_other_user() {
        let (_dir, pool, area) = setup();
        area.publish("alice", LFN).unwrap();
        area.publish("bob", LFN).unwrap();

        assert!(!area.remove("alice", LFN).unwrap());
        assert!(pool.contains(LFN));
        assert!(area.list("alice").unwrap().is_empty());

        assert!(area.remove("bob", LFN).unwrap());
        assert!(!pool.contains(LFN));
    }

    #[test]
    fn test_list_prunes_orphans() {
        let (_dir, pool, area) = setup();
        area.publish("alice", LFN).unwrap();

        let listed = area.list("alice").unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].file_name, "file.root");
        assert_eq!(listed[0].size, 7);

        // Pool file deleted behind our back: the hard link keeps the data
        // but the softlink no longer resolves.
        fs::remove_file(pool.path_for(LFN).unwrap()).unwrap();
        assert!(area.list("alice").unwrap().is_empty());
        let user_dir = area.user_dir("alice").unwrap();
        assert!(!user_dir.join("file.root").exists());
        assert!(fs::symlink_metadata(user_dir.join(SOFTLINK_DIR).join("file.root")).is_err());
    }

    #[test]
    fn test_publish_rejects_basename_clash() {
        let (_dir, pool, area) = setup();
        let other = "/store/data/other/file.root";
        fs::write(pool.ensure_parent(other).unwrap(), b"different").unwrap();

        area.publish("alice", LFN).unwrap();
        assert!(matches!(
            area.publish("alice", other),
            Err(StorageError::LinkConflict(_))
        ));
        let link = area.user_dir("alice").unwrap().join("file.root");
        assert_eq!(fs::read(link).unwrap(), b"payload");
    }

    fn age(path: &Path, days: u64) {
        let then = SystemTime::now() - Duration::from_secs(days * 24 * 60 * 60);
        let file = fs::File::options().write(true).open(path).unwrap();
        file.set_times(fs::FileTimes::new().set_accessed(then).set_modified(then))
            .unwrap();
    }

    #[test]
    fn test_clean_expires_old_views() {
        let (_dir, pool, area) = setup();
        let fresh = "/store/mc/sample/fresh.root";
        fs::write(pool.ensure_parent(fresh).unwrap(), b"new").unwrap();
        area.publish("alice", LFN).unwrap();
        area.publish("alice", fresh).unwrap();
        age(&pool.path_for(LFN).unwrap(), 100);

        let month = Duration::from_secs(30 * 24 * 60 * 60);
        let planned = area.clean(3 * month, true).unwrap();
        assert_eq!(planned.links.len(), 2);
        assert_eq!(planned.pool_files, vec![pool.path_for(LFN).unwrap()]);
        // Dry run touched nothing.
        assert_eq!(area.list("alice").unwrap().len(), 2);

        let done = area.clean(3 * month, false).unwrap();
        assert_eq!(done, planned);
        assert!(!pool.contains(LFN));
        let listed = area.list("alice").unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].file_name, "fresh.root");
    }

    #[test]
    fn test_clean_keeps_pool_file_linked_by_another_user() {
        let (_dir, pool, area) = setup();
        area.publish("alice", LFN).unwrap();
        area.publish("bob", LFN).unwrap();
        age(&pool.path_for(LFN).unwrap(), 100);

        let report = area.clean(Duration::from_secs(24 * 60 * 60), false).unwrap();
        // Both users' views expire; only the last one takes the pool file.
        assert_eq!(report.links.len(), 4);
        assert_eq!(report.shared + report.pool_files.len(), 2);
        assert!(area.list("alice").unwrap().is_empty());
        assert!(area.list("bob").unwrap().is_empty());
        assert!(!pool.contains(LFN));
    }

    #[test]
    fn test_clean_drops_orphans_and_ignores_missing_root() {
        let (dir, pool, area) = setup();
        area.publish("alice", LFN).unwrap();
        fs::remove_file(pool.path_for(LFN).unwrap()).unwrap();

        let report = area.clean(Duration::from_secs(3600), false).unwrap();
        assert_eq!(report.links.len(), 2);
        assert!(report.pool_files.is_empty());

        let empty = DownloadArea::new(dir.path().join("nowhere"), pool);
        assert_eq!(empty.clean(Duration::ZERO, false).unwrap(), CleanReport::default());
    }

    #[test]
    fn test_rejects_bad_user_names() {
        let (_dir, _pool, area) = setup();
        for user in ["", "..", "a/b", "."] {
            assert!(matches!(area.user_dir(user), Err(StorageError::InvalidUser(_))));
        }
        assert!(area.list("nobody").unwrap().is_empty());
    }
}
