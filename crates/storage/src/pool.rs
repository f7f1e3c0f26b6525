//! Pool directory layout
//!
//! Transfers are written to `<base>/<relative path>`, where the relative
//! path is the LFN without its leading slash. Every LFN starts with
//! `/store`, so the pool content lives under `<base>/store`.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// First path component of every pool file
pub const STORE_PREFIX: &str = "store";

const WRITE_CHECK: &str = ".filemover-write-check";

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Invalid relative path: {0}")]
    InvalidPath(String),
    #[error("Invalid user name: {0}")]
    InvalidUser(String),
    #[error("Permission denied on {path}: {source}")]
    PermissionDenied {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("File not found: {0}")]
    NotFound(PathBuf),
    #[error("{0} already links to a different file")]
    LinkConflict(PathBuf),
}

impl StorageError {
    pub(crate) fn from_io(path: &Path, source: io::Error) -> Self {
        match source.kind() {
            io::ErrorKind::PermissionDenied => StorageError::PermissionDenied {
                path: path.to_path_buf(),
                source,
            },
            io::ErrorKind::NotFound => StorageError::NotFound(path.to_path_buf()),
            _ => StorageError::Io {
                path: path.to_path_buf(),
                source,
            },
        }
    }
}

/// Create a directory tree, treating a concurrent creation as success.
pub(crate) fn create_dir_tolerant(dir: &Path) -> Result<(), StorageError> {
    match fs::create_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists && dir.is_dir() => Ok(()),
        Err(e) => Err(StorageError::from_io(dir, e)),
    }
}

/// Reject anything but plain path components so a relative path can never
/// escape the directory it is joined onto.
pub(crate) fn checked_relative(relative: &str) -> Result<&Path, StorageError> {
    let trimmed = relative.trim_start_matches('/');
    let path = Path::new(trimmed);
    if trimmed.is_empty() || !path.components().all(|c| matches!(c, Component::Normal(_))) {
        return Err(StorageError::InvalidPath(relative.to_string()));
    }
    Ok(path)
}

/// The local directory holding transferred files.
#[derive(Debug, Clone)]
pub struct StoragePool {
    base: PathBuf,
}

impl StoragePool {
    /// Wrap an existing base directory without touching the disk.
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    /// Create the base directory if needed and verify it is writable.
    ///
    /// A permission problem here is fatal for the engine: nothing could
    /// ever be transferred.
    pub fn open(base: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let pool = Self::new(base);
        create_dir_tolerant(&pool.base)?;

        let marker = pool.base.join(WRITE_CHECK);
        fs::write(&marker, b"").map_err(|e| StorageError::from_io(&pool.base, e))?;
        if let Err(e) = fs::remove_file(&marker) {
            debug!(path = %marker.display(), error = %e, "Could not remove write check file");
        }

        info!(base = %pool.base.display(), "Opened storage pool");
        Ok(pool)
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Root of the pool content, `<base>/store`.
    pub fn store_root(&self) -> PathBuf {
        self.base.join(STORE_PREFIX)
    }

    /// Absolute location of a pool file.
    pub fn path_for(&self, relative: &str) -> Result<PathBuf, StorageError> {
        Ok(self.base.join(checked_relative(relative)?))
    }

    /// Whether the file is already present in the pool.
    pub fn contains(&self, relative: &str) -> bool {
        self.path_for(relative).map(|p| p.is_file()).unwrap_or(false)
    }

    /// Size of a pool file, if present.
    pub fn file_size(&self, relative: &str) -> Option<u64> {
        let path = self.path_for(relative).ok()?;
        fs::metadata(path).ok().filter(|m| m.is_file()).map(|m| m.len())
    }

    /// Make sure the parent directory of a pool file exists and return the
    /// file's absolute path.
    pub fn ensure_parent(&self, relative: &str) -> Result<PathBuf, StorageError> {
        let path = self.path_for(relative)?;
        if let Some(parent) = path.parent() {
            create_dir_tolerant(parent)?;
        }
        Ok(path)
    }
}
