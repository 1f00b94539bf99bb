//! Filesystem access for the archive directory.
//!
//! Every archive byte goes through this module. Paths handed in are relative
//! to an [`ArchiveLocation`]; the manifest is replaced with write-then-rename
//! and partition files are created exclusively, so a partition on disk is
//! never rewritten.

pub mod layout;

use snafu::{Backtrace, prelude::*};
use std::{
    error::Error,
    fmt,
    fs::{self, File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
};

/// Result alias for archive file operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Root of an archive.
///
/// Only local directories exist today; new backends become new variants.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ArchiveLocation {
    /// A directory on the local filesystem.
    Local(PathBuf),
}

impl ArchiveLocation {
    /// An archive rooted at `root`.
    pub fn local(root: impl Into<PathBuf>) -> Self {
        ArchiveLocation::Local(root.into())
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        match self {
            ArchiveLocation::Local(root) => root,
        }
    }

    /// Join an archive-relative path onto the root.
    pub fn resolve(&self, rel: &Path) -> PathBuf {
        self.root().join(rel)
    }

    /// True when the root exists and is a directory.
    pub fn is_available(&self) -> bool {
        self.root().is_dir()
    }
}

/// Raw failure reported by a backend.
#[derive(Debug)]
pub enum BackendError {
    /// Local filesystem failure.
    Local(io::Error),
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::Local(e) => write!(f, "filesystem: {e}"),
        }
    }
}

impl Error for BackendError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            BackendError::Local(e) => Some(e),
        }
    }
}

/// Archive file operation failures, classified by cause.
#[derive(Debug, Snafu)]
pub enum StorageError {
    /// Nothing exists at the path.
    #[snafu(display("No archive file at {path}"))]
    NotFound {
        /// Absolute path that was missing.
        path: String,
        /// Backend failure.
        source: BackendError,
        /// Where the failure was observed.
        backtrace: Backtrace,
    },

    /// An exclusive create found an existing file.
    #[snafu(display("Archive file {path} already exists"))]
    AlreadyExists {
        /// Absolute path that was taken.
        path: String,
        /// Backend failure.
        source: BackendError,
        /// Where the failure was observed.
        backtrace: Backtrace,
    },

    /// Any other I/O failure.
    #[snafu(display("Archive I/O failed at {path}: {source}"))]
    OtherIo {
        /// Absolute path involved.
        path: String,
        /// Backend failure.
        source: BackendError,
        /// Where the failure was observed.
        backtrace: Backtrace,
    },
}

impl StorageError {
    /// Path of the failing operation.
    pub fn path(&self) -> &str {
        match self {
            StorageError::NotFound { path, .. }
            | StorageError::AlreadyExists { path, .. }
            | StorageError::OtherIo { path, .. } => path,
        }
    }

    fn from_io(err: io::Error, path: &Path) -> Self {
        let kind = err.kind();
        let path = path.display().to_string();
        let source = BackendError::Local(err);
        let backtrace = Backtrace::capture();
        match kind {
            io::ErrorKind::NotFound => StorageError::NotFound {
                path,
                source,
                backtrace,
            },
            io::ErrorKind::AlreadyExists => StorageError::AlreadyExists {
                path,
                source,
                backtrace,
            },
            _ => StorageError::OtherIo {
                path,
                source,
                backtrace,
            },
        }
    }
}

fn io_at(path: &Path) -> impl FnOnce(io::Error) -> StorageError + '_ {
    move |e| StorageError::from_io(e, path)
}

fn make_parent(abs: &Path) -> StorageResult<()> {
    let Some(parent) = abs.parent() else {
        return Ok(());
    };
    fs::create_dir_all(parent)
        .map_err(BackendError::Local)
        .context(OtherIoSnafu {
            path: parent.display().to_string(),
        })
}

/// Create the archive root if it does not exist yet.
pub fn ensure_root(location: &ArchiveLocation) -> StorageResult<()> {
    let root = location.root();
    fs::create_dir_all(root)
        .map_err(BackendError::Local)
        .context(OtherIoSnafu {
            path: root.display().to_string(),
        })
}

/// A file that is deleted on drop unless [`PendingFile::keep`] was called.
struct PendingFile {
    path: PathBuf,
    keep: bool,
}

impl PendingFile {
    fn new(path: PathBuf) -> Self {
        Self { path, keep: false }
    }

    fn keep(mut self) {
        self.keep = true;
    }
}

impl Drop for PendingFile {
    fn drop(&mut self) {
        if !self.keep {
            // The caller is already returning the original error.
            let _ = fs::remove_file(&self.path);
        }
    }
}

fn write_synced(file: &mut File, contents: &[u8], path: &Path) -> StorageResult<()> {
    file.write_all(contents).map_err(io_at(path))?;
    file.sync_all().map_err(io_at(path))
}

/// Replace the file at `rel_path` with `contents`.
///
/// Readers see either the previous file or the complete new one: the bytes
/// land in a synced `.tmp` sibling that is then renamed over the target.
pub fn write_atomic(
    location: &ArchiveLocation,
    rel_path: &Path,
    contents: &[u8],
) -> StorageResult<()> {
    let target = location.resolve(rel_path);
    make_parent(&target)?;

    let staging = target.with_extension("tmp");
    let pending = PendingFile::new(staging.clone());
    let mut file = File::create(&staging).map_err(io_at(&staging))?;
    write_synced(&mut file, contents, &staging)?;
    drop(file);

    fs::rename(&staging, &target).map_err(io_at(&target))?;
    pending.keep();
    Ok(())
}

/// Create `rel_path` exclusively and fill it with `contents`.
///
/// Fails with [`StorageError::AlreadyExists`] when the file is present; a
/// partially written file is removed again.
pub fn write_new(
    location: &ArchiveLocation,
    rel_path: &Path,
    contents: &[u8],
) -> StorageResult<()> {
    let target = location.resolve(rel_path);
    make_parent(&target)?;

    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&target)
        .map_err(io_at(&target))?;
    let pending = PendingFile::new(target.clone());
    write_synced(&mut file, contents, &target)?;
    pending.keep();
    Ok(())
}

/// Whole contents of `rel_path`.
pub fn read_all_bytes(location: &ArchiveLocation, rel_path: &Path) -> StorageResult<Vec<u8>> {
    let abs = location.resolve(rel_path);
    fs::read(&abs).map_err(io_at(&abs))
}

/// Contents of `rel_path` as UTF-8.
pub fn read_to_string(location: &ArchiveLocation, rel_path: &Path) -> StorageResult<String> {
    let abs = location.resolve(rel_path);
    fs::read_to_string(&abs).map_err(io_at(&abs))
}
