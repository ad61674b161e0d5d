//! Single-instance lock file
//!
//! The lock is a plain marker file created exclusively. It is removed when the
//! guard drops; a crash leaves it behind, which the error help explains.

use miette::Diagnostic;
use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

pub const DEFAULT_LOCK_PATH: &str = "/tmp/couchgrab.lock";

#[derive(Debug, Error, Diagnostic)]
pub enum LockError {
    #[error(
        "lock file {} exists: couchgrab is already running, or did not close correctly",
        path.display()
    )]
    #[diagnostic(
        code(couchgrab::lock::held),
        help("if it is not running, remove the lock file (or reboot) and try again")
    )]
    AlreadyHeld { path: PathBuf },

    #[error("failed to create lock file {}", path.display())]
    #[diagnostic(code(couchgrab::lock::io))]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Held lock; removes the file on drop
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
}

impl LockFile {
    pub fn acquire(path: impl AsRef<Path>) -> Result<Self, LockError> {
        let path = path.as_ref().to_path_buf();
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => {
                debug!("acquired lock {}", path.display());
                Ok(Self { path })
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Err(LockError::AlreadyHeld { path }),
            Err(source) => Err(LockError::Io { path, source }),
        }
    }

    #[cfg(test)]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("failed to remove lock file {}: {}", self.path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert2::{assert, let_assert};

    #[test]
    fn test_lock_is_exclusive_and_released() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("couchgrab.lock");

        let_assert!(Ok(lock) = LockFile::acquire(&path));
        assert!(path.exists());
        assert!(lock.path() == path);

        let_assert!(Err(LockError::AlreadyHeld { path: held }) = LockFile::acquire(&path));
        assert!(held == path);

        drop(lock);
        assert!(!path.exists());
        let_assert!(Ok(_) = LockFile::acquire(&path));
    }

    #[test]
    fn test_stale_lock_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("couchgrab.lock");
        std::fs::write(&path, "").unwrap();

        let_assert!(Err(LockError::AlreadyHeld { .. }) = LockFile::acquire(&path));
        // A refused acquire must not delete someone else's lock
        assert!(path.exists());
    }

    #[test]
    fn test_missing_directory_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("couchgrab.lock");

        let_assert!(Err(LockError::Io { .. }) = LockFile::acquire(&path));
    }
}
