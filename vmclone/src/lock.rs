//! Host-wide run lock.
//!
//! Naming counts existing instances, so two runs on the same host would pick
//! the same name. The lock file is created with `O_EXCL` and removed when the
//! guard is dropped.

use anyhow::{bail, Context, Result};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Exclusive lock held for the duration of one run.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    /// Create the lock file, failing fast if another run holds it.
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                writeln!(file, "{}", std::process::id())
                    .with_context(|| format!("Failed to write lock file: {}", path.display()))?;
                debug!(path = %path.display(), "Run lock acquired");
                Ok(Self { path })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let holder = std::fs::read_to_string(&path).unwrap_or_default();
                bail!(
                    "Another vmclone run holds {} (pid {}); remove it if that run is gone",
                    path.display(),
                    holder.trim()
                )
            }
            Err(e) => Err(e)
                .with_context(|| format!("Failed to create lock file: {}", path.display())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Run lock released"),
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to remove run lock"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_acquire_fails_until_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".vmclone.lock");

        let lock = RunLock::acquire(&path).unwrap();
        assert_eq!(lock.path(), path.as_path());
        let holder = std::fs::read_to_string(&path).unwrap();
        assert_eq!(holder.trim(), std::process::id().to_string());

        let err = RunLock::acquire(&path).unwrap_err();
        assert!(err.to_string().contains("Another vmclone run"));

        drop(lock);
        assert!(!path.exists());
        RunLock::acquire(&path).unwrap();
    }

    #[test]
    fn test_missing_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(RunLock::acquire(dir.path().join("missing/.vmclone.lock")).is_err());
    }
}
