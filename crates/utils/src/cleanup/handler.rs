//! Resource cleanup guards
//!
//! RAII guards that make sure per-invocation directories are released on
//! every exit path, plus tree deletion that tolerates transiently held files.

use crate::fs::make_tree_deletable;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Number of deletion attempts made by [`remove_tree`] callers by default
pub const DEFAULT_REMOVE_ATTEMPTS: u32 = 3;

/// Delete a directory tree, making it writable first and retrying with a
/// growing delay when something (typically a lingering process) still holds
/// part of it.
pub fn remove_tree(path: &Path, attempts: u32, base_delay: Duration) -> io::Result<()> {
    let attempts = attempts.max(1);
    let mut last_error = None;

    for attempt in 1..=attempts {
        if fs::symlink_metadata(path).is_err() {
            return Ok(());
        }
        // Best effort; a failure here surfaces through remove_dir_all
        let _ = make_tree_deletable(path);
        match fs::remove_dir_all(path) {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                tracing::debug!(
                    path = %path.display(),
                    attempt,
                    error = %e,
                    "failed to delete tree"
                );
                last_error = Some(e);
                if attempt < attempts {
                    std::thread::sleep(base_delay * attempt);
                }
            }
        }
    }

    Err(last_error.unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "tree deletion failed")))
}

/// RAII guard for a directory owned by one invocation
#[derive(Debug)]
pub struct ScopedDir {
    path: PathBuf,
    cleanup_on_drop: bool,
}

impl ScopedDir {
    /// Create the directory, failing if it already exists, and take
    /// ownership of it. The parent must exist.
    pub fn create_new(path: PathBuf) -> io::Result<Self> {
        fs::create_dir(&path)?;
        Ok(Self {
            path,
            cleanup_on_drop: true,
        })
    }

    /// Get the path to the directory
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Keep the directory after the guard is dropped
    pub fn keep(mut self) -> PathBuf {
        self.cleanup_on_drop = false;
        std::mem::take(&mut self.path)
    }

    /// Delete the directory now, reporting failure to the caller.
    ///
    /// Whatever the outcome, dropping the guard afterwards does nothing.
    pub fn remove(&mut self, attempts: u32, base_delay: Duration) -> io::Result<()> {
        self.cleanup_on_drop = false;
        remove_tree(&self.path, attempts, base_delay)
    }
}

impl Drop for ScopedDir {
    fn drop(&mut self) {
        if self.cleanup_on_drop {
            if let Err(e) = remove_tree(&self.path, 1, Duration::ZERO) {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "failed to remove directory"
                );
            }
        }
    }
}
