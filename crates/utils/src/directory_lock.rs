//! Exclusive per-directory locking for state shared across invocations

use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Name of the lock file created inside the locked directory
pub const LOCK_FILE_NAME: &str = ".lock";

/// An exclusive lock on a directory, released on drop.
///
/// Backed by an OS file lock, so a crashed holder never leaves the
/// directory locked.
#[derive(Debug)]
pub struct DirectoryLock {
    lock_file: File,
    lock_path: PathBuf,
    directory: PathBuf,
}

impl DirectoryLock {
    /// Block until the lock for the given directory is acquired
    pub fn acquire(directory: &Path) -> io::Result<Self> {
        let mut lock_file = Self::open_lock_file(directory)?;
        lock_file.lock_exclusive()?;
        Self::finish(lock_file, directory)
    }

    /// Try to acquire the lock without blocking
    pub fn try_acquire(directory: &Path) -> io::Result<Self> {
        let lock_file = Self::open_lock_file(directory)?;
        match lock_file.try_lock_exclusive() {
            Ok(()) => Self::finish(lock_file, directory),
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                format!("directory already locked: {}", directory.display()),
            )),
            Err(e) => Err(e),
        }
    }

    fn open_lock_file(directory: &Path) -> io::Result<File> {
        fs::create_dir_all(directory)?;
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(directory.join(LOCK_FILE_NAME))
    }

    fn finish(mut lock_file: File, directory: &Path) -> io::Result<Self> {
        // Record the holder for anyone inspecting a stuck pool
        lock_file.set_len(0)?;
        writeln!(lock_file, "{}", std::process::id())?;
        lock_file.sync_all()?;

        Ok(Self {
            lock_file,
            lock_path: directory.join(LOCK_FILE_NAME),
            directory: directory.to_path_buf(),
        })
    }

    /// Get the directory this lock is for
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Path of the backing lock file
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }
}

impl Drop for DirectoryLock {
    fn drop(&mut self) {
        // The file stays; removing it would race with a waiter that already opened it
        let _ = FileExt::unlock(&self.lock_file);
    }
}
