//! Per-run directories and their teardown

use isorun_core::{Result, ResultExt, OUT_DIR_PREFIX, RUN_DIR_PREFIX, TMP_DIR_PREFIX};
use isorun_utils::{ScopedDir, DEFAULT_REMOVE_ATTEMPTS};
use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;

const REMOVE_RETRY_DELAY: Duration = Duration::from_millis(500);

/// The run, output and temp directories owned by one invocation.
///
/// Each directory is removed when the value is dropped unless it was
/// already removed or leaked, so a failure between creation and teardown
/// does not leave anything behind.
#[derive(Debug)]
pub struct RunDirectories {
    /// Materialized inputs and working directory
    run: ScopedDir,
    /// Outputs staged for upload
    out: ScopedDir,
    /// Exported as the child's temp directory
    tmp: ScopedDir,
}

impl RunDirectories {
    /// Create fresh directories under `root`, or the system temp directory
    pub fn create(root: Option<&Path>) -> Result<Self> {
        let root = root.map_or_else(std::env::temp_dir, Path::to_path_buf);
        fs::create_dir_all(&root).fs_context(&root, "create root directory")?;
        let dirs = Self {
            run: make_unique(&root, RUN_DIR_PREFIX)?,
            out: make_unique(&root, OUT_DIR_PREFIX)?,
            tmp: make_unique(&root, TMP_DIR_PREFIX)?,
        };
        tracing::debug!(
            run_dir = %dirs.run().display(),
            out_dir = %dirs.out().display(),
            tmp_dir = %dirs.tmp().display(),
            "created run directories"
        );
        Ok(dirs)
    }

    pub fn run(&self) -> &Path {
        self.run.path()
    }

    pub fn out(&self) -> &Path {
        self.out.path()
    }

    pub fn tmp(&self) -> &Path {
        self.tmp.path()
    }

    /// Delete the run and temp trees.
    ///
    /// Returns `false` when either survives, typically because a process the
    /// task left behind still holds files in it.
    pub fn remove_work_dirs(&mut self) -> bool {
        let mut removed = true;
        for dir in [&mut self.run, &mut self.tmp] {
            if let Err(e) = dir.remove(DEFAULT_REMOVE_ATTEMPTS, REMOVE_RETRY_DELAY) {
                tracing::error!(path = %dir.path().display(), error = %e, "outliving zombie: failed to delete directory");
                removed = false;
            }
        }
        removed
    }

    /// Delete the output tree; failure is only logged
    pub fn remove_out_dir(&mut self) {
        if let Err(e) = self.out.remove(DEFAULT_REMOVE_ATTEMPTS, REMOVE_RETRY_DELAY) {
            tracing::warn!(path = %self.out.path().display(), error = %e, "failed to delete output directory");
        }
    }

    /// Keep all three directories and log where they were left
    pub fn leak(self) {
        let (run, out, tmp) = (self.run.keep(), self.out.keep(), self.tmp.keep());
        tracing::info!(
            run_dir = %run.display(),
            out_dir = %out.display(),
            tmp_dir = %tmp.display(),
            "leaking run directories"
        );
    }
}

fn make_unique(root: &Path, prefix: &str) -> Result<ScopedDir> {
    loop {
        let token = uuid::Uuid::new_v4().simple().to_string();
        let path = root.join(format!("{prefix}{}", &token[..8]));
        match ScopedDir::create_new(path.clone()) {
            Ok(dir) => return Ok(dir),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e).fs_context(&path, "create run directory"),
        }
    }
}
