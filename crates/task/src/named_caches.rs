//! Named cache installation into a run tree

use crate::request::NamedCacheMount;
use isorun_cache::{NamedCachePool, PoolGuard};
use isorun_core::{Error, Result, ResultExt};
use isorun_utils::fs::set_read_only;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Keeps the closest existing ancestor of a path writable while alive.
///
/// Run trees may be fully read-only; installing a cache or removing its
/// link needs to modify the parent directory.
struct WritableAncestor {
    restore: Option<PathBuf>,
}

impl WritableAncestor {
    fn new(path: &Path) -> Result<Self> {
        let ancestor = path
            .ancestors()
            .skip(1)
            .find(|p| p.is_dir())
            .map(Path::to_path_buf);
        let Some(ancestor) = ancestor else {
            return Ok(Self { restore: None });
        };
        let read_only = fs::metadata(&ancestor)
            .fs_context(&ancestor, "stat directory")?
            .permissions()
            .readonly();
        if !read_only {
            return Ok(Self { restore: None });
        }
        set_read_only(&ancestor, false).fs_context(&ancestor, "make directory writable")?;
        Ok(Self {
            restore: Some(ancestor),
        })
    }
}

impl Drop for WritableAncestor {
    fn drop(&mut self) {
        if let Some(path) = self.restore.take() {
            if let Err(e) = set_read_only(&path, true) {
                tracing::warn!(path = %path.display(), error = %e, "failed to restore read-only directory");
            }
        }
    }
}

/// Map every requested cache into `run_dir` under one pool acquisition.
///
/// Each mount is pushed to `installed` once it is in place, so a failure
/// part way leaves exactly the caches that need uninstalling.
pub fn install_named_caches(
    pool: &NamedCachePool,
    run_dir: &Path,
    mounts: &[NamedCacheMount],
    installed: &mut Vec<NamedCacheMount>,
) -> Result<Duration> {
    let start = Instant::now();
    if mounts.is_empty() {
        return Ok(Duration::ZERO);
    }
    let mut guard = pool.open()?;
    for mount in mounts {
        install_one(&mut guard, run_dir, mount)?;
        installed.push(mount.clone());
    }
    Ok(start.elapsed())
}

fn install_one(guard: &mut PoolGuard, run_dir: &Path, mount: &NamedCacheMount) -> Result<()> {
    let path = run_dir.join(&mount.path);
    let _writable = WritableAncestor::new(&path)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).fs_context(parent, "create named cache parent")?;
    }
    guard
        .install(&path, &mount.name)
        .map_err(|e| Error::named_cache(&mount.name, e.to_string()))
}

/// Return every cache to the pool. A cache that cannot be returned is
/// logged and reported as lost; it never stops the others.
pub fn uninstall_named_caches(
    pool: &NamedCachePool,
    run_dir: &Path,
    mounts: &[NamedCacheMount],
) -> (Duration, Vec<String>) {
    let start = Instant::now();
    let mut lost = Vec::new();
    if mounts.is_empty() {
        return (Duration::ZERO, lost);
    }

    let mut guard = match pool.open() {
        Ok(guard) => guard,
        Err(e) => {
            tracing::error!(pool = %pool.root().display(), error = %e, "cannot open named cache pool");
            lost.extend(mounts.iter().map(|m| m.name.clone()));
            return (start.elapsed(), lost);
        }
    };

    for mount in mounts {
        let path = run_dir.join(&mount.path);
        let result = WritableAncestor::new(&path).and_then(|_writable| {
            guard
                .uninstall(&path, &mount.name)
                .map_err(|e| Error::named_cache(&mount.name, e.to_string()))
        });
        if let Err(e) = result {
            tracing::error!(name = %mount.name, error = %e, "named cache lost");
            lost.push(mount.name.clone());
        }
    }
    (start.elapsed(), lost)
}

#[cfg(test)]
mod tests {
    use super::*;
    use isorun_cache::CachePolicies;
    use tempfile::TempDir;

    fn mount(name: &str, path: &str) -> NamedCacheMount {
        NamedCacheMount {
            name: name.into(),
            path: path.into(),
        }
    }

    #[test]
    fn test_install_into_read_only_run_dir() {
        let temp_dir = TempDir::new().unwrap();
        let pool = NamedCachePool::new(temp_dir.path().join("pool"), CachePolicies::default());
        let run_dir = temp_dir.path().join("run");
        fs::create_dir_all(&run_dir).unwrap();
        set_read_only(&run_dir, true).unwrap();

        let mounts = vec![mount("build_cache", "cache/build")];
        let mut installed = Vec::new();
        install_named_caches(&pool, &run_dir, &mounts, &mut installed).unwrap();
        assert_eq!(installed, mounts);
        assert!(run_dir.join("cache/build").exists());
        assert!(fs::metadata(&run_dir).unwrap().permissions().readonly());

        let (_, lost) = uninstall_named_caches(&pool, &run_dir, &mounts);
        assert!(lost.is_empty());
        assert!(!run_dir.join("cache/build").exists());
        isorun_utils::fs::make_tree_writable(&run_dir).unwrap();
    }

    #[test]
    fn test_uninstall_reports_lost_cache_and_continues() {
        let temp_dir = TempDir::new().unwrap();
        let pool = NamedCachePool::new(temp_dir.path().join("pool"), CachePolicies::default());
        let run_dir = temp_dir.path().join("run");
        let mounts = vec![mount("gone", "a"), mount("kept", "b")];
        install_named_caches(&pool, &run_dir, &mounts, &mut Vec::new()).unwrap();
        fs::remove_file(run_dir.join("a")).unwrap();

        let (_, lost) = uninstall_named_caches(&pool, &run_dir, &mounts);
        assert_eq!(lost, vec!["gone".to_string()]);
        assert!(pool.open().unwrap().contains("kept"));
    }

    #[test]
    fn test_invalid_name_fails_install() {
        let temp_dir = TempDir::new().unwrap();
        let pool = NamedCachePool::new(temp_dir.path().join("pool"), CachePolicies::default());
        let mut installed = Vec::new();
        let mounts = [mount("good", "g"), mount("Bad-Name", "x")];
        let err = install_named_caches(&pool, temp_dir.path(), &mounts, &mut installed).unwrap_err();
        assert!(matches!(err, Error::NamedCache { .. }));
        assert_eq!(installed, vec![mount("good", "g")]);
    }
}
