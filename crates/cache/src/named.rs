//! Named-cache pool
//!
//! Long-lived directories shared across runs by name. Each cache lives in a
//! short-named directory under the pool root and is mapped into a run tree
//! with a symlink for the duration of one task.
//!
//! All mutation goes through a [`PoolGuard`], which holds the pool's
//! exclusive directory lock.

use crate::config::CachePolicies;
use crate::errors::{CacheError, Result};
use isorun_utils::DirectoryLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Name of the index file inside the pool root
pub const POOL_STATE_FILE: &str = "state.json";

/// Longest accepted cache name
pub const MAX_NAME_LEN: usize = 4096;

/// Check a cache name against `[a-z0-9_]{1,4096}`
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(CacheError::invalid_key(
            name,
            format!("cache names must be 1 to {MAX_NAME_LEN} characters"),
        ));
    }
    if !name
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_')
    {
        return Err(CacheError::invalid_key(
            name,
            "cache names may only contain [a-z0-9_]",
        ));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct PoolEntry {
    /// Directory under the pool root holding the cache
    dir: String,
    size: u64,
    timestamp: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PoolState {
    #[serde(default)]
    entries: BTreeMap<String, PoolEntry>,
    #[serde(default)]
    last_timestamp: u64,
}

/// Handle on a pool directory; cheap to construct, does no I/O until opened
#[derive(Debug, Clone)]
pub struct NamedCachePool {
    root: PathBuf,
    policies: CachePolicies,
}

impl NamedCachePool {
    pub fn new(root: impl Into<PathBuf>, policies: CachePolicies) -> Self {
        Self {
            root: root.into(),
            policies,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Acquire exclusive access to the pool, blocking while another
    /// invocation holds it
    pub fn open(&self) -> Result<PoolGuard> {
        let lock = DirectoryLock::acquire(&self.root).map_err(|source| CacheError::Lock {
            path: self.root.clone(),
            source,
        })?;

        let state_path = self.root.join(POOL_STATE_FILE);
        let state = match fs::read(&state_path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|source| {
                CacheError::Serialization {
                    key: state_path.display().to_string(),
                    source,
                }
            })?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => PoolState::default(),
            Err(e) => return Err(CacheError::io(state_path, "read pool index", e)),
        };

        tracing::debug!(pool = %self.root.display(), entries = state.entries.len(), "opened named cache pool");
        Ok(PoolGuard {
            root: self.root.clone(),
            policies: self.policies,
            state,
            _lock: lock,
        })
    }
}

/// Exclusive access to a named-cache pool; saves the index when dropped
#[derive(Debug)]
pub struct PoolGuard {
    root: PathBuf,
    policies: CachePolicies,
    state: PoolState,
    _lock: DirectoryLock,
}

impl PoolGuard {
    /// Map the cache `name` into `path` as a symlink into the pool.
    ///
    /// Storage is created on first use. An empty directory already at
    /// `path` is replaced; anything else there is an error.
    pub fn install(&mut self, path: &Path, name: &str) -> Result<()> {
        validate_name(name)?;

        match fs::symlink_metadata(path) {
            Ok(metadata) if metadata.is_dir() => {
                fs::remove_dir(path).map_err(|e| {
                    CacheError::io(path, "replace non-empty directory with named cache", e)
                })?;
            }
            Ok(_) => {
                return Err(CacheError::io(
                    path,
                    "install named cache",
                    io::Error::new(io::ErrorKind::AlreadyExists, "path already exists"),
                ))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(CacheError::io(path, "stat named cache path", e)),
        }

        let storage = self.storage_for(name)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| CacheError::io(parent, "create parent", e))?;
        }
        isorun_utils::fs::symlink(&storage, path)
            .map_err(|e| CacheError::io(path, "link named cache", e))?;
        self.bump(name);

        tracing::info!(name = %name, path = %path.display(), "installed named cache");
        Ok(())
    }

    /// Return the cache mapped at `path` to the pool.
    ///
    /// If the task replaced the link with a real directory, that directory
    /// becomes the cache's new content. If nothing usable is left the entry
    /// is dropped and an error reports the cache as lost.
    pub fn uninstall(&mut self, path: &Path, name: &str) -> Result<()> {
        validate_name(name)?;

        let metadata = match fs::symlink_metadata(path) {
            Ok(metadata) => metadata,
            Err(e) => {
                self.drop_entry(name);
                return Err(CacheError::io(path, "find named cache to uninstall", e));
            }
        };

        if metadata.file_type().is_symlink() {
            fs::remove_file(path).map_err(|e| CacheError::io(path, "unlink named cache", e))?;
            let storage = match self.state.entries.get(name) {
                Some(entry) => self.root.join(&entry.dir),
                None => {
                    return Err(CacheError::Corruption {
                        path: path.to_path_buf(),
                        reason: format!("named cache '{name}' is not in the pool index"),
                    })
                }
            };
            if !storage.is_dir() {
                self.drop_entry(name);
                return Err(CacheError::Corruption {
                    path: storage,
                    reason: format!("storage for named cache '{name}' disappeared"),
                });
            }
        } else if metadata.is_dir() {
            let storage = self.storage_for(name)?;
            isorun_utils::remove_tree(&storage, isorun_utils::DEFAULT_REMOVE_ATTEMPTS, Duration::from_millis(100))
                .map_err(|e| CacheError::io(&storage, "replace named cache storage", e))?;
            if let Err(e) = fs::rename(path, &storage) {
                self.drop_entry(name);
                return Err(CacheError::io(path, "move directory into pool", e));
            }
        } else {
            self.drop_entry(name);
            return Err(CacheError::Corruption {
                path: path.to_path_buf(),
                reason: format!("named cache '{name}' was replaced by a file"),
            });
        }

        let size = self
            .state
            .entries
            .get(name)
            .map(|entry| isorun_utils::fs::tree_size(&self.root.join(&entry.dir)))
            .unwrap_or(0);
        self.bump(name);
        if let Some(entry) = self.state.entries.get_mut(name) {
            entry.size = size;
        }

        tracing::info!(name = %name, size, "uninstalled named cache");
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.state.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.entries.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.state.entries.contains_key(name)
    }

    /// Name of the least recently used cache
    pub fn get_oldest(&self) -> Option<String> {
        self.state
            .entries
            .iter()
            .min_by_key(|(_, e)| e.timestamp)
            .map(|(name, _)| name.clone())
    }

    pub fn get_timestamp(&self, name: &str) -> Option<u64> {
        self.state.entries.get(name).map(|e| e.timestamp)
    }

    pub fn total_size(&self) -> u64 {
        self.state.entries.values().map(|e| e.size).sum()
    }

    /// Evict the least recently used caches until the policies hold, and
    /// delete storage directories the index no longer knows about.
    ///
    /// Returns the number of caches evicted.
    pub fn trim(&mut self) -> Result<usize> {
        let mut evicted = 0;
        loop {
            let over = self.policies.over_limits(self.len(), self.total_size());
            let low = self.policies.min_free_space > 0
                && self
                    .policies
                    .low_on_space(fs2::available_space(&self.root).unwrap_or(u64::MAX));
            if !(over || low) {
                break;
            }
            let Some(name) = self.get_oldest() else {
                break;
            };
            if let Some(entry) = self.state.entries.remove(&name) {
                self.remove_storage(&entry.dir)?;
                tracing::debug!(name = %name, size = entry.size, "evicted named cache");
            }
            evicted += 1;
        }

        self.remove_orphans()?;
        self.save()?;
        if evicted > 0 {
            tracing::info!(pool = %self.root.display(), evicted, "trimmed named cache pool");
        }
        Ok(evicted)
    }

    /// Persist the index
    pub fn save(&self) -> Result<()> {
        let path = self.root.join(POOL_STATE_FILE);
        let bytes = serde_json::to_vec(&self.state).map_err(|source| CacheError::Serialization {
            key: POOL_STATE_FILE.to_string(),
            source,
        })?;
        isorun_utils::write_atomic(&path, &bytes)
            .map_err(|e| CacheError::from_write(&path, "write pool index", e))
    }

    fn storage_for(&mut self, name: &str) -> Result<PathBuf> {
        if let Some(entry) = self.state.entries.get(name) {
            let storage = self.root.join(&entry.dir);
            fs::create_dir_all(&storage)
                .map_err(|e| CacheError::io(&storage, "create named cache storage", e))?;
            return Ok(storage);
        }

        let dir = self.new_dir_token();
        let storage = self.root.join(&dir);
        fs::create_dir_all(&storage)
            .map_err(|e| CacheError::io(&storage, "create named cache storage", e))?;
        self.state.entries.insert(
            name.to_string(),
            PoolEntry {
                dir,
                size: 0,
                timestamp: 0,
            },
        );
        Ok(storage)
    }

    fn new_dir_token(&self) -> String {
        loop {
            let token = Uuid::new_v4().simple().to_string()[..8].to_string();
            let taken = self.state.entries.values().any(|e| e.dir == token)
                || self.root.join(&token).exists();
            if !taken {
                return token;
            }
        }
    }

    fn bump(&mut self, name: &str) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        let timestamp = now.max(self.state.last_timestamp + 1);
        self.state.last_timestamp = timestamp;
        if let Some(entry) = self.state.entries.get_mut(name) {
            entry.timestamp = timestamp;
        }
    }

    fn drop_entry(&mut self, name: &str) {
        if let Some(entry) = self.state.entries.remove(name) {
            tracing::warn!(name = %name, "named cache lost");
            if let Err(e) = self.remove_storage(&entry.dir) {
                tracing::debug!(name = %name, error = %e, "failed to delete lost cache storage");
            }
        }
    }

    fn remove_storage(&self, dir: &str) -> Result<()> {
        let storage = self.root.join(dir);
        isorun_utils::remove_tree(&storage, isorun_utils::DEFAULT_REMOVE_ATTEMPTS, Duration::from_millis(100))
            .map_err(|e| CacheError::io(storage, "delete named cache storage", e))
    }

    fn remove_orphans(&self) -> Result<()> {
        let entries = fs::read_dir(&self.root).map_err(|e| CacheError::io(&self.root, "list pool", e))?;
        for entry in entries {
            let entry = entry.map_err(|e| CacheError::io(&self.root, "list pool", e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let known = self.state.entries.values().any(|e| e.dir == name);
            if known || name.starts_with('.') || name == POOL_STATE_FILE {
                continue;
            }
            tracing::debug!(dir = %name, "removing orphaned pool directory");
            self.remove_storage(&name)?;
        }
        Ok(())
    }
}

impl Drop for PoolGuard {
    fn drop(&mut self) {
        if let Err(e) = self.save() {
            tracing::warn!(pool = %self.root.display(), error = %e, "failed to save pool index");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn pool(temp_dir: &TempDir, policies: CachePolicies) -> NamedCachePool {
        NamedCachePool::new(temp_dir.path().join("pool"), policies)
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("build_cache_1").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("Build").is_err());
        assert!(validate_name("build-cache").is_err());
        assert!(validate_name("../x").is_err());
        assert!(validate_name(&"a".repeat(MAX_NAME_LEN + 1)).is_err());
    }

    #[test]
    fn test_install_write_uninstall_persists() {
        let temp_dir = TempDir::new().unwrap();
        let pool = pool(&temp_dir, CachePolicies::default());
        let run1 = temp_dir.path().join("run1/cache/build");
        let run2 = temp_dir.path().join("run2/cache/build");

        {
            let mut guard = pool.open().unwrap();
            guard.install(&run1, "build_cache").unwrap();
            assert!(fs::symlink_metadata(&run1).unwrap().file_type().is_symlink());
            fs::write(run1.join("artifact.o"), "object").unwrap();
            guard.uninstall(&run1, "build_cache").unwrap();
            assert!(!run1.exists());
        }

        let mut guard = pool.open().unwrap();
        guard.install(&run2, "build_cache").unwrap();
        assert_eq!(fs::read_to_string(run2.join("artifact.o")).unwrap(), "object");
        guard.uninstall(&run2, "build_cache").unwrap();
    }

    #[test]
    fn test_install_uninstall_is_idempotent_on_count() {
        let temp_dir = TempDir::new().unwrap();
        let pool = pool(&temp_dir, CachePolicies::default());
        let path = temp_dir.path().join("run/c");
        let mut guard = pool.open().unwrap();

        guard.install(&path, "cache").unwrap();
        guard.uninstall(&path, "cache").unwrap();
        let count = guard.len();
        guard.install(&path, "cache").unwrap();
        guard.uninstall(&path, "cache").unwrap();
        assert_eq!(guard.len(), count);
    }

    #[test]
    fn test_install_replaces_empty_dir_only() {
        let temp_dir = TempDir::new().unwrap();
        let pool = pool(&temp_dir, CachePolicies::default());
        let empty = temp_dir.path().join("run/empty");
        let full = temp_dir.path().join("run/full");
        fs::create_dir_all(&empty).unwrap();
        fs::create_dir_all(&full).unwrap();
        fs::write(full.join("x"), "x").unwrap();

        let mut guard = pool.open().unwrap();
        guard.install(&empty, "a").unwrap();
        assert!(guard.install(&full, "b").is_err());
    }

    #[test]
    fn test_uninstall_adopts_replaced_directory() {
        let temp_dir = TempDir::new().unwrap();
        let pool = pool(&temp_dir, CachePolicies::default());
        let path = temp_dir.path().join("run/c");
        let mut guard = pool.open().unwrap();

        guard.install(&path, "cache").unwrap();
        fs::remove_file(&path).unwrap();
        fs::create_dir_all(&path).unwrap();
        fs::write(path.join("new.txt"), "fresh").unwrap();
        guard.uninstall(&path, "cache").unwrap();

        guard.install(&path, "cache").unwrap();
        assert_eq!(fs::read_to_string(path.join("new.txt")).unwrap(), "fresh");
    }

    #[test]
    fn test_uninstall_missing_path_loses_cache() {
        let temp_dir = TempDir::new().unwrap();
        let pool = pool(&temp_dir, CachePolicies::default());
        let path = temp_dir.path().join("run/c");
        let mut guard = pool.open().unwrap();

        guard.install(&path, "cache").unwrap();
        fs::remove_file(&path).unwrap();
        assert!(guard.uninstall(&path, "cache").is_err());
        assert!(!guard.contains("cache"));
    }

    #[test]
    fn test_trim_evicts_oldest() {
        let temp_dir = TempDir::new().unwrap();
        let pool = pool(&temp_dir, CachePolicies::new(0, 0, 1));
        let mut guard = pool.open().unwrap();
        for name in ["first", "second"] {
            let path = temp_dir.path().join("run").join(name);
            guard.install(&path, name).unwrap();
            guard.uninstall(&path, name).unwrap();
        }

        assert_eq!(guard.get_oldest().as_deref(), Some("first"));
        assert_eq!(guard.trim().unwrap(), 1);
        assert!(!guard.contains("first"));
        assert!(guard.contains("second"));
    }

    #[test]
    fn test_open_is_exclusive() {
        let temp_dir = TempDir::new().unwrap();
        let pool = pool(&temp_dir, CachePolicies::default());
        let _guard = pool.open().unwrap();
        assert!(DirectoryLock::try_acquire(pool.root()).is_err());
    }
}
