//! Local content cache
//!
//! Objects are stored read-only as `<root>/<hash>`, with a `state.json`
//! index recording each object's size and last access. Access timestamps
//! are strictly increasing so eviction order is total.

use crate::config::CachePolicies;
use crate::errors::{CacheError, Result};
use crate::hashing::{validate_hash, verify};
use isorun_core::TreeMode;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Name of the index file inside the cache directory
pub const STATE_FILE: &str = "state.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct IndexEntry {
    size: u64,
    timestamp: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheState {
    #[serde(default)]
    entries: HashMap<String, IndexEntry>,
    #[serde(default)]
    last_timestamp: u64,
}

impl CacheState {
    fn next_timestamp(&mut self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        self.last_timestamp = now.max(self.last_timestamp + 1);
        self.last_timestamp
    }

    fn total_size(&self) -> u64 {
        self.entries.values().map(|e| e.size).sum()
    }

    fn oldest(&self) -> Option<(&String, &IndexEntry)> {
        self.entries.iter().min_by_key(|(_, e)| e.timestamp)
    }
}

/// Content cache keyed by hash
#[derive(Debug)]
pub struct DiskCache {
    root: PathBuf,
    policies: CachePolicies,
    state: Mutex<CacheState>,
}

impl DiskCache {
    /// Open (or create) the cache at `root`, reconciling the index with disk
    pub fn open(root: impl Into<PathBuf>, policies: CachePolicies) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| CacheError::io(&root, "create cache directory", e))?;

        let state_path = root.join(STATE_FILE);
        let mut state = match fs::read(&state_path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                tracing::warn!(
                    path = %state_path.display(),
                    error = %e,
                    "discarding unreadable cache index"
                );
                CacheState::default()
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => CacheState::default(),
            Err(e) => return Err(CacheError::io(state_path, "read cache index", e)),
        };

        let before = state.entries.len();
        state.entries.retain(|key, _| root.join(key).is_file());
        if state.entries.len() != before {
            tracing::warn!(
                cache = %root.display(),
                dropped = before - state.entries.len(),
                "index entries without a backing file"
            );
        }

        for entry in fs::read_dir(&root).map_err(|e| CacheError::io(&root, "list cache", e))? {
            let entry = entry.map_err(|e| CacheError::io(&root, "list cache", e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == STATE_FILE || name.starts_with('.') || state.entries.contains_key(&name) {
                continue;
            }
            tracing::debug!(file = %name, "removing orphaned cache file");
            remove_object(&entry.path())?;
        }

        let cache = Self {
            root,
            policies,
            state: Mutex::new(state),
        };
        cache.save()?;
        Ok(cache)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn policies(&self) -> CachePolicies {
        self.policies
    }

    /// Scoped reference to the object stored under `key`
    pub fn lookup(&self, key: &str) -> Result<CachedObject<'_>> {
        validate_hash(key)?;
        Ok(CachedObject {
            cache: self,
            key: key.to_string(),
            path: self.root.join(key),
        })
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_size(&self) -> u64 {
        self.state.lock().total_size()
    }

    /// Key of the least recently used object
    pub fn get_oldest(&self) -> Option<String> {
        self.state.lock().oldest().map(|(key, _)| key.clone())
    }

    pub fn get_timestamp(&self, key: &str) -> Option<u64> {
        self.state.lock().entries.get(key).map(|e| e.timestamp)
    }

    /// Evict oldest objects until the policies are satisfied.
    ///
    /// Returns the number of objects evicted.
    pub fn trim(&self) -> Result<usize> {
        let mut evicted = 0;
        {
            let mut state = self.state.lock();
            loop {
                let over = self
                    .policies
                    .over_limits(state.entries.len(), state.total_size());
                let low = self.policies.min_free_space > 0
                    && self.policies.low_on_space(free_space(&self.root));
                if !(over || low) {
                    break;
                }
                let Some(key) = state.oldest().map(|(key, _)| key.clone()) else {
                    break;
                };
                remove_object(&self.root.join(&key))?;
                if let Some(entry) = state.entries.remove(&key) {
                    tracing::debug!(key = %key, size = entry.size, "evicted cached object");
                }
                evicted += 1;
            }
        }
        self.save()?;
        if evicted > 0 {
            tracing::info!(cache = %self.root.display(), evicted, "trimmed content cache");
        }
        Ok(evicted)
    }

    /// Persist the index
    pub fn save(&self) -> Result<()> {
        let path = self.root.join(STATE_FILE);
        let bytes = {
            let state = self.state.lock();
            serde_json::to_vec(&*state).map_err(|source| CacheError::Serialization {
                key: STATE_FILE.to_string(),
                source,
            })?
        };
        isorun_utils::write_atomic(&path, &bytes)
            .map_err(|e| CacheError::from_write(&path, "write cache index", e))
    }

    fn touch(&self, key: &str, size: u64) {
        let mut state = self.state.lock();
        let timestamp = state.next_timestamp();
        state
            .entries
            .insert(key.to_string(), IndexEntry { size, timestamp });
    }
}

impl Drop for DiskCache {
    fn drop(&mut self) {
        if let Err(e) = self.save() {
            tracing::warn!(cache = %self.root.display(), error = %e, "failed to save cache index");
        }
    }
}

/// A scoped reference to one cache key
#[derive(Debug)]
pub struct CachedObject<'a> {
    cache: &'a DiskCache,
    key: String,
    path: PathBuf,
}

impl CachedObject<'_> {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the object is present
    pub fn exists(&self) -> bool {
        let present = self.cache.state.lock().entries.contains_key(&self.key) && self.path.is_file();
        isorun_utils::tracing::cache_event("content", &self.key, present);
        present
    }

    /// Read the object content, refreshing its access time
    pub fn read(&self) -> Result<Vec<u8>> {
        let content = fs::read(&self.path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => CacheError::NotFound {
                key: self.key.clone(),
                store: self.cache.root.display().to_string(),
            },
            _ => CacheError::io(&self.path, "read cached object", e),
        })?;
        self.cache.touch(&self.key, content.len() as u64);
        Ok(content)
    }

    /// Store `content` under this key after verifying its hash
    pub fn write(&self, content: &[u8]) -> Result<()> {
        verify(&self.key, content)?;
        if self.path.exists() {
            remove_object(&self.path)?;
        }
        isorun_utils::write_atomic(&self.path, content)
            .map_err(|e| CacheError::from_write(&self.path, "write cached object", e))?;
        isorun_utils::fs::set_read_only(&self.path, true)
            .map_err(|e| CacheError::io(&self.path, "protect cached object", e))?;
        self.cache.touch(&self.key, content.len() as u64);
        Ok(())
    }

    /// Place the object at `dst` and refresh its access time
    pub fn link_to(&self, dst: &Path, mode: TreeMode) -> Result<()> {
        let metadata =
            fs::metadata(&self.path).map_err(|e| CacheError::io(&self.path, "stat cached object", e))?;
        isorun_utils::fs::link_file(&self.path, dst, mode)
            .map_err(|e| CacheError::io(dst, "link cached object", e))?;
        self.cache.touch(&self.key, metadata.len());
        Ok(())
    }
}

fn remove_object(path: &Path) -> Result<()> {
    let _ = isorun_utils::fs::set_read_only(path, false);
    let result = if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(CacheError::io(path, "remove cached object", e)),
    }
}

fn free_space(path: &Path) -> u64 {
    fs2::available_space(path).unwrap_or(u64::MAX)
}
