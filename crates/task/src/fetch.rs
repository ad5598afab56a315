//! Content fetcher: materialize a bundle into the run directory

use isorun_cache::{hashing, Bundle, DiskCache, FileEntry, StoreClient};
use isorun_core::{Error, ReadOnlyPolicy, Result, ResultExt, TransferStats, TreeMode};
use isorun_utils::fs as tree;
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Instant;

/// What a bundle contributes besides its files
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchedTree {
    pub command: Vec<String>,
    pub relative_cwd: Option<String>,
    pub read_only: ReadOnlyPolicy,
    pub stats: TransferStats,
}

/// Resolve `hash` through the cache and the store, and lay its files out
/// under `dst` according to `mode` and the bundle's read-only policy.
pub fn fetch_tree(
    store: &dyn StoreClient,
    cache: &DiskCache,
    hash: &str,
    dst: &Path,
    mode: TreeMode,
) -> Result<FetchedTree> {
    let start = Instant::now();
    let mut stats = TransferStats::default();

    let bundle = load_bundle(store, cache, hash, &mut stats)?;
    let read_only = bundle.read_only.unwrap_or_default();
    tracing::info!(
        hash = %hash,
        files = bundle.files.len(),
        read_only = read_only.as_u8(),
        "materializing bundle"
    );

    for (relative, entry) in &bundle.files {
        let target = dst.join(relative);
        match (&entry.hash, &entry.link) {
            (_, Some(link)) => {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent).fs_context(parent, "create directory")?;
                }
                tree::symlink(Path::new(link), &target).fs_context(&target, "create symlink")?;
            }
            (Some(file_hash), None) => {
                materialize_file(store, cache, file_hash, entry, &target, mode, read_only, &mut stats)?;
            }
            (None, None) => {
                return Err(Error::integrity(relative.clone(), "entry has neither hash nor link"));
            }
        }
    }

    apply_read_only(dst, read_only)?;
    stats.duration = start.elapsed();
    isorun_utils::tracing::phase_completed("fetch", stats.duration.as_millis() as u64);

    Ok(FetchedTree {
        command: bundle.command.unwrap_or_default(),
        relative_cwd: bundle.relative_cwd,
        read_only,
        stats,
    })
}

/// Apply a read-only policy to a materialized tree
pub fn apply_read_only(root: &Path, policy: ReadOnlyPolicy) -> Result<()> {
    let result = match policy {
        ReadOnlyPolicy::Writable => tree::make_tree_writable(root),
        ReadOnlyPolicy::FilesReadOnly => tree::make_tree_files_read_only(root),
        ReadOnlyPolicy::TreeReadOnly => tree::make_tree_read_only(root),
    };
    result.fs_context(root, "apply read-only policy")
}

/// Load a bundle and fold in its includes, depth-first in declaration order
fn load_bundle(
    store: &dyn StoreClient,
    cache: &DiskCache,
    hash: &str,
    stats: &mut TransferStats,
) -> Result<Bundle> {
    let mut seen = HashSet::new();
    let mut pending = vec![hash.to_string()];
    let mut merged: Option<Bundle> = None;

    while let Some(key) = pending.pop() {
        if !seen.insert(key.clone()) {
            continue;
        }
        let content = fetch_object(store, cache, &key, stats)?;
        let mut bundle = Bundle::parse(&key, &content)?;
        // Reverse so the first include is popped first
        pending.extend(bundle.includes.drain(..).rev());
        match merged.as_mut() {
            Some(root) => root.merge_included(bundle),
            None => merged = Some(bundle),
        }
    }

    let merged = merged.ok_or_else(|| Error::store(hash, "bundle could not be loaded"))?;
    merged.validate_links(hash)?;
    Ok(merged)
}

/// Get an object's bytes, filling the cache from the store on a miss
fn fetch_object(
    store: &dyn StoreClient,
    cache: &DiskCache,
    key: &str,
    stats: &mut TransferStats,
) -> Result<Vec<u8>> {
    let object = cache.lookup(key)?;
    if object.exists() {
        let content = object.read()?;
        stats.items_hot += 1;
        stats.bytes_hot += content.len() as u64;
        return Ok(content);
    }
    let content = store.fetch(key)?;
    object.write(&content)?;
    stats.items_cold += 1;
    stats.bytes_cold += content.len() as u64;
    Ok(content)
}

#[allow(clippy::too_many_arguments)]
fn materialize_file(
    store: &dyn StoreClient,
    cache: &DiskCache,
    hash: &str,
    entry: &FileEntry,
    target: &Path,
    mode: TreeMode,
    read_only: ReadOnlyPolicy,
    stats: &mut TransferStats,
) -> Result<()> {
    hashing::validate_hash(hash).map_err(Error::from)?;
    let object = cache.lookup(hash)?;
    if object.exists() {
        stats.items_hot += 1;
        stats.bytes_hot += entry.size.unwrap_or(0);
    } else {
        let content = store.fetch(hash)?;
        object.write(&content)?;
        stats.items_cold += 1;
        stats.bytes_cold += content.len() as u64;
    }

    // Links share the cache's inode, so anything that may be written to or
    // needs its own mode gets a private copy
    let executable = entry.mode.is_some_and(|m| m & 0o111 != 0);
    let effective = if read_only == ReadOnlyPolicy::Writable || executable {
        TreeMode::Copy
    } else {
        mode
    };
    object.link_to(target, effective)?;

    if effective == TreeMode::Copy {
        set_mode(target, entry.mode)?;
    }
    tracing::trace!(path = %target.display(), hash = %hash, mode = ?effective, "materialized file");
    Ok(())
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: Option<u32>) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mode = mode.unwrap_or(0o644) | 0o200;
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).fs_context(path, "set file mode")
}

#[cfg(not(unix))]
fn set_mode(path: &Path, _mode: Option<u32>) -> Result<()> {
    tree::set_read_only(path, false).fs_context(path, "set file mode")
}
