//! Remote content store client and tree archiving
//!
//! The agent only talks to the store through [`StoreClient`]. [`LocalStore`]
//! is a filesystem-backed implementation laid out as
//! `<root>/<namespace>/<hash>`.

use crate::bundle::{Bundle, FileEntry};
use crate::errors::{CacheError, Result};
use crate::hashing::{hash_bytes, hash_file, validate_hash, verify};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Access to a content-addressed object store
pub trait StoreClient: Send + Sync {
    /// Human readable location of the store, recorded in output references
    fn location(&self) -> &str;

    fn namespace(&self) -> &str;

    /// Fetch an object. Returns [`CacheError::NotFound`] when the store
    /// definitively lacks the object and [`CacheError::Io`] for anything
    /// that might succeed on retry.
    fn fetch(&self, hash: &str) -> Result<Vec<u8>>;

    /// Return the subset of `hashes` the store does not have
    fn contains(&self, hashes: &[String]) -> Result<Vec<String>>;

    /// Store an object under its hash
    fn push(&self, hash: &str, content: &[u8]) -> Result<()>;
}

/// Filesystem-backed object store
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
    namespace: String,
    location: String,
}

impl LocalStore {
    /// Create a store rooted at `root`; the namespace directory is created lazily
    pub fn new(root: impl Into<PathBuf>, namespace: impl Into<String>) -> Self {
        let root = root.into();
        let location = format!("file://{}", root.display());
        Self {
            root,
            namespace: namespace.into(),
            location,
        }
    }

    fn object_path(&self, hash: &str) -> Result<PathBuf> {
        validate_hash(hash)?;
        Ok(self.root.join(&self.namespace).join(hash))
    }
}

impl StoreClient for LocalStore {
    fn location(&self) -> &str {
        &self.location
    }

    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn fetch(&self, hash: &str) -> Result<Vec<u8>> {
        let path = self.object_path(hash)?;
        match fs::read(&path) {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(CacheError::NotFound {
                key: hash.to_string(),
                store: self.location.clone(),
            }),
            Err(e) => Err(CacheError::io(path, "read object", e)),
        }
    }

    fn contains(&self, hashes: &[String]) -> Result<Vec<String>> {
        let mut missing = Vec::new();
        for hash in hashes {
            if !self.object_path(hash)?.is_file() {
                missing.push(hash.clone());
            }
        }
        Ok(missing)
    }

    fn push(&self, hash: &str, content: &[u8]) -> Result<()> {
        verify(hash, content)?;
        let path = self.object_path(hash)?;
        if path.is_file() {
            return Ok(());
        }
        isorun_utils::write_atomic(&path, content)
            .map_err(|e| CacheError::from_write(&path, "write object", e))
    }
}

/// Result of archiving a tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveResult {
    /// Hash of the bundle describing the tree
    pub hash: String,
    /// Objects uploaded because the store lacked them
    pub items_cold: u64,
    /// Objects skipped because the store already had them
    pub items_hot: u64,
    pub bytes_cold: u64,
    pub bytes_hot: u64,
}

/// Archive the tree under `root` into `store`.
///
/// File blobs the store is missing are pushed, then a bundle describing the
/// tree. Symlinks are recorded as link entries, not followed.
pub fn archive(store: &dyn StoreClient, root: &Path) -> Result<ArchiveResult> {
    let mut bundle = Bundle::default();
    let mut blobs: BTreeMap<String, (PathBuf, u64)> = BTreeMap::new();

    for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf());
            CacheError::io(path, "walk output tree", io::Error::from(e))
        })?;
        let file_type = entry.file_type();
        if file_type.is_dir() {
            continue;
        }

        let relative = relative_key(root, entry.path())?;
        if file_type.is_symlink() {
            let target = fs::read_link(entry.path())
                .map_err(|e| CacheError::io(entry.path(), "read symlink", e))?;
            bundle
                .files
                .insert(relative, FileEntry::symlink(target.to_string_lossy().into_owned()));
            continue;
        }

        let metadata = entry
            .metadata()
            .map_err(|e| CacheError::io(entry.path(), "stat output file", io::Error::from(e)))?;
        let hash = hash_file(entry.path())?;
        bundle.files.insert(
            relative,
            FileEntry::file(hash.clone(), metadata.len(), file_mode(&metadata)),
        );
        blobs.insert(hash, (entry.path().to_path_buf(), metadata.len()));
    }

    let hashes: Vec<String> = blobs.keys().cloned().collect();
    let missing: HashSet<String> = store.contains(&hashes)?.into_iter().collect();

    let mut result = ArchiveResult {
        hash: String::new(),
        items_cold: 0,
        items_hot: 0,
        bytes_cold: 0,
        bytes_hot: 0,
    };
    for (hash, (path, size)) in &blobs {
        if missing.contains(hash) {
            let content = fs::read(path).map_err(|e| CacheError::io(path, "read output file", e))?;
            store.push(hash, &content)?;
            result.items_cold += 1;
            result.bytes_cold += size;
        } else {
            result.items_hot += 1;
            result.bytes_hot += size;
        }
    }

    let content = bundle.to_bytes()?;
    let hash = hash_bytes(&content);
    store.push(&hash, &content)?;
    tracing::debug!(
        hash = %hash,
        files = bundle.files.len(),
        items_cold = result.items_cold,
        items_hot = result.items_hot,
        "archived tree"
    );
    result.hash = hash;
    Ok(result)
}

fn relative_key(root: &Path, path: &Path) -> Result<String> {
    let relative = path.strip_prefix(root).map_err(|_| CacheError::Corruption {
        path: path.to_path_buf(),
        reason: format!("not under {}", root.display()),
    })?;
    let parts: Vec<_> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect();
    Ok(parts.join("/"))
}

#[cfg(unix)]
fn file_mode(metadata: &fs::Metadata) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    Some(metadata.permissions().mode() & 0o777)
}

#[cfg(not(unix))]
fn file_mode(_metadata: &fs::Metadata) -> Option<u32> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_fetch_distinguishes_not_found() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalStore::new(temp_dir.path(), "default");
        let hash = hash_bytes(b"absent");

        let err = store.fetch(&hash).unwrap_err();
        assert!(err.is_not_found());

        store.push(&hash, b"absent").unwrap();
        assert_eq!(store.fetch(&hash).unwrap(), b"absent");
        assert!(temp_dir.path().join("default").join(&hash).is_file());
    }

    #[test]
    fn test_push_rejects_mismatched_content() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalStore::new(temp_dir.path(), "default");
        let err = store.push(&hash_bytes(b"a"), b"b").unwrap_err();
        assert!(matches!(err, CacheError::IntegrityFailure { .. }));
    }

    #[test]
    fn test_archive_counts_cold_and_hot() {
        let store_dir = TempDir::new().unwrap();
        let store = LocalStore::new(store_dir.path(), "ns");
        let tree = TempDir::new().unwrap();
        fs::create_dir_all(tree.path().join("sub")).unwrap();
        fs::write(tree.path().join("a.txt"), "alpha").unwrap();
        fs::write(tree.path().join("sub/b.txt"), "beta").unwrap();

        let first = archive(&store, tree.path()).unwrap();
        assert_eq!(first.items_cold, 2);
        assert_eq!(first.items_hot, 0);
        assert_eq!(first.bytes_cold, 9);

        let second = archive(&store, tree.path()).unwrap();
        assert_eq!(second.hash, first.hash);
        assert_eq!(second.items_cold, 0);
        assert_eq!(second.items_hot, 2);

        let bundle = Bundle::parse(&first.hash, &store.fetch(&first.hash).unwrap()).unwrap();
        let entry = &bundle.files["sub/b.txt"];
        assert_eq!(store.fetch(entry.hash.as_ref().unwrap()).unwrap(), b"beta");
    }

    #[cfg(unix)]
    #[test]
    fn test_archive_records_symlinks() {
        let store_dir = TempDir::new().unwrap();
        let store = LocalStore::new(store_dir.path(), "ns");
        let tree = TempDir::new().unwrap();
        fs::write(tree.path().join("real.txt"), "x").unwrap();
        std::os::unix::fs::symlink("real.txt", tree.path().join("link")).unwrap();

        let result = archive(&store, tree.path()).unwrap();
        let bundle = Bundle::parse(&result.hash, &store.fetch(&result.hash).unwrap()).unwrap();
        assert_eq!(bundle.files["link"].link.as_deref(), Some("real.txt"));
        assert_eq!(result.items_cold, 1);
    }
}
