//! Isolated bundle format
//!
//! A bundle is a JSON document describing a file tree by content hash, with
//! an optional embedded command. Bundles are themselves stored by hash and
//! may include other bundles.

use crate::errors::{CacheError, Result};
use crate::hashing::validate_hash;
use isorun_core::{ReadOnlyPolicy, HASH_ALGORITHM};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Component, Path, PathBuf};

/// Current bundle format version
pub const BUNDLE_VERSION: &str = "1.4";

/// One entry of the `files` map
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Content hash of a regular file
    #[serde(rename = "h", default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(rename = "s", default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// Unix permission bits
    #[serde(rename = "m", default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<u32>,
    /// Symlink target, relative to the link's directory
    #[serde(rename = "l", default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
}

impl FileEntry {
    /// Entry for a regular file
    pub fn file(hash: String, size: u64, mode: Option<u32>) -> Self {
        Self {
            hash: Some(hash),
            size: Some(size),
            mode,
            link: None,
        }
    }

    /// Entry for a symlink
    pub fn symlink(target: String) -> Self {
        Self {
            link: Some(target),
            ..Self::default()
        }
    }
}

/// A content-addressed description of a file tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bundle {
    pub algo: String,
    pub version: String,
    #[serde(default)]
    pub files: BTreeMap<String, FileEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relative_cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_only: Option<ReadOnlyPolicy>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub includes: Vec<String>,
}

impl Default for Bundle {
    fn default() -> Self {
        Self {
            algo: HASH_ALGORITHM.to_string(),
            version: BUNDLE_VERSION.to_string(),
            files: BTreeMap::new(),
            command: None,
            relative_cwd: None,
            read_only: None,
            includes: Vec::new(),
        }
    }
}

impl Bundle {
    /// Parse and validate a bundle fetched under `key`
    pub fn parse(key: &str, content: &[u8]) -> Result<Self> {
        let bundle: Bundle =
            serde_json::from_slice(content).map_err(|source| CacheError::Serialization {
                key: key.to_string(),
                source,
            })?;
        bundle.validate(key)?;
        Ok(bundle)
    }

    /// Serialize for storage
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|source| CacheError::Serialization {
            key: "bundle".to_string(),
            source,
        })
    }

    fn validate(&self, key: &str) -> Result<()> {
        let corrupt = |reason: String| CacheError::IntegrityFailure {
            key: key.to_string(),
            expected_hash: key.to_string(),
            actual_hash: reason,
        };

        if self.algo != HASH_ALGORITHM {
            return Err(corrupt(format!("unsupported algo '{}'", self.algo)));
        }
        for (path, entry) in &self.files {
            if !is_safe_relative(path) {
                return Err(corrupt(format!("unsafe path '{path}'")));
            }
            match (&entry.hash, &entry.link) {
                (Some(hash), None) => validate_hash(hash)?,
                (None, Some(_)) => {}
                _ => {
                    return Err(corrupt(format!(
                        "entry '{path}' must have exactly one of 'h' or 'l'"
                    )))
                }
            }
        }
        self.validate_links(key)?;
        for include in &self.includes {
            validate_hash(include)?;
        }
        if let Some(cwd) = &self.relative_cwd {
            if !cwd.is_empty() && !is_safe_relative(cwd) {
                return Err(corrupt(format!("unsafe relative_cwd '{cwd}'")));
            }
        }
        Ok(())
    }

    /// Reject entries that would be materialized through a link entry.
    ///
    /// Merging includes can place a file under a link declared by another
    /// bundle, so this runs again on the merged bundle.
    pub fn validate_links(&self, key: &str) -> Result<()> {
        let links: BTreeSet<PathBuf> = self
            .files
            .iter()
            .filter(|(_, entry)| entry.link.is_some())
            .map(|(path, _)| normalized(path))
            .collect();
        if links.is_empty() {
            return Ok(());
        }
        for path in self.files.keys() {
            let path_buf = normalized(path);
            if let Some(link) = path_buf.ancestors().skip(1).find(|a| links.contains(*a)) {
                return Err(CacheError::IntegrityFailure {
                    key: key.to_string(),
                    expected_hash: key.to_string(),
                    actual_hash: format!("entry '{path}' lies under link '{}'", link.display()),
                });
            }
        }
        Ok(())
    }

    /// Fold an included bundle into this one.
    ///
    /// Entries already present win, so merging in pre-order gives the
    /// including bundle precedence over everything it includes.
    pub fn merge_included(&mut self, included: Bundle) {
        for (path, entry) in included.files {
            self.files.entry(path).or_insert(entry);
        }
        if self.command.is_none() {
            self.command = included.command;
        }
        if self.relative_cwd.is_none() {
            self.relative_cwd = included.relative_cwd;
        }
        if self.read_only.is_none() {
            self.read_only = included.read_only;
        }
    }
}

fn normalized(path: &str) -> PathBuf {
    Path::new(path)
        .components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .collect()
}

/// A relative path that stays inside its root without normalization
fn is_safe_relative(path: &str) -> bool {
    let path = Path::new(path);
    !path.as_os_str().is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}
