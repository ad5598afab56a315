use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::ops::{Deref, DerefMut};

use crate::errors::{Error, Result};

/// Wrapper type for a child process environment
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentVariables(HashMap<String, String>);

impl EnvironmentVariables {
    /// Create a new empty environment
    #[must_use]
    pub fn new() -> Self {
        Self(HashMap::new())
    }

    /// Snapshot the ambient environment of this process
    #[must_use]
    pub fn from_process() -> Self {
        Self(std::env::vars_os()
            .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
            .collect())
    }

    /// Insert a variable, returning the previous value if any
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.0.insert(key.into(), value.into())
    }

    /// Get a variable by key
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&String> {
        self.0.get(key)
    }

    /// Remove a variable, returning its value if present
    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    /// Convert to the inner HashMap
    #[must_use]
    pub fn into_inner(self) -> HashMap<String, String> {
        self.0
    }
}

impl Deref for EnvironmentVariables {
    type Target = HashMap<String, String>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for EnvironmentVariables {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl From<HashMap<String, String>> for EnvironmentVariables {
    fn from(map: HashMap<String, String>) -> Self {
        Self(map)
    }
}

/// How input files are placed into the run tree
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TreeMode {
    /// Hardlink from the cache, copying when linking is impossible
    #[default]
    Hardlink,
    /// Symlink into the cache
    Symlink,
    /// Always copy
    Copy,
}

/// Write policy applied to the materialized run tree
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ReadOnlyPolicy {
    /// Files and directories writable
    #[default]
    Writable,
    /// Files read-only, directories writable (create/delete allowed)
    FilesReadOnly,
    /// Files and directories read-only
    TreeReadOnly,
}

impl ReadOnlyPolicy {
    /// Numeric form used by bundles
    #[must_use]
    pub fn as_u8(self) -> u8 {
        match self {
            ReadOnlyPolicy::Writable => 0,
            ReadOnlyPolicy::FilesReadOnly => 1,
            ReadOnlyPolicy::TreeReadOnly => 2,
        }
    }
}

impl TryFrom<u8> for ReadOnlyPolicy {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(ReadOnlyPolicy::Writable),
            1 => Ok(ReadOnlyPolicy::FilesReadOnly),
            2 => Ok(ReadOnlyPolicy::TreeReadOnly),
            other => Err(Error::validation(format!(
                "read_only must be 0, 1 or 2, got {other}"
            ))),
        }
    }
}

impl Serialize for ReadOnlyPolicy {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.as_u8())
    }
}

impl<'de> Deserialize<'de> for ReadOnlyPolicy {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = u8::deserialize(deserializer)?;
        ReadOnlyPolicy::try_from(value).map_err(serde::de::Error::custom)
    }
}

/// Exact name and version of an installed package
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackagePin {
    pub name: String,
    pub version: String,
}

impl fmt::Display for PackagePin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

/// Pins resolved by the package installer for one run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackagePins {
    /// Bootstrap client actually used, if packages were requested
    pub client: Option<PackagePin>,
    /// One record per requested package, keyed by its subdirectory
    pub packages: Vec<SubdirPin>,
}

/// A pin together with the run-tree subdirectory it was installed into
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubdirPin {
    pub subdir: String,
    #[serde(flatten)]
    pub pin: PackagePin,
}

/// Reference to an archived output tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRef {
    /// Content hash of the archived bundle
    pub hash: String,
    /// Store location the bundle was pushed to
    pub location: String,
    pub namespace: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_only_policy_round_trip() {
        for value in 0u8..=2 {
            let policy = ReadOnlyPolicy::try_from(value).unwrap();
            assert_eq!(policy.as_u8(), value);
        }
        assert!(ReadOnlyPolicy::try_from(3).unwrap_err().is_validation());
    }

    #[test]
    fn test_read_only_policy_rejects_bad_json() {
        let parsed: std::result::Result<ReadOnlyPolicy, _> = serde_json::from_str("7");
        assert!(parsed.is_err());
        let parsed: ReadOnlyPolicy = serde_json::from_str("1").unwrap();
        assert_eq!(parsed, ReadOnlyPolicy::FilesReadOnly);
    }

    #[test]
    fn test_subdir_pin_is_flat() {
        let pin = SubdirPin {
            subdir: "bin".into(),
            pin: PackagePin {
                name: "tools/linux-amd64".into(),
                version: "abc".into(),
            },
        };
        let value = serde_json::to_value(&pin).unwrap();
        assert_eq!(value["subdir"], "bin");
        assert_eq!(value["name"], "tools/linux-amd64");
        assert_eq!(value["version"], "abc");
    }

    #[test]
    fn test_environment_remove() {
        let mut env = EnvironmentVariables::new();
        env.insert("A", "1");
        assert_eq!(env.remove("A").as_deref(), Some("1"));
        assert!(env.get("A").is_none());
    }
}
