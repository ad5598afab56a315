//! Task request: everything one invocation needs, grouped by concern

use crate::packages::{PackageInstaller, PackageRequest};
use isorun_cache::{DiskCache, NamedCachePool, StoreClient};
use isorun_core::{Error, Result, TreeMode, DEFAULT_GRACE_PERIOD_SECS, DEFAULT_PACKAGE_TIMEOUT_SECS};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Where the task's inputs come from
#[derive(Clone, Default)]
pub struct FetchConfig {
    /// Bundle describing the input tree and, optionally, the command
    pub hash: Option<String>,
    pub store: Option<Arc<dyn StoreClient>>,
    pub cache: Option<Arc<DiskCache>>,
    pub tree_mode: TreeMode,
}

/// How the child process is launched and supervised
#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    /// Explicit command; mutually exclusive with a bundle hash
    pub command: Vec<String>,
    /// Appended to a bundle's command
    pub extra_args: Vec<String>,
    pub relative_cwd: Option<String>,
    /// `None` waits for the task indefinitely
    pub hard_timeout: Option<Duration>,
    pub grace_period: Duration,
    pub bot_file: Option<PathBuf>,
    pub account: Option<String>,
    /// Overrides applied on top of the ambient environment; `None` deletes
    pub env: Vec<(String, Option<String>)>,
    /// Variable name and run-relative paths to prepend to it
    pub env_prefixes: Vec<(String, Vec<String>)>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            extra_args: Vec::new(),
            relative_cwd: None,
            hard_timeout: None,
            grace_period: Duration::from_secs(DEFAULT_GRACE_PERIOD_SECS),
            bot_file: None,
            account: None,
            env: Vec::new(),
            env_prefixes: Vec::new(),
        }
    }
}

/// What is collected after the task and where the result goes
#[derive(Debug, Clone, Default)]
pub struct OutputConfig {
    /// Run-relative paths copied into the output tree
    pub outputs: Vec<String>,
    pub result_path: Option<PathBuf>,
}

/// A named cache and the run-relative path it is mapped to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedCacheMount {
    pub name: String,
    pub path: String,
}

/// Shared caches and packages installed into the run tree
#[derive(Clone)]
pub struct CacheConfig {
    pub named_cache_pool: Option<NamedCachePool>,
    pub named_caches: Vec<NamedCacheMount>,
    pub package_installer: Option<Arc<PackageInstaller>>,
    pub packages: Vec<PackageRequest>,
    pub package_cache_dir: Option<PathBuf>,
    pub package_timeout: Duration,
    /// Run without packages instead of failing when installation fails
    pub packages_optional: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            named_cache_pool: None,
            named_caches: Vec::new(),
            package_installer: None,
            packages: Vec::new(),
            package_cache_dir: None,
            package_timeout: Duration::from_secs(DEFAULT_PACKAGE_TIMEOUT_SECS),
            packages_optional: false,
        }
    }
}

/// Placement and lifetime of the per-run directories
#[derive(Debug, Clone, Default)]
pub struct DirectoryConfig {
    /// Parent of the run directories; a system temp directory when unset
    pub root_dir: Option<PathBuf>,
    /// Keep the run directories for inspection
    pub leak_temp_dir: bool,
}

/// Fully resolved description of one task invocation
#[derive(Clone, Default)]
pub struct TaskRequest {
    pub fetch: FetchConfig,
    pub execution: ExecutionConfig,
    pub outputs: OutputConfig,
    pub caches: CacheConfig,
    pub directories: DirectoryConfig,
}

impl TaskRequest {
    pub fn new(
        fetch: FetchConfig,
        execution: ExecutionConfig,
        outputs: OutputConfig,
        caches: CacheConfig,
        directories: DirectoryConfig,
    ) -> Self {
        Self {
            fetch,
            execution,
            outputs,
            caches,
            directories,
        }
    }

    /// Whether outputs can be uploaded, which is what the output directory
    /// marker requires
    pub fn has_store(&self) -> bool {
        self.fetch.store.is_some() && self.fetch.cache.is_some()
    }

    /// Reject inconsistent requests before anything touches the disk
    pub fn validate(&self) -> Result<()> {
        match (&self.fetch.hash, self.execution.command.is_empty()) {
            (Some(_), false) => {
                return Err(Error::validation(
                    "a bundle hash and an explicit command are mutually exclusive",
                ))
            }
            (None, true) => {
                return Err(Error::validation(
                    "either a bundle hash or an explicit command is required",
                ))
            }
            _ => {}
        }
        if self.fetch.hash.is_none() && !self.execution.extra_args.is_empty() {
            return Err(Error::validation(
                "extra arguments are only valid with a bundle hash",
            ));
        }
        if self.fetch.hash.is_some() && !self.has_store() {
            return Err(Error::validation(
                "a bundle hash requires a store and a local cache",
            ));
        }

        for output in &self.outputs.outputs {
            check_relative("output", output)?;
        }
        for mount in &self.caches.named_caches {
            check_relative("named cache path", &mount.path)?;
        }
        if !self.caches.named_caches.is_empty() && self.caches.named_cache_pool.is_none() {
            return Err(Error::validation(
                "named caches were requested without a named cache root",
            ));
        }
        for request in &self.caches.packages {
            check_relative("package subdirectory", &request.subdir)?;
        }
        if !self.caches.packages.is_empty() && self.caches.package_installer.is_none() {
            return Err(Error::validation(
                "packages were requested without a package client",
            ));
        }
        for (name, paths) in &self.execution.env_prefixes {
            for path in paths {
                check_relative(&format!("{name} prefix"), path)?;
            }
        }
        Ok(())
    }
}

fn check_relative(what: &str, path: &str) -> Result<()> {
    let escapes = Path::new(path)
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if path.is_empty() || escapes {
        return Err(Error::validation(format!(
            "{what} '{path}' must be a relative path inside the run directory"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use isorun_cache::{CachePolicies, LocalStore};
    use tempfile::TempDir;

    fn command_request(command: &[&str]) -> TaskRequest {
        TaskRequest {
            execution: ExecutionConfig {
                command: command.iter().map(|s| s.to_string()).collect(),
                ..ExecutionConfig::default()
            },
            ..TaskRequest::default()
        }
    }

    #[test]
    fn test_command_or_hash_required() {
        assert!(TaskRequest::default().validate().unwrap_err().is_validation());
        assert!(command_request(&["true"]).validate().is_ok());
    }

    #[test]
    fn test_hash_and_command_are_exclusive() {
        let temp_dir = TempDir::new().unwrap();
        let mut request = command_request(&["true"]);
        request.fetch.hash = Some("a".repeat(64));
        request.fetch.store = Some(Arc::new(LocalStore::new(temp_dir.path(), "default")));
        request.fetch.cache = Some(Arc::new(
            DiskCache::open(temp_dir.path().join("cache"), CachePolicies::default()).unwrap(),
        ));
        assert!(request.validate().unwrap_err().is_validation());

        request.execution.command.clear();
        request.execution.extra_args = vec!["--flag".into()];
        assert!(request.validate().is_ok());
    }

    #[test]
    fn test_extra_args_need_hash() {
        let mut request = command_request(&["true"]);
        request.execution.extra_args = vec!["x".into()];
        assert!(request.validate().unwrap_err().is_validation());
    }

    #[test]
    fn test_outputs_must_stay_inside_run_dir() {
        for bad in ["../secret", "/etc/passwd", ""] {
            let mut request = command_request(&["true"]);
            request.outputs.outputs = vec![bad.to_string()];
            assert!(request.validate().is_err(), "{bad}");
        }
        let mut request = command_request(&["true"]);
        request.outputs.outputs = vec!["out/a.txt".into(), "./b".into()];
        assert!(request.validate().is_ok());
    }

    #[test]
    fn test_named_caches_need_pool() {
        let mut request = command_request(&["true"]);
        request.caches.named_caches = vec![NamedCacheMount {
            name: "build".into(),
            path: "cache/build".into(),
        }];
        assert!(request.validate().is_err());
    }
}
