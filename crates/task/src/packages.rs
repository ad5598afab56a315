//! Package installer
//!
//! Packages are installed by a bootstrap client binary. The client itself is
//! resolved through a [`ClientSource`] and kept in the local content cache,
//! keyed by its instance id.

use async_trait::async_trait;
use isorun_cache::{hashing, DiskCache};
use isorun_core::{
    Error, PackagePin, PackagePins, PackageStats, Result, ResultExt, SubdirPin, TreeMode,
    EXECUTABLE_SUFFIX,
};
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// One requested package
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageRequest {
    /// Run-relative directory the package is installed into
    pub subdir: String,
    pub name: String,
    pub version: String,
}

impl std::str::FromStr for PackageRequest {
    type Err = Error;

    /// Parse `SUBDIR:NAME:VERSION`; the version may itself contain colons
    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.splitn(3, ':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(subdir), Some(name), Some(version))
                if !subdir.is_empty() && !name.is_empty() && !version.is_empty() =>
            {
                Ok(Self {
                    subdir: subdir.to_string(),
                    name: name.to_string(),
                    version: version.to_string(),
                })
            }
            _ => Err(Error::validation(format!(
                "package '{s}' must be SUBDIR:NAME:VERSION"
            ))),
        }
    }
}

/// Where client binaries come from
pub trait ClientSource: Send + Sync {
    /// Name reported in the client pin
    fn name(&self) -> &str;

    /// Resolve a version (possibly symbolic) to an immutable instance id
    fn resolve(&self, version: &str) -> Result<String>;

    /// Fetch the client binary for an instance id
    fn fetch(&self, instance_id: &str) -> Result<Vec<u8>>;
}

/// Client source backed by a binary on the local file system.
///
/// The instance id is the content hash of the binary.
#[derive(Debug, Clone)]
pub struct LocalClientSource {
    path: PathBuf,
}

impl LocalClientSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ClientSource for LocalClientSource {
    fn name(&self) -> &str {
        self.path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("client")
    }

    fn resolve(&self, _version: &str) -> Result<String> {
        hashing::hash_file(&self.path).map_err(Error::from)
    }

    fn fetch(&self, instance_id: &str) -> Result<Vec<u8>> {
        let content = std::fs::read(&self.path).fs_context(&self.path, "read package client")?;
        hashing::verify(instance_id, &content)?;
        Ok(content)
    }
}

/// Versions that always name the same content, and may be memoized
pub fn is_immutable_version(version: &str) -> bool {
    hashing::is_valid_hash(version) || version.contains(':')
}

/// Client binaries resolved so far. Constructed once per process and passed
/// to every installer that needs it.
pub struct ClientCache {
    cache: Arc<DiskCache>,
    resolved: Mutex<HashMap<String, String>>,
}

impl ClientCache {
    pub fn new(cache: Arc<DiskCache>) -> Self {
        Self {
            cache,
            resolved: Mutex::new(HashMap::new()),
        }
    }

    /// Instance id for `version`, consulting the memo for immutable versions
    pub fn resolve(&self, source: &dyn ClientSource, version: &str) -> Result<String> {
        if let Some(instance_id) = self.resolved.lock().get(version) {
            return Ok(instance_id.clone());
        }
        let instance_id = source.resolve(version)?;
        if is_immutable_version(version) {
            self.resolved
                .lock()
                .insert(version.to_string(), instance_id.clone());
        }
        Ok(instance_id)
    }

    /// Place an executable copy of the client into `bin_dir`
    pub fn ensure_client(
        &self,
        source: &dyn ClientSource,
        version: &str,
        bin_dir: &Path,
    ) -> Result<(PathBuf, PackagePin)> {
        let instance_id = self.resolve(source, version)?;
        let object = self.cache.lookup(&instance_id)?;
        if !object.exists() {
            let content = source.fetch(&instance_id)?;
            object.write(&content)?;
            tracing::info!(instance_id = %instance_id, "cached package client");
        }

        let client = bin_dir.join(format!("{}{EXECUTABLE_SUFFIX}", source.name()));
        let current = hashing::hash_file(&client).ok();
        if current.as_deref() != Some(instance_id.as_str()) {
            if let Some(previous) = current {
                tracing::info!(previous = %previous, instance_id = %instance_id, "replacing package client");
                std::fs::remove_file(&client).fs_context(&client, "remove stale package client")?;
            }
            object.link_to(&client, TreeMode::Copy)?;
            make_executable(&client)?;
        }
        Ok((
            client,
            PackagePin {
                name: source.name().to_string(),
                version: instance_id,
            },
        ))
    }

    #[cfg(test)]
    fn is_memoized(&self, version: &str) -> bool {
        self.resolved.lock().contains_key(version)
    }
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
        .fs_context(path, "make package client executable")
}

#[cfg(not(unix))]
fn make_executable(path: &Path) -> Result<()> {
    isorun_utils::fs::set_read_only(path, false).fs_context(path, "make package client writable")
}

/// Packages grouped by install subdirectory, as (name, version)
pub type PackagesBySubdir = BTreeMap<String, Vec<(String, String)>>;

/// Pins grouped by install subdirectory
pub type PinsBySubdir = BTreeMap<String, Vec<PackagePin>>;

/// Something that can install packages into a root
#[async_trait]
pub trait PackageBackend: Send + Sync {
    async fn ensure(
        &self,
        root: &Path,
        packages: &PackagesBySubdir,
        cache_dir: &Path,
        timeout: Duration,
    ) -> Result<PinsBySubdir>;
}

/// Drives the bootstrapped client binary
#[derive(Debug, Clone)]
pub struct ClientBackend {
    client: PathBuf,
}

impl ClientBackend {
    pub fn new(client: impl Into<PathBuf>) -> Self {
        Self {
            client: client.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct EnsureOutput {
    #[serde(default)]
    result: BTreeMap<String, Vec<EnsuredPackage>>,
}

#[derive(Debug, Deserialize)]
struct EnsuredPackage {
    package: String,
    instance_id: String,
}

#[async_trait]
impl PackageBackend for ClientBackend {
    async fn ensure(
        &self,
        root: &Path,
        packages: &PackagesBySubdir,
        cache_dir: &Path,
        timeout: Duration,
    ) -> Result<PinsBySubdir> {
        let scratch = tempfile::Builder::new()
            .prefix("isorun-ensure")
            .tempdir()
            .map_err(|e| Error::file_system(std::env::temp_dir(), "create ensure directory", e))?;
        let ensure_file = scratch.path().join("ensure.txt");
        let json_output = scratch.path().join("output.json");

        let mut manifest = String::new();
        for (subdir, entries) in packages {
            manifest.push_str(&format!("@Subdir {subdir}\n"));
            for (name, version) in entries {
                manifest.push_str(&format!("{name} {version}\n"));
            }
        }
        std::fs::write(&ensure_file, manifest).fs_context(&ensure_file, "write ensure file")?;

        let args: Vec<String> = vec![
            "ensure".into(),
            "-root".into(),
            root.to_string_lossy().into_owned(),
            "-ensure-file".into(),
            ensure_file.to_string_lossy().into_owned(),
            "-cache-dir".into(),
            cache_dir.to_string_lossy().into_owned(),
            "-json-output".into(),
            json_output.to_string_lossy().into_owned(),
        ];
        let command_name = self.client.to_string_lossy().into_owned();
        tracing::debug!(client = %command_name, args = ?args, "running package client");

        let mut command = tokio::process::Command::new(&self.client);
        command.args(&args).kill_on_drop(true);
        let output = tokio::time::timeout(timeout, command.output())
            .await
            .map_err(|_| Error::timeout("package ensure", timeout))?
            .map_err(|e| {
                Error::command_execution(&command_name, args.clone(), format!("failed to start: {e}"), None)
            })?;

        if !output.status.success() {
            return Err(Error::command_execution(
                &command_name,
                args,
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
                output.status.code(),
            ));
        }

        let raw = std::fs::read(&json_output).fs_context(&json_output, "read ensure output")?;
        let parsed: EnsureOutput = serde_json::from_slice(&raw)?;
        Ok(parsed
            .result
            .into_iter()
            .map(|(subdir, pins)| {
                let pins = pins
                    .into_iter()
                    .map(|p| PackagePin {
                        name: p.package,
                        version: p.instance_id,
                    })
                    .collect();
                (subdir, pins)
            })
            .collect())
    }
}

/// What an installation left behind for the environment builder
#[derive(Debug, Clone, PartialEq)]
pub struct InstalledPackages {
    pub pins: PackagePins,
    /// Directory holding the client, prepended to `PATH`
    pub bin_dir: PathBuf,
    /// Exported as `PACKAGE_CACHE_DIR`
    pub cache_dir: PathBuf,
    pub stats: PackageStats,
}

/// Installs packages into a run tree with a bootstrapped client
pub struct PackageInstaller {
    clients: Arc<ClientCache>,
    source: Arc<dyn ClientSource>,
    client_version: String,
    /// Overrides the client-driven backend, mainly for tests
    backend: Option<Arc<dyn PackageBackend>>,
}

impl PackageInstaller {
    pub fn new(
        clients: Arc<ClientCache>,
        source: Arc<dyn ClientSource>,
        client_version: impl Into<String>,
    ) -> Self {
        Self {
            clients,
            source,
            client_version: client_version.into(),
            backend: None,
        }
    }

    /// Use `backend` instead of driving the client binary
    pub fn with_backend(mut self, backend: Arc<dyn PackageBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Install `requests` under `run_dir` within `timeout`.
    ///
    /// The client goes into `<cache_dir>/bin`. Each installed subdirectory
    /// is made read-only afterwards.
    pub async fn install(
        &self,
        run_dir: &Path,
        requests: &[PackageRequest],
        cache_dir: &Path,
        timeout: Duration,
    ) -> Result<InstalledPackages> {
        let start = Instant::now();
        tokio::time::timeout(timeout, self.install_inner(run_dir, requests, cache_dir, timeout, start))
            .await
            .map_err(|_| Error::timeout("package installation", timeout))?
            .map_err(|e| match e {
                Error::PackageInstall { .. } | Error::Timeout { .. } => e,
                other => Error::package_install(other.to_string()),
            })
    }

    async fn install_inner(
        &self,
        run_dir: &Path,
        requests: &[PackageRequest],
        cache_dir: &Path,
        timeout: Duration,
        start: Instant,
    ) -> Result<InstalledPackages> {
        let bin_dir = cache_dir.join("bin");
        std::fs::create_dir_all(&bin_dir).fs_context(&bin_dir, "create package bin directory")?;

        let (client, client_pin) =
            self.clients
                .ensure_client(self.source.as_ref(), &self.client_version, &bin_dir)?;
        let get_client_duration = start.elapsed();

        let mut by_subdir = PackagesBySubdir::new();
        for request in requests {
            by_subdir
                .entry(request.subdir.clone())
                .or_default()
                .push((request.name.clone(), request.version.clone()));
        }

        let remaining = timeout.saturating_sub(start.elapsed());
        let resolved = match &self.backend {
            Some(backend) => backend.ensure(run_dir, &by_subdir, cache_dir, remaining).await?,
            None => {
                ClientBackend::new(client)
                    .ensure(run_dir, &by_subdir, cache_dir, remaining)
                    .await?
            }
        };

        let mut packages = Vec::with_capacity(requests.len());
        for (index, request) in requests.iter().enumerate() {
            // Pins come back per subdirectory in request order
            let position = requests[..index]
                .iter()
                .filter(|r| r.subdir == request.subdir)
                .count();
            let pin = resolved
                .get(&request.subdir)
                .and_then(|pins| pins.get(position))
                .cloned()
                .ok_or_else(|| {
                    Error::package_install(format!(
                        "no pin returned for {} in '{}'",
                        request.name, request.subdir
                    ))
                })?;
            packages.push(SubdirPin {
                subdir: request.subdir.clone(),
                pin,
            });
        }

        for subdir in by_subdir.keys() {
            let installed = run_dir.join(subdir);
            if installed.exists() {
                isorun_utils::fs::make_tree_read_only(&installed)
                    .fs_context(&installed, "protect installed packages")?;
            }
        }

        let stats = PackageStats {
            duration: start.elapsed(),
            get_client_duration,
        };
        tracing::info!(
            packages = packages.len(),
            duration_ms = stats.duration.as_millis() as u64,
            "installed packages"
        );
        Ok(InstalledPackages {
            pins: PackagePins {
                client: Some(client_pin),
                packages,
            },
            bin_dir,
            cache_dir: cache_dir.to_path_buf(),
            stats,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use isorun_cache::CachePolicies;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct CountingSource {
        content: Vec<u8>,
        resolves: AtomicUsize,
    }

    impl ClientSource for CountingSource {
        fn name(&self) -> &str {
            "client"
        }

        fn resolve(&self, _version: &str) -> Result<String> {
            self.resolves.fetch_add(1, Ordering::SeqCst);
            Ok(hashing::hash_bytes(&self.content))
        }

        fn fetch(&self, _instance_id: &str) -> Result<Vec<u8>> {
            Ok(self.content.clone())
        }
    }

    struct FakeBackend {
        delay: Duration,
    }

    #[async_trait]
    impl PackageBackend for FakeBackend {
        async fn ensure(
            &self,
            root: &Path,
            packages: &PackagesBySubdir,
            _cache_dir: &Path,
            _timeout: Duration,
        ) -> Result<PinsBySubdir> {
            tokio::time::sleep(self.delay).await;
            let mut pins = PinsBySubdir::new();
            for (subdir, entries) in packages {
                std::fs::create_dir_all(root.join(subdir)).unwrap();
                for (name, version) in entries {
                    std::fs::write(root.join(subdir).join(name.replace('/', "_")), version).unwrap();
                    pins.entry(subdir.clone()).or_default().push(PackagePin {
                        name: name.clone(),
                        version: format!("resolved-{version}"),
                    });
                }
            }
            Ok(pins)
        }
    }

    fn client_cache(temp_dir: &TempDir) -> Arc<ClientCache> {
        let cache = DiskCache::open(temp_dir.path().join("cache"), CachePolicies::default()).unwrap();
        Arc::new(ClientCache::new(Arc::new(cache)))
    }

    fn source() -> Arc<CountingSource> {
        Arc::new(CountingSource {
            content: b"#!/bin/sh\nexit 0\n".to_vec(),
            resolves: AtomicUsize::new(0),
        })
    }

    #[test]
    fn test_parse_package_request() {
        let request: PackageRequest = "bin:infra/tool:version:1.2".parse().unwrap();
        assert_eq!(request.subdir, "bin");
        assert_eq!(request.name, "infra/tool");
        assert_eq!(request.version, "version:1.2");
        assert!("bin:tool".parse::<PackageRequest>().is_err());
    }

    #[test]
    fn test_only_immutable_versions_are_memoized() {
        let temp_dir = TempDir::new().unwrap();
        let clients = client_cache(&temp_dir);
        let source = source();

        clients.resolve(source.as_ref(), "latest").unwrap();
        clients.resolve(source.as_ref(), "latest").unwrap();
        assert!(!clients.is_memoized("latest"));
        assert_eq!(source.resolves.load(Ordering::SeqCst), 2);

        clients.resolve(source.as_ref(), "git_revision:abc").unwrap();
        clients.resolve(source.as_ref(), "git_revision:abc").unwrap();
        assert!(clients.is_memoized("git_revision:abc"));
        assert_eq!(source.resolves.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_client_is_replaced_when_instance_changes() {
        let temp_dir = TempDir::new().unwrap();
        let clients = client_cache(&temp_dir);
        let bin_dir = temp_dir.path().join("bin");
        std::fs::create_dir_all(&bin_dir).unwrap();

        let (client, pin) = clients.ensure_client(source().as_ref(), "latest", &bin_dir).unwrap();
        assert_eq!(pin.version, hashing::hash_bytes(&source().content));

        let newer = CountingSource {
            content: b"#!/bin/sh\nexit 1\n".to_vec(),
            resolves: AtomicUsize::new(0),
        };
        let (again, pin) = clients.ensure_client(&newer, "latest", &bin_dir).unwrap();
        assert_eq!(again, client);
        assert_eq!(pin.version, hashing::hash_bytes(&newer.content));
        assert_eq!(std::fs::read(&client).unwrap(), newer.content);
    }

    #[tokio::test]
    async fn test_install_returns_pins_in_request_order() {
        let temp_dir = TempDir::new().unwrap();
        let run_dir = temp_dir.path().join("run");
        std::fs::create_dir_all(&run_dir).unwrap();
        let installer = PackageInstaller::new(client_cache(&temp_dir), source(), "latest")
            .with_backend(Arc::new(FakeBackend {
                delay: Duration::ZERO,
            }));
        let requests = vec![
            "bin:tool_a:1".parse().unwrap(),
            "lib:lib_b:2".parse().unwrap(),
            "bin:tool_c:3".parse().unwrap(),
        ];

        let installed = installer
            .install(&run_dir, &requests, &temp_dir.path().join("pkgcache"), Duration::from_secs(30))
            .await
            .unwrap();

        let names: Vec<_> = installed
            .pins
            .packages
            .iter()
            .map(|p| (p.subdir.as_str(), p.pin.name.as_str()))
            .collect();
        assert_eq!(names, vec![("bin", "tool_a"), ("lib", "lib_b"), ("bin", "tool_c")]);
        assert_eq!(installed.pins.packages[2].pin.version, "resolved-3");
        assert!(installed.pins.client.is_some());
        assert!(installed.bin_dir.join(format!("client{EXECUTABLE_SUFFIX}")).is_file());
        assert!(std::fs::metadata(run_dir.join("bin/tool_a")).unwrap().permissions().readonly());

        isorun_utils::fs::make_tree_writable(&run_dir).unwrap();
    }

    #[tokio::test]
    async fn test_install_times_out() {
        let temp_dir = TempDir::new().unwrap();
        let installer = PackageInstaller::new(client_cache(&temp_dir), source(), "latest")
            .with_backend(Arc::new(FakeBackend {
                delay: Duration::from_secs(5),
            }));
        let requests = vec!["bin:tool:1".parse().unwrap()];

        let err = installer
            .install(temp_dir.path(), &requests, &temp_dir.path().join("pkgcache"), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }), "{err}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_client_backend_parses_json_output() {
        let temp_dir = TempDir::new().unwrap();
        let client = temp_dir.path().join("fake-client");
        std::fs::write(
            &client,
            r#"#!/bin/sh
while [ $# -gt 0 ]; do
  if [ "$1" = "-json-output" ]; then out="$2"; fi
  shift
done
printf '{"result":{"bin":[{"package":"tool","instance_id":"abc123"}]}}' > "$out"
"#,
        )
        .unwrap();
        make_executable(&client).unwrap();

        let mut packages = PackagesBySubdir::new();
        packages.insert("bin".into(), vec![("tool".into(), "latest".into())]);
        let pins = ClientBackend::new(&client)
            .ensure(temp_dir.path(), &packages, temp_dir.path(), Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(pins["bin"][0].version, "abc123");
    }
}
