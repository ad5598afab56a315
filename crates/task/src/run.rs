//! The run pipeline
//!
//! Fetch, resolve, install, supervise, then always collect, uninstall,
//! clean up and upload. Agent failures at any step are folded into the
//! returned [`ExecutionResult`]; the caller never sees an `Err`.

use crate::cleanup::RunDirectories;
use crate::command::{resolve_command, resolve_cwd, MarkerContext};
use crate::environment::{build_environment, AccountContext, EnvironmentSpec};
use crate::fetch::{apply_read_only, fetch_tree, FetchedTree};
use crate::named_caches::{install_named_caches, uninstall_named_caches};
use crate::outputs::collect_outputs;
use crate::packages::InstalledPackages;
use crate::request::{NamedCacheMount, TaskRequest};
use crate::signal::TerminationSignal;
use crate::supervisor::{supervise, Deadlines, ProcessSpec};
use crate::upload::upload_outputs;
use isorun_core::{
    AgentError, EnvironmentVariables, Error, ExecutionResult, NamedCacheStats, Outcome,
    ReadOnlyPolicy, Result, ResultExt, TaskResult,
};
use isorun_utils::fs::make_tree_writable;
use isorun_utils::write_json_atomic;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::Instrument;

/// What the pipeline learned before it stopped, successfully or not
#[derive(Debug, Default)]
struct Progress {
    task: Option<TaskResult>,
    installed_caches: Vec<NamedCacheMount>,
}

/// Run one task to completion.
///
/// When the request names a result file, a speculative record is written
/// before anything else and replaced by the final record at the end.
pub async fn run_task(request: TaskRequest, signal: &TerminationSignal) -> ExecutionResult {
    let run_id = uuid::Uuid::new_v4().simple().to_string();
    let span = isorun_utils::tracing::run_span(&run_id[..8]);
    run_task_inner(request, signal).instrument(span).await
}

async fn run_task_inner(request: TaskRequest, signal: &TerminationSignal) -> ExecutionResult {
    let start = Instant::now();
    let mut result = ExecutionResult::speculative();
    let result_path = request.outputs.result_path.clone();

    if let Some(path) = &result_path {
        if let Err(e) = write_json_atomic(path, &result.to_record()) {
            tracing::error!(path = %path.display(), error = %e, "cannot write speculative result");
            fail(&mut result, &e, None);
            result.duration = start.elapsed();
            return result;
        }
    }

    let mut progress = Progress::default();
    let mut zombie = false;
    let error = match prepare(&request) {
        Err(e) => Some(e),
        Ok(dirs) => {
            let executed = execute(&request, &dirs, signal, &mut result, &mut progress).await;
            let finalized = finalize(&request, dirs, signal, &mut result, &mut progress, &mut zombie).await;
            executed.err().or(finalized.err())
        }
    };

    match &error {
        Some(e) => fail(&mut result, e, progress.task),
        None => result.outcome = Outcome::Task(progress.task.unwrap_or_default()),
    }
    if zombie {
        result.outcome.apply_exit_code_floor();
    }
    result.duration = start.elapsed();

    if let Some(path) = &result_path {
        if let Err(e) = write_json_atomic(path, &result.to_record()) {
            tracing::error!(path = %path.display(), error = %e, "cannot write result");
            fail(&mut result, &e, progress.task);
        }
    }
    tracing::info!(
        exit_code = ?result.outcome.exit_code(),
        had_hard_timeout = result.outcome.had_hard_timeout(),
        internal_failure = result.outcome.internal_failure().is_some(),
        duration_ms = result.duration.as_millis() as u64,
        "run finished"
    );
    result
}

fn fail(result: &mut ExecutionResult, error: &Error, task: Option<TaskResult>) {
    tracing::error!(error = %error, "internal failure");
    result.outcome = Outcome::Agent(AgentError {
        message: error.to_string(),
        task,
    });
}

fn prepare(request: &TaskRequest) -> Result<RunDirectories> {
    request.validate()?;
    RunDirectories::create(request.directories.root_dir.as_deref())
}

/// Everything up to and including the child process
async fn execute(
    request: &TaskRequest,
    dirs: &RunDirectories,
    signal: &TerminationSignal,
    result: &mut ExecutionResult,
    progress: &mut Progress,
) -> Result<()> {
    let fetched = fetch(request, dirs.run()).await?;
    result.stats.download = request.fetch.hash.is_some().then(|| fetched.stats.clone());

    let exec = &request.execution;
    let ctx = MarkerContext {
        out_dir: request.has_store().then_some(dirs.out()),
        bot_file: exec.bot_file.as_deref(),
    };
    let command = resolve_command(&exec.command, &fetched.command, &exec.extra_args, &ctx)?;
    let relative_cwd = exec.relative_cwd.as_deref().or(fetched.relative_cwd.as_deref());
    let cwd = resolve_cwd(dirs.run(), relative_cwd)?;

    let packages = install_packages(request, dirs, fetched.read_only).await?;
    if let Some(installed) = &packages {
        result.package_pins = installed.pins.clone();
        result.stats.packages = Some(installed.stats.clone());
    }

    if let Some(pool) = &request.caches.named_cache_pool {
        let install = install_named_caches(
            pool,
            dirs.run(),
            &request.caches.named_caches,
            &mut progress.installed_caches,
        )?;
        result.stats.named_caches = Some(NamedCacheStats {
            install,
            ..NamedCacheStats::default()
        });
    }

    let account = exec
        .account
        .as_deref()
        .map(|account| AccountContext::activate(dirs.tmp(), account))
        .transpose()?;

    let spec = EnvironmentSpec {
        overrides: &exec.env,
        prefixes: &exec.env_prefixes,
        package_bin_dir: packages.as_ref().map(|p| p.bin_dir.as_path()),
        package_cache_dir: packages.as_ref().map(|p| p.cache_dir.as_path()),
        context_file: account.as_ref().map(AccountContext::path),
        ..EnvironmentSpec::new(dirs.run(), dirs.tmp())
    };
    let env = build_environment(EnvironmentVariables::from_process(), &spec)?;

    tracing::info!(command = ?command, cwd = %cwd.display(), "starting task");
    let process = ProcessSpec { command, cwd, env };
    let deadlines = Deadlines {
        hard_timeout: exec.hard_timeout,
        grace_period: exec.grace_period,
    };
    let report = supervise(&process, deadlines, signal).await?;
    progress.task = Some(report.task_result());
    Ok(())
}

async fn fetch(request: &TaskRequest, run_dir: &Path) -> Result<FetchedTree> {
    let config = &request.fetch;
    let (Some(hash), Some(store), Some(cache)) = (&config.hash, &config.store, &config.cache) else {
        return Ok(FetchedTree::default());
    };
    let hash = hash.clone();
    let store = Arc::clone(store);
    let cache = Arc::clone(cache);
    let run_dir = run_dir.to_path_buf();
    let mode = config.tree_mode;
    tokio::task::spawn_blocking(move || fetch_tree(store.as_ref(), &cache, &hash, &run_dir, mode))
        .await
        .map_err(|e| Error::store("inputs", format!("fetch task failed: {e}")))?
}

/// Install requested packages; `None` when there are none or when an
/// optional installation failed
async fn install_packages(
    request: &TaskRequest,
    dirs: &RunDirectories,
    read_only: ReadOnlyPolicy,
) -> Result<Option<InstalledPackages>> {
    let caches = &request.caches;
    let Some(installer) = caches.package_installer.as_ref().filter(|_| !caches.packages.is_empty()) else {
        return Ok(None);
    };
    let cache_dir = caches
        .package_cache_dir
        .clone()
        .unwrap_or_else(|| dirs.tmp().join("package_cache"));

    // A fully read-only tree has no room for packages until it is reopened
    let reopened = read_only == ReadOnlyPolicy::TreeReadOnly;
    if reopened {
        make_tree_writable(dirs.run()).fs_context(dirs.run(), "reopen run directory")?;
    }
    let installed = installer
        .install(dirs.run(), &caches.packages, &cache_dir, caches.package_timeout)
        .await;
    if reopened {
        apply_read_only(dirs.run(), read_only)?;
    }

    match installed {
        Ok(installed) => Ok(Some(installed)),
        Err(e) if caches.packages_optional => {
            tracing::warn!(error = %e, "optional package installation failed, continuing without packages");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Steps that run whether or not [`execute`] succeeded
async fn finalize(
    request: &TaskRequest,
    mut dirs: RunDirectories,
    signal: &TerminationSignal,
    result: &mut ExecutionResult,
    progress: &mut Progress,
    zombie: &mut bool,
) -> Result<()> {
    collect_outputs(dirs.run(), dirs.out(), &request.outputs.outputs);

    if let Some(pool) = &request.caches.named_cache_pool {
        if !progress.installed_caches.is_empty() {
            let (uninstall, lost) = uninstall_named_caches(pool, dirs.run(), &progress.installed_caches);
            let stats = result.stats.named_caches.get_or_insert_with(NamedCacheStats::default);
            stats.uninstall = uninstall;
            stats.lost = lost;
        }
    }

    let leak = request.directories.leak_temp_dir;
    if !leak && !dirs.remove_work_dirs() {
        *zombie = true;
    }

    let mut upload_error = None;
    if let Some(store) = request.fetch.store.as_ref().filter(|_| request.has_store()) {
        match upload_outputs(Arc::clone(store), dirs.out(), signal).await {
            Ok(Some((output_ref, stats))) => {
                result.outputs_ref = Some(output_ref);
                result.stats.upload = Some(stats);
            }
            Ok(None) => {}
            Err(e) => upload_error = Some(e),
        }
    }

    if leak {
        dirs.leak();
    } else {
        dirs.remove_out_dir();
    }

    upload_error.map_or(Ok(()), Err)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::packages::{
        ClientCache, LocalClientSource, PackageBackend, PackageInstaller, PackageRequest, PackagesBySubdir,
        PinsBySubdir,
    };
    use crate::request::{CacheConfig, DirectoryConfig, ExecutionConfig, FetchConfig, OutputConfig};
    use async_trait::async_trait;
    use isorun_cache::hashing::hash_bytes;
    use isorun_cache::{archive, Bundle, CachePolicies, DiskCache, LocalStore, NamedCachePool, StoreClient};
    use isorun_core::PackagePin;
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        temp_dir: TempDir,
        store: Arc<LocalStore>,
        cache: Arc<DiskCache>,
    }

    impl Fixture {
        fn new() -> Self {
            let temp_dir = TempDir::new().unwrap();
            let store = Arc::new(LocalStore::new(temp_dir.path().join("store"), "default"));
            let cache = Arc::new(DiskCache::open(temp_dir.path().join("cache"), CachePolicies::default()).unwrap());
            Self {
                temp_dir,
                store,
                cache,
            }
        }

        fn root(&self) -> std::path::PathBuf {
            self.temp_dir.path().join("root")
        }

        fn request(&self, command: &[&str]) -> TaskRequest {
            let store: Arc<dyn StoreClient> = self.store.clone();
            TaskRequest::new(
                FetchConfig {
                    store: Some(store),
                    cache: Some(Arc::clone(&self.cache)),
                    ..FetchConfig::default()
                },
                ExecutionConfig {
                    command: command.iter().map(|s| s.to_string()).collect(),
                    hard_timeout: Some(Duration::from_secs(60)),
                    grace_period: Duration::from_secs(1),
                    ..ExecutionConfig::default()
                },
                OutputConfig {
                    result_path: Some(self.temp_dir.path().join("result.json")),
                    ..OutputConfig::default()
                },
                CacheConfig::default(),
                DirectoryConfig {
                    root_dir: Some(self.root()),
                    leak_temp_dir: false,
                },
            )
        }

        fn record(&self) -> serde_json::Value {
            isorun_utils::read_json(&self.temp_dir.path().join("result.json")).unwrap()
        }
    }

    fn sh(script: &str) -> Vec<&str> {
        vec!["sh", "-c", script]
    }

    /// Writes one executable per requested package, or fails outright
    struct ToolBackend {
        fail: bool,
    }

    #[async_trait]
    impl PackageBackend for ToolBackend {
        async fn ensure(
            &self,
            root: &Path,
            packages: &PackagesBySubdir,
            _cache_dir: &Path,
            _timeout: Duration,
        ) -> Result<PinsBySubdir> {
            if self.fail {
                return Err(Error::package_install("package server unreachable"));
            }
            let mut pins = PinsBySubdir::new();
            for (subdir, entries) in packages {
                fs::create_dir_all(root.join(subdir)).unwrap();
                for (name, version) in entries {
                    fs::write(root.join(subdir).join(name), "#!/bin/sh\necho tool\n").unwrap();
                    pins.entry(subdir.clone()).or_default().push(PackagePin {
                        name: name.clone(),
                        version: version.clone(),
                    });
                }
            }
            Ok(pins)
        }
    }

    impl Fixture {
        fn with_packages(&self, request: &mut TaskRequest, fail: bool) -> std::path::PathBuf {
            let client = self.temp_dir.path().join("pkgclient");
            fs::write(&client, "#!/bin/sh\nexit 0\n").unwrap();
            let clients = Arc::new(ClientCache::new(Arc::clone(&self.cache)));
            let installer = PackageInstaller::new(clients, Arc::new(LocalClientSource::new(client)), "latest")
                .with_backend(Arc::new(ToolBackend { fail }));
            let cache_dir = self.temp_dir.path().join("pkgcache");

            request.caches.package_installer = Some(Arc::new(installer));
            request.caches.packages = vec!["bin:tool:1.2".parse::<PackageRequest>().unwrap()];
            request.caches.package_cache_dir = Some(cache_dir.clone());
            cache_dir
        }
    }

    /// Kills a process the task left running, once the test is done with it
    struct Leftover(std::path::PathBuf);

    impl Drop for Leftover {
        fn drop(&mut self) {
            let pid = fs::read_to_string(&self.0).ok().and_then(|pid| pid.trim().parse::<libc::pid_t>().ok());
            if let Some(pid) = pid {
                unsafe {
                    libc::kill(pid, libc::SIGKILL);
                }
            }
        }
    }

    #[tokio::test]
    async fn test_outdir_marker_produces_output_reference() {
        let fixture = Fixture::new();
        let request = fixture.request(&sh("echo hello > ${ISOLATED_OUTDIR}/out.txt"));

        let result = run_task(request, &TerminationSignal::new()).await;
        assert_eq!(result.outcome, Outcome::Task(TaskResult { exit_code: Some(0), had_hard_timeout: false }));
        let output_ref = result.outputs_ref.expect("outputs uploaded");
        assert!(fixture.store.fetch(&output_ref.hash).is_ok());

        let record = fixture.record();
        assert_eq!(record["exit_code"], 0);
        assert!(record["internal_failure"].is_null());
        assert_eq!(record["outputs_ref"]["hash"], output_ref.hash.as_str());
        assert_eq!(fs::read_dir(fixture.root()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_task_failure_is_not_internal_failure() {
        let fixture = Fixture::new();
        let result = run_task(fixture.request(&sh("exit 4")), &TerminationSignal::new()).await;
        assert_eq!(result.outcome.exit_code(), Some(4));
        assert!(result.outcome.internal_failure().is_none());
        assert!(result.outputs_ref.is_none());
    }

    #[tokio::test]
    async fn test_hard_timeout_is_reported() {
        let fixture = Fixture::new();
        let mut request = fixture.request(&sh("trap '' TERM; sleep 120"));
        request.execution.hard_timeout = Some(Duration::from_secs(1));

        let result = run_task(request, &TerminationSignal::new()).await;
        assert!(result.outcome.had_hard_timeout());
        assert_eq!(result.outcome.exit_code(), Some(-libc::SIGKILL));
        assert!(result.outcome.internal_failure().is_none());
    }

    #[tokio::test]
    async fn test_outdir_marker_without_store_fails_before_spawn() {
        let fixture = Fixture::new();
        let marker = fixture.temp_dir.path().join("spawned");
        let script = format!("touch {} ${{ISOLATED_OUTDIR}}/x", marker.display());
        let mut request = fixture.request(&sh(&script));
        request.fetch = FetchConfig::default();

        let result = run_task(request, &TerminationSignal::new()).await;
        let message = result.outcome.internal_failure().expect("internal failure");
        assert!(message.contains("ISOLATED_OUTDIR"));
        assert_eq!(result.outcome.exit_code(), None);
        assert!(!marker.exists());
        assert_eq!(fixture.record()["exit_code"], serde_json::Value::Null);
    }

    #[tokio::test]
    async fn test_bundle_inputs_and_declared_outputs() {
        let fixture = Fixture::new();
        let inputs = fixture.temp_dir.path().join("inputs");
        fs::create_dir_all(inputs.join("src")).unwrap();
        fs::write(inputs.join("src/data.txt"), "payload").unwrap();
        let files = archive(fixture.store.as_ref(), &inputs).unwrap();

        let bundle = Bundle {
            command: Some(vec!["sh".into(), "-c".into(), "cp data.txt ../$0".into()]),
            relative_cwd: Some("src".into()),
            read_only: Some(ReadOnlyPolicy::FilesReadOnly),
            includes: vec![files.hash],
            ..Bundle::default()
        };
        let content = bundle.to_bytes().unwrap();
        let hash = hash_bytes(&content);
        fixture.store.push(&hash, &content).unwrap();

        let mut request = fixture.request(&[]);
        request.fetch.hash = Some(hash);
        request.execution.extra_args = vec!["copy.txt".into()];
        request.outputs.outputs = vec!["copy.txt".into()];

        let result = run_task(request, &TerminationSignal::new()).await;
        assert_eq!(result.outcome.exit_code(), Some(0));
        assert!(result.outcome.internal_failure().is_none());
        assert!(result.stats.download.as_ref().unwrap().items_cold > 0);

        let output_ref = result.outputs_ref.expect("outputs uploaded");
        let uploaded = Bundle::parse(&output_ref.hash, &fixture.store.fetch(&output_ref.hash).unwrap()).unwrap();
        let entry = &uploaded.files["copy.txt"];
        let content = fixture.store.fetch(entry.hash.as_deref().unwrap()).unwrap();
        assert_eq!(content, b"payload");
    }

    #[tokio::test]
    async fn test_named_cache_persists_between_runs() {
        let fixture = Fixture::new();
        let pool = NamedCachePool::new(fixture.temp_dir.path().join("named"), CachePolicies::default());
        let mount = NamedCacheMount {
            name: "build_cache".into(),
            path: "cache".into(),
        };

        let mut first = fixture.request(&sh("echo warm > cache/state"));
        first.caches.named_cache_pool = Some(pool.clone());
        first.caches.named_caches = vec![mount.clone()];
        let result = run_task(first, &TerminationSignal::new()).await;
        assert_eq!(result.outcome.exit_code(), Some(0));
        assert!(result.stats.named_caches.as_ref().unwrap().lost.is_empty());

        let mut second = fixture.request(&sh("test \"$(cat cache/state)\" = warm"));
        second.caches.named_cache_pool = Some(pool.clone());
        second.caches.named_caches = vec![mount];
        let result = run_task(second, &TerminationSignal::new()).await;
        assert_eq!(result.outcome.exit_code(), Some(0));
        assert_eq!(pool.open().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_leaked_directories_survive() {
        let fixture = Fixture::new();
        let mut request = fixture.request(&sh("true"));
        request.directories.leak_temp_dir = true;

        let result = run_task(request, &TerminationSignal::new()).await;
        assert_eq!(result.outcome.exit_code(), Some(0));
        assert_eq!(fs::read_dir(fixture.root()).unwrap().count(), 3);
    }

    #[tokio::test]
    async fn test_invalid_request_is_internal_failure() {
        let fixture = Fixture::new();
        let mut request = fixture.request(&sh("true"));
        request.execution.extra_args = vec!["x".into()];

        let result = run_task(request, &TerminationSignal::new()).await;
        assert!(result.outcome.internal_failure().is_some());
        assert!(!fixture.root().exists());
    }

    #[tokio::test]
    async fn test_undeletable_run_dir_raises_exit_code() {
        let fixture = Fixture::new();
        let pid_file = fixture.temp_dir.path().join("leftover.pid");
        let _leftover = Leftover(pid_file.clone());
        // A background writer keeps refilling the run directory after the task exits
        let script = format!(
            "( i=0; while :; do : > f$((i % 64)); i=$((i + 1)); done ) & echo $! > {}; \
             while [ ! -e f0 ]; do :; done",
            pid_file.display()
        );

        let result = run_task(fixture.request(&sh(&script)), &TerminationSignal::new()).await;
        assert_eq!(result.outcome.exit_code(), Some(1));
        assert!(result.outcome.internal_failure().is_none());
        assert_eq!(fixture.record()["exit_code"], 1);
    }

    #[tokio::test]
    async fn test_lost_named_cache_does_not_block_cleanup() {
        let fixture = Fixture::new();
        let pool = NamedCachePool::new(fixture.temp_dir.path().join("named"), CachePolicies::default());
        let mut request = fixture.request(&sh("rm -rf cache && echo clobbered > cache"));
        request.caches.named_cache_pool = Some(pool.clone());
        request.caches.named_caches = vec![NamedCacheMount {
            name: "build_cache".into(),
            path: "cache".into(),
        }];

        let result = run_task(request, &TerminationSignal::new()).await;
        assert_eq!(result.outcome.exit_code(), Some(0));
        assert!(result.outcome.internal_failure().is_none());
        let stats = result.stats.named_caches.expect("named cache stats");
        assert_eq!(stats.lost, vec!["build_cache".to_string()]);
        assert_eq!(fs::read_dir(fixture.root()).unwrap().count(), 0);
        assert_eq!(pool.open().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_packages_reach_the_task() {
        let fixture = Fixture::new();
        let mut request = fixture.request(&[]);
        let cache_dir = fixture.with_packages(&mut request, false);
        let script = format!(
            "test -f bin/tool && test \"$PACKAGE_CACHE_DIR\" = {cache} && \
             test \"$(command -v pkgclient)\" = {cache}/bin/pkgclient",
            cache = cache_dir.display()
        );
        request.execution.command = sh(&script).iter().map(|s| s.to_string()).collect();

        let result = run_task(request, &TerminationSignal::new()).await;
        assert_eq!(result.outcome.exit_code(), Some(0), "{:?}", result.outcome);
        let pins = &result.package_pins;
        assert_eq!(pins.client.as_ref().unwrap().name, "pkgclient");
        assert_eq!(pins.packages.len(), 1);
        assert_eq!(pins.packages[0].subdir, "bin");
        assert_eq!(pins.packages[0].pin.name, "tool");
        assert!(result.stats.packages.is_some());
        assert_eq!(fixture.record()["package_pins"]["packages"][0]["name"], "tool");
    }

    #[tokio::test]
    async fn test_optional_packages_degrade_to_none() {
        let fixture = Fixture::new();
        let mut request = fixture.request(&sh("test ! -e bin/tool"));
        fixture.with_packages(&mut request, true);
        request.caches.packages_optional = true;

        let result = run_task(request, &TerminationSignal::new()).await;
        assert_eq!(result.outcome.exit_code(), Some(0));
        assert!(result.outcome.internal_failure().is_none());
        assert!(result.package_pins.packages.is_empty());
        assert!(result.stats.packages.is_none());
    }

    #[tokio::test]
    async fn test_required_packages_failure_is_internal_failure() {
        let fixture = Fixture::new();
        let marker = fixture.temp_dir.path().join("spawned");
        let script = format!("touch {}", marker.display());
        let mut request = fixture.request(&sh(&script));
        fixture.with_packages(&mut request, true);

        let result = run_task(request, &TerminationSignal::new()).await;
        let message = result.outcome.internal_failure().expect("internal failure");
        assert!(message.contains("package server unreachable"), "{message}");
        assert!(!marker.exists());
        assert_eq!(fs::read_dir(fixture.root()).unwrap().count(), 0);
    }
}
