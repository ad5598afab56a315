use super::CacheArgs;
use clap::Args;
use isorun_cache::{DiskCache, LocalStore, StoreClient};
use isorun_core::{TreeMode, DEFAULT_GRACE_PERIOD_SECS, DEFAULT_NAMESPACE, DEFAULT_PACKAGE_TIMEOUT_SECS, STORE_DIR_VAR};
use isorun_task::{
    run_task, CacheConfig, ClientCache, DirectoryConfig, ExecutionConfig, FetchConfig,
    LocalClientSource, NamedCacheMount, OutputConfig, PackageInstaller, PackageRequest, TaskRequest,
    TerminationSignal,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Bundle describing the inputs and, optionally, the command
    #[arg(long, value_name = "HASH")]
    pub hash: Option<String>,

    /// Content store directory; without it nothing is fetched or uploaded
    #[arg(long, env = STORE_DIR_VAR, value_name = "DIR")]
    pub store_dir: Option<PathBuf>,

    /// Store namespace
    #[arg(long, default_value = DEFAULT_NAMESPACE)]
    pub namespace: String,

    #[command(flatten)]
    pub caches: CacheArgs,

    /// Map a named cache into the run directory
    #[arg(long = "named-cache", value_name = "NAME:PATH", value_parser = parse_named_cache)]
    pub named_caches: Vec<NamedCacheMount>,

    /// Run-relative path collected as an output
    #[arg(long = "output", value_name = "PATH")]
    pub outputs: Vec<String>,

    /// Working directory relative to the run directory
    #[arg(long, value_name = "PATH")]
    pub relative_cwd: Option<String>,

    /// Seconds before the task is asked to terminate (0 = no limit)
    #[arg(long, default_value_t = 0, value_name = "SECS")]
    pub hard_timeout: u64,

    /// Seconds between the terminate request and the kill
    #[arg(long, default_value_t = DEFAULT_GRACE_PERIOD_SECS, value_name = "SECS")]
    pub grace_period: u64,

    /// Bot state file substituted for its command line marker
    #[arg(long, value_name = "PATH")]
    pub bot_file: Option<PathBuf>,

    /// Write the result record to this file
    #[arg(long, value_name = "PATH")]
    pub json: Option<PathBuf>,

    /// Keep the run, output and temp directories
    #[arg(long)]
    pub leak_temp_dir: bool,

    /// Create the run directories under this directory
    #[arg(long, value_name = "DIR")]
    pub root_dir: Option<PathBuf>,

    /// Materialize inputs as symlinks into the cache instead of hardlinks
    #[arg(long)]
    pub use_symlinks: bool,

    /// Set a variable for the task; an empty value removes it
    #[arg(long = "env", value_name = "KEY=VALUE", value_parser = parse_env)]
    pub env: Vec<(String, Option<String>)>,

    /// Prepend a run-relative path to a variable
    #[arg(long = "env-prefix", value_name = "KEY=RELPATH", value_parser = parse_env_prefix)]
    pub env_prefixes: Vec<(String, String)>,

    /// Package to install before the task runs
    #[arg(long = "package", value_name = "SUBDIR:NAME:VERSION")]
    pub packages: Vec<PackageRequest>,

    /// Package client binary
    #[arg(long, value_name = "PATH")]
    pub package_client: Option<PathBuf>,

    /// Version of the package client to resolve
    #[arg(long, default_value = "latest")]
    pub package_client_version: String,

    /// Directory the package client keeps its cache in
    #[arg(long, value_name = "DIR")]
    pub package_cache_dir: Option<PathBuf>,

    /// Seconds allowed for package installation
    #[arg(long, default_value_t = DEFAULT_PACKAGE_TIMEOUT_SECS, value_name = "SECS")]
    pub package_timeout: u64,

    /// Run without packages when installation fails
    #[arg(long)]
    pub packages_optional: bool,

    /// Account the task runs as
    #[arg(long)]
    pub account: Option<String>,

    /// Command, or extra arguments when running a bundle
    #[arg(last = true, value_name = "ARGS")]
    pub args: Vec<String>,
}

fn parse_named_cache(s: &str) -> Result<NamedCacheMount, String> {
    match s.split_once(':') {
        Some((name, path)) if !name.is_empty() && !path.is_empty() => Ok(NamedCacheMount {
            name: name.to_string(),
            path: path.to_string(),
        }),
        _ => Err(format!("'{s}' must be NAME:PATH")),
    }
}

fn parse_env(s: &str) -> Result<(String, Option<String>), String> {
    match s.split_once('=') {
        Some((key, _)) if key.is_empty() => Err(format!("'{s}' has an empty variable name")),
        Some((key, "")) => Ok((key.to_string(), None)),
        Some((key, value)) => Ok((key.to_string(), Some(value.to_string()))),
        None => Err(format!("'{s}' must be KEY=VALUE")),
    }
}

fn parse_env_prefix(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, path)) if !key.is_empty() && !path.is_empty() => {
            Ok((key.to_string(), path.to_string()))
        }
        _ => Err(format!("'{s}' must be KEY=RELPATH")),
    }
}

/// Group prefix paths by variable, keeping first-seen order
fn group_prefixes(prefixes: Vec<(String, String)>) -> Vec<(String, Vec<String>)> {
    let mut grouped: Vec<(String, Vec<String>)> = Vec::new();
    for (key, path) in prefixes {
        match grouped.iter_mut().find(|(k, _)| *k == key) {
            Some((_, paths)) => paths.push(path),
            None => grouped.push((key, vec![path])),
        }
    }
    grouped
}

impl RunArgs {
    fn into_request(self) -> eyre::Result<TaskRequest> {
        let cache = Arc::new(DiskCache::open(self.caches.content_dir()?, self.caches.policies())?);
        let store = self.store_dir.map(|dir| {
            let store: Arc<dyn StoreClient> = Arc::new(LocalStore::new(dir, self.namespace.clone()));
            store
        });

        let (command, extra_args) = if self.hash.is_some() {
            (Vec::new(), self.args)
        } else {
            (self.args, Vec::new())
        };

        let package_installer = self.package_client.map(|client| {
            let clients = Arc::new(ClientCache::new(Arc::clone(&cache)));
            Arc::new(PackageInstaller::new(
                clients,
                Arc::new(LocalClientSource::new(client)),
                self.package_client_version,
            ))
        });
        let named_cache_pool = if self.named_caches.is_empty() {
            None
        } else {
            Some(self.caches.named_pool()?)
        };

        Ok(TaskRequest::new(
            FetchConfig {
                hash: self.hash,
                store,
                cache: Some(cache),
                tree_mode: if self.use_symlinks {
                    TreeMode::Symlink
                } else {
                    TreeMode::Hardlink
                },
            },
            ExecutionConfig {
                command,
                extra_args,
                relative_cwd: self.relative_cwd,
                hard_timeout: (self.hard_timeout > 0).then(|| Duration::from_secs(self.hard_timeout)),
                grace_period: Duration::from_secs(self.grace_period),
                bot_file: self.bot_file,
                account: self.account,
                env: self.env,
                env_prefixes: group_prefixes(self.env_prefixes),
            },
            OutputConfig {
                outputs: self.outputs,
                result_path: self.json,
            },
            CacheConfig {
                named_cache_pool,
                named_caches: self.named_caches,
                package_installer,
                packages: self.packages,
                package_cache_dir: self.package_cache_dir,
                package_timeout: Duration::from_secs(self.package_timeout),
                packages_optional: self.packages_optional,
            },
            DirectoryConfig {
                root_dir: self.root_dir,
                leak_temp_dir: self.leak_temp_dir,
            },
        ))
    }
}

pub async fn execute(args: RunArgs) -> eyre::Result<i32> {
    let result_file_requested = args.json.is_some();
    let request = args.into_request()?;
    let signal = TerminationSignal::install()?;

    let result = run_task(request, &signal).await;
    if let Some(message) = result.outcome.internal_failure() {
        eprintln!("isorun: internal failure: {message}");
    }
    Ok(result.process_exit_code(result_file_requested))
}
