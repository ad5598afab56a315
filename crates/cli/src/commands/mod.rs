use clap::{Args, Subcommand};
use isorun_cache::{CachePolicies, NamedCachePool};
use isorun_core::{CACHE_DIR_VAR, NAMED_CACHE_ROOT_VAR};
use std::path::PathBuf;

pub mod run;
pub mod trim;

use self::run::RunArgs;
use self::trim::TrimArgs;

#[derive(Subcommand)]
pub enum Commands {
    /// Run a task from a bundle hash or an explicit command
    Run(RunArgs),

    /// Trim the content cache and the named cache pool
    Trim(TrimArgs),
}

impl Commands {
    /// Run the command and return the process exit code
    pub async fn execute(self) -> eyre::Result<i32> {
        match self {
            Commands::Run(args) => run::execute(args).await,
            Commands::Trim(args) => trim::execute(args),
        }
    }
}

/// Local cache locations and the limits enforced when trimming them
#[derive(Args, Debug, Clone)]
pub struct CacheArgs {
    /// Local content cache directory
    #[arg(long, env = CACHE_DIR_VAR, value_name = "DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Named cache pool directory
    #[arg(long, env = NAMED_CACHE_ROOT_VAR, value_name = "DIR")]
    pub named_cache_root: Option<PathBuf>,

    /// Trim caches above this many bytes (0 = unbounded)
    #[arg(long, default_value_t = 0, value_name = "BYTES")]
    pub max_cache_size: u64,

    /// Trim caches until this many bytes are free (0 = unbounded)
    #[arg(long, default_value_t = 0, value_name = "BYTES")]
    pub min_free_space: u64,

    /// Trim caches above this many items (0 = unbounded)
    #[arg(long, default_value_t = 0, value_name = "N")]
    pub max_items: usize,
}

impl CacheArgs {
    pub fn policies(&self) -> CachePolicies {
        CachePolicies::new(self.max_cache_size, self.min_free_space, self.max_items)
    }

    pub fn content_dir(&self) -> eyre::Result<PathBuf> {
        match &self.cache_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(default_root()?.join("content")),
        }
    }

    pub fn named_pool(&self) -> eyre::Result<NamedCachePool> {
        let root = match &self.named_cache_root {
            Some(dir) => dir.clone(),
            None => default_root()?.join("named"),
        };
        Ok(NamedCachePool::new(root, self.policies()))
    }
}

fn default_root() -> eyre::Result<PathBuf> {
    dirs::cache_dir()
        .map(|dir| dir.join("isorun"))
        .ok_or_else(|| eyre::eyre!("no user cache directory; pass --cache-dir and --named-cache-root"))
}
