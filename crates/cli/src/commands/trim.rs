use super::CacheArgs;
use clap::Args;
use isorun_cache::{trim_caches, DiskCache};

#[derive(Args, Debug)]
pub struct TrimArgs {
    #[command(flatten)]
    pub caches: CacheArgs,
}

/// Evict the oldest entries across both caches and print how many went
pub fn execute(args: TrimArgs) -> eyre::Result<i32> {
    let content = DiskCache::open(args.caches.content_dir()?, args.caches.policies())?;
    let pool = args.caches.named_pool()?;

    let evicted = {
        let mut guard = pool.open()?;
        trim_caches(&content, &mut guard)?
    };
    tracing::info!(
        evicted,
        content_items = content.len(),
        content_size = content.total_size(),
        "caches trimmed"
    );
    println!("{evicted}");
    Ok(0)
}
