//! Combined trimming of the content cache and the named-cache pool
//!
//! Both caches stamp entries from the same wall clock, so comparing their
//! oldest timestamps gives one global eviction order.

use crate::disk_cache::DiskCache;
use crate::errors::Result;
use crate::named::PoolGuard;

/// A cache that can evict its own entries
pub trait Trimmable {
    /// Short label used in logs
    fn name(&self) -> &'static str;

    /// Timestamp of the least recently used entry, if any
    fn oldest_timestamp(&self) -> Option<u64>;

    /// Evict entries until the cache's policies hold; returns the count
    fn trim(&mut self) -> Result<usize>;
}

impl Trimmable for &DiskCache {
    fn name(&self) -> &'static str {
        "content"
    }

    fn oldest_timestamp(&self) -> Option<u64> {
        self.get_oldest().and_then(|key| self.get_timestamp(&key))
    }

    fn trim(&mut self) -> Result<usize> {
        DiskCache::trim(*self)
    }
}

impl Trimmable for &mut PoolGuard {
    fn name(&self) -> &'static str {
        "named"
    }

    fn oldest_timestamp(&self) -> Option<u64> {
        self.get_oldest().and_then(|name| self.get_timestamp(&name))
    }

    fn trim(&mut self) -> Result<usize> {
        PoolGuard::trim(&mut **self)
    }
}

/// Trim every cache, the one holding the globally oldest entry first.
///
/// A cache without entries sorts first. Returns the total number of
/// entries evicted.
pub fn trim_all(caches: &mut [&mut dyn Trimmable]) -> Result<usize> {
    caches.sort_by_key(|cache| cache.oldest_timestamp());

    let mut total = 0;
    for cache in caches.iter_mut() {
        let evicted = cache.trim()?;
        tracing::debug!(cache = cache.name(), evicted, "trimmed cache");
        total += evicted;
    }
    Ok(total)
}

/// Trim the content cache and the named-cache pool together.
///
/// Requires the pool guard, so it always runs under the pool's lock.
pub fn trim_caches(content: &DiskCache, pool: &mut PoolGuard) -> Result<usize> {
    let mut content = content;
    let mut pool = pool;
    let mut caches: [&mut dyn Trimmable; 2] = [&mut content, &mut pool];
    trim_all(&mut caches)
}
