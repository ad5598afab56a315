//! Trimming policies shared by the local content cache and the named-cache pool

use serde::{Deserialize, Serialize};

/// Limits enforced when a cache is trimmed.
///
/// A zero value disables the corresponding limit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachePolicies {
    /// Maximum total size of cached items in bytes
    pub max_cache_size: u64,
    /// Minimum free space to keep on the cache's file system in bytes
    pub min_free_space: u64,
    /// Maximum number of cached items
    pub max_items: usize,
}

impl CachePolicies {
    /// Create policies with explicit limits
    #[must_use]
    pub fn new(max_cache_size: u64, min_free_space: u64, max_items: usize) -> Self {
        Self {
            max_cache_size,
            min_free_space,
            max_items,
        }
    }

    /// Whether `items` entries totalling `size` bytes exceed the count or size limit
    pub fn over_limits(&self, items: usize, size: u64) -> bool {
        (self.max_items > 0 && items > self.max_items)
            || (self.max_cache_size > 0 && size > self.max_cache_size)
    }

    /// Whether `free` bytes of free space is below the minimum
    pub fn low_on_space(&self, free: u64) -> bool {
        self.min_free_space > 0 && free < self.min_free_space
    }
}
