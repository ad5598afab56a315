//! Content storage for isorun
//!
//! This crate provides:
//! - The bundle format describing a file tree by content hash
//! - A store client abstraction with a filesystem-backed implementation
//! - The local content cache used to materialize run trees
//! - The named-cache pool mapped into run trees between tasks
//! - Combined trimming of both caches

pub mod bundle;
pub mod config;
pub mod disk_cache;
pub mod errors;
pub mod hashing;
pub mod named;
pub mod store;
pub mod trim;

pub use bundle::{Bundle, FileEntry};
pub use config::CachePolicies;
pub use disk_cache::{CachedObject, DiskCache};
pub use errors::{CacheError, Result};
pub use named::{NamedCachePool, PoolGuard};
pub use store::{archive, ArchiveResult, LocalStore, StoreClient};
pub use trim::{trim_all, trim_caches, Trimmable};
