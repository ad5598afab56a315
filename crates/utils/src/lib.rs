//! Shared utilities for isorun
//!
//! File system helpers used to build and tear down run trees, atomic writes
//! for result files, directory locking for shared pools, and tracing setup.

pub mod atomic_file;
pub mod cleanup;
pub mod directory_lock;
pub mod fs;
pub mod tracing;

pub use atomic_file::*;
pub use cleanup::*;
pub use directory_lock::*;
