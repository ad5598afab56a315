//! Isolated task execution for isorun
//!
//! A [`TaskRequest`] goes through [`run_task`]: the input tree is fetched,
//! the command resolved, packages and named caches installed, and the child
//! supervised under its hard timeout. Outputs are then collected and
//! uploaded and every per-run directory is torn down, whatever happened
//! before.

pub mod cleanup;
pub mod command;
pub mod environment;
pub mod fetch;
pub mod named_caches;
pub mod outputs;
pub mod packages;
pub mod request;
pub mod run;
pub mod signal;
pub mod supervisor;
pub mod upload;

pub use cleanup::RunDirectories;
pub use packages::{
    ClientBackend, ClientCache, ClientSource, InstalledPackages, LocalClientSource,
    PackageBackend, PackageInstaller, PackageRequest,
};
pub use request::{
    CacheConfig, DirectoryConfig, ExecutionConfig, FetchConfig, NamedCacheMount, OutputConfig,
    TaskRequest,
};
pub use run::run_task;
pub use signal::TerminationSignal;
pub use supervisor::{ProcessReport, SupervisorState};
