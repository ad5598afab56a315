/// Constants used throughout the isorun codebase
// Command line markers
pub const OUTDIR_MARKER: &str = "${ISOLATED_OUTDIR}";
pub const EXECUTABLE_SUFFIX_MARKER: &str = "${EXECUTABLE_SUFFIX}";
pub const BOT_FILE_MARKER: &str = "${SWARMING_BOT_FILE}";

// Per-invocation directory prefixes, kept short to bound path length
pub const RUN_DIR_PREFIX: &str = "ir";
pub const OUT_DIR_PREFIX: &str = "io";
pub const TMP_DIR_PREFIX: &str = "it";

// Environment variable names
pub const PATH_VAR: &str = "PATH";
pub const PACKAGE_CACHE_DIR_VAR: &str = "PACKAGE_CACHE_DIR";
pub const CONTEXT_FILE_VAR: &str = "ISORUN_CONTEXT";
pub const ISORUN_LOG_VAR: &str = "ISORUN_LOG";
pub const CACHE_DIR_VAR: &str = "ISORUN_CACHE_DIR";
pub const NAMED_CACHE_ROOT_VAR: &str = "ISORUN_NAMED_CACHE_ROOT";
pub const STORE_DIR_VAR: &str = "ISORUN_STORE_DIR";

// Temp directory variables overwritten for the child
#[cfg(windows)]
pub const TEMP_DIR_VARS: &[&str] = &["TMP", "TEMP"];
#[cfg(not(windows))]
pub const TEMP_DIR_VARS: &[&str] = &["TMPDIR"];

// Executable suffix substituted for EXECUTABLE_SUFFIX_MARKER
#[cfg(windows)]
pub const EXECUTABLE_SUFFIX: &str = ".exe";
#[cfg(not(windows))]
pub const EXECUTABLE_SUFFIX: &str = "";

// Result record defaults
pub const RESULT_VERSION: u32 = 5;
pub const TERMINATED_BEFORE_COMPLETION: &str = "Was terminated before completion";

// Default timing, in seconds
pub const DEFAULT_GRACE_PERIOD_SECS: u64 = 30;
pub const DEFAULT_PACKAGE_TIMEOUT_SECS: u64 = 600;

// Content store defaults
pub const DEFAULT_NAMESPACE: &str = "default";
pub const HASH_ALGORITHM: &str = "sha-256";
