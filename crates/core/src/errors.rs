use std::path::PathBuf;
use std::time::Duration;

/// Result type alias for isorun operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for the agent's own machinery.
///
/// A task that runs and exits non-zero is never an `Error`; these variants
/// only describe conditions where the agent itself could not do its job.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Request rejected before any process was spawned
    #[error("validation error: {message}")]
    Validation { message: String },

    /// File system operations
    #[error("file system {operation} operation failed for '{path}': {source}")]
    FileSystem {
        path: PathBuf,
        operation: String,
        #[source]
        source: std::io::Error,
    },

    /// JSON serialization/deserialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: serde_json::Error,
    },

    /// Configuration errors
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Content store or local cache failures
    #[error("store error for '{key}': {message}")]
    Store { key: String, message: String },

    /// Fetched content does not match its key
    #[error("content integrity error for '{key}': {message}")]
    Integrity { key: String, message: String },

    /// Package installation errors
    #[error("package installation failed: {message}")]
    PackageInstall { message: String },

    /// Named cache pool errors
    #[error("named cache '{name}' error: {message}")]
    NamedCache { name: String, message: String },

    /// Operation timeout errors
    #[error("operation '{operation}' timed out after {duration:?}")]
    Timeout {
        operation: String,
        duration: Duration,
    },

    /// Operation aborted by a termination request
    #[error("operation '{operation}' was cancelled by a termination request")]
    Cancelled { operation: String },

    /// Command execution errors
    #[error("{}", format_command_error(.command, .args, .message, .exit_code))]
    CommandExecution {
        command: String,
        args: Vec<String>,
        message: String,
        exit_code: Option<i32>,
    },
}

fn format_command_error(
    command: &str,
    args: &[String],
    message: &str,
    exit_code: &Option<i32>,
) -> String {
    let args_str = args.join(" ");
    let invocation = if args_str.is_empty() {
        command.to_string()
    } else {
        format!("{command} {args_str}")
    };
    match exit_code {
        Some(code) => format!("command '{invocation}' failed with exit code {code}: {message}"),
        None => format!("command '{invocation}' failed: {message}"),
    }
}

// Conversion implementations
impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::FileSystem {
            path: PathBuf::new(),
            operation: "unknown".to_string(),
            source: error,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Error::Json {
            message: error.to_string(),
            source: error,
        }
    }
}

// Helper methods for creating errors with context
impl Error {
    /// Create a validation error
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation {
            message: message.into(),
        }
    }

    /// Create a file system error with context
    #[must_use]
    pub fn file_system(
        path: impl Into<PathBuf>,
        operation: impl Into<String>,
        source: std::io::Error,
    ) -> Self {
        Error::FileSystem {
            path: path.into(),
            operation: operation.into(),
            source,
        }
    }

    /// Create a configuration error
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Error::Configuration {
            message: message.into(),
        }
    }

    /// Create a store error
    #[must_use]
    pub fn store(key: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Store {
            key: key.into(),
            message: message.into(),
        }
    }

    /// Create a content integrity error
    #[must_use]
    pub fn integrity(key: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Integrity {
            key: key.into(),
            message: message.into(),
        }
    }

    /// Create a package installation error
    #[must_use]
    pub fn package_install(message: impl Into<String>) -> Self {
        Error::PackageInstall {
            message: message.into(),
        }
    }

    /// Create a named cache error
    #[must_use]
    pub fn named_cache(name: impl Into<String>, message: impl Into<String>) -> Self {
        Error::NamedCache {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Create a timeout error
    #[must_use]
    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        Error::Timeout {
            operation: operation.into(),
            duration,
        }
    }

    /// Create a cancellation error
    #[must_use]
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Error::Cancelled {
            operation: operation.into(),
        }
    }

    /// Create a command execution error
    #[must_use]
    pub fn command_execution(
        command: impl Into<String>,
        args: Vec<String>,
        message: impl Into<String>,
        exit_code: Option<i32>,
    ) -> Self {
        Error::CommandExecution {
            command: command.into(),
            args,
            message: message.into(),
            exit_code,
        }
    }

    /// Whether this error was raised before anything was spawned because the
    /// request itself is unusable
    #[must_use]
    pub fn is_validation(&self) -> bool {
        matches!(self, Error::Validation { .. })
    }
}

// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Attach the path and operation to an I/O failure
    fn fs_context(self, path: impl Into<PathBuf>, operation: impl Into<String>) -> Result<T>;
}

impl<T> ResultExt<T> for std::result::Result<T, std::io::Error> {
    fn fs_context(self, path: impl Into<PathBuf>, operation: impl Into<String>) -> Result<T> {
        self.map_err(|e| Error::file_system(path, operation, e))
    }
}
