//! Error types for the content store and caches

use std::path::PathBuf;

/// Result type for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;

/// Error type for store and cache operations
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// I/O errors during cache operations; possibly transient
    #[error("cache {operation} failed for '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        operation: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// The object is definitively absent
    #[error("object '{key}' not found in {store}")]
    NotFound { key: String, store: String },

    /// Integrity check failed
    #[error("integrity check failed for '{key}': content hashes to '{actual_hash}'")]
    IntegrityFailure {
        key: String,
        expected_hash: String,
        actual_hash: String,
    },

    /// Cache corruption detected
    #[error("corrupted cache state in '{}': {reason}", .path.display())]
    Corruption { path: PathBuf, reason: String },

    /// Serialization/deserialization errors
    #[error("failed to (de)serialize '{key}': {source}")]
    Serialization {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    /// Exclusive access could not be obtained
    #[error("failed to lock '{}': {source}", .path.display())]
    Lock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Invalid cache key or cache name
    #[error("invalid key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },
}

impl CacheError {
    /// Create an I/O error with context
    pub fn io(path: impl Into<PathBuf>, operation: &'static str, source: std::io::Error) -> Self {
        CacheError::Io {
            path: path.into(),
            operation,
            source,
        }
    }

    /// Create an invalid key error
    pub fn invalid_key(key: impl Into<String>, reason: impl Into<String>) -> Self {
        CacheError::InvalidKey {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Map a failed atomic write from the utils crate
    pub fn from_write(path: &std::path::Path, operation: &'static str, error: isorun_core::Error) -> Self {
        match error {
            isorun_core::Error::FileSystem { source, .. } => CacheError::io(path, operation, source),
            other => CacheError::io(path, operation, std::io::Error::other(other.to_string())),
        }
    }

    /// Whether the failure means "object absent" rather than a transient fault
    pub fn is_not_found(&self) -> bool {
        matches!(self, CacheError::NotFound { .. })
    }
}

impl From<CacheError> for isorun_core::Error {
    fn from(error: CacheError) -> Self {
        use isorun_core::Error;
        let message = error.to_string();
        match error {
            CacheError::Io {
                path,
                operation,
                source,
            } => Error::file_system(path, operation, source),
            CacheError::Lock { path, source } => Error::file_system(path, "lock", source),
            CacheError::IntegrityFailure { key, .. } => Error::integrity(key, message),
            CacheError::InvalidKey { .. } => Error::validation(message),
            CacheError::Serialization { source, .. } => Error::from(source),
            CacheError::NotFound { key, .. } => Error::store(key, message),
            CacheError::Corruption { path, .. } => Error::store(path.display().to_string(), message),
        }
    }
}
