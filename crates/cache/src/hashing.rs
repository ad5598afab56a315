//! Content hashing for store keys

use crate::errors::{CacheError, Result};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

/// Length of a hex encoded SHA-256 digest
pub const HASH_HEX_LEN: usize = 64;

/// Hash a buffer
pub fn hash_bytes(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

/// Hash a file's content using streaming to handle large files efficiently
pub fn hash_file(path: &Path) -> Result<String> {
    let file = File::open(path).map_err(|e| CacheError::io(path, "open file for hashing", e))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let n = reader
            .read(&mut buffer)
            .map_err(|e| CacheError::io(path, "read file for hashing", e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Whether `key` is a well-formed lowercase hex digest
pub fn is_valid_hash(key: &str) -> bool {
    key.len() == HASH_HEX_LEN && key.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Reject anything that could not have been produced by [`hash_bytes`]
pub fn validate_hash(key: &str) -> Result<()> {
    if is_valid_hash(key) {
        Ok(())
    } else {
        Err(CacheError::invalid_key(
            key,
            format!("expected {HASH_HEX_LEN} lowercase hex characters"),
        ))
    }
}

/// Verify `content` hashes to `key`
pub fn verify(key: &str, content: &[u8]) -> Result<()> {
    let actual = hash_bytes(content);
    if actual == key {
        Ok(())
    } else {
        Err(CacheError::IntegrityFailure {
            key: key.to_string(),
            expected_hash: key.to_string(),
            actual_hash: actual,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const HELLO: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[test]
    fn test_hash_bytes_and_file_agree() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("f");
        std::fs::write(&path, "hello").unwrap();

        assert_eq!(hash_bytes(b"hello"), HELLO);
        assert_eq!(hash_file(&path).unwrap(), HELLO);
    }

    #[test]
    fn test_validate_hash() {
        assert!(validate_hash(HELLO).is_ok());
        assert!(validate_hash(&HELLO.to_uppercase()).is_err());
        assert!(validate_hash("../etc/passwd").is_err());
    }

    #[test]
    fn test_verify_detects_mismatch() {
        assert!(verify(HELLO, b"hello").is_ok());
        let err = verify(HELLO, b"hello!").unwrap_err();
        assert!(matches!(err, CacheError::IntegrityFailure { .. }));
    }
}
