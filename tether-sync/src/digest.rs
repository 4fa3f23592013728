//! SHA-256 digests of destination contents.
//!
//! The cache maps each destination to the digest of the contents it is known
//! to hold. A destination seen for the first time is hashed from disk, so a
//! restart does not rewrite files that are already up to date.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::error::{io_err, SyncError};

/// Hex-encoded SHA-256 of `content`.
pub fn digest(content: &[u8]) -> String {
    let mut h = Sha256::new();
    h.update(content);
    hex::encode(h.finalize())
}

#[derive(Debug, Default, Clone)]
pub struct DigestCache {
    known: HashMap<PathBuf, String>,
}

impl DigestCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Digest of what `path` currently holds, or `None` if it does not exist.
    ///
    /// With `from_disk` false an unseen path is treated as absent.
    pub fn current(&mut self, path: &Path, from_disk: bool) -> Result<Option<&str>, SyncError> {
        if !self.known.contains_key(path) && from_disk {
            match std::fs::read(path) {
                Ok(bytes) => {
                    self.known.insert(path.to_path_buf(), digest(&bytes));
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(io_err(path, e)),
            }
        }
        Ok(self.known.get(path).map(String::as_str))
    }

    pub fn record(&mut self, path: &Path, digest: String) {
        self.known.insert(path.to_path_buf(), digest);
    }

    pub fn forget(&mut self, path: &Path) {
        self.known.remove(path);
    }
}
