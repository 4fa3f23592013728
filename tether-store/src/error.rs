//! Error types for tether-store.

use std::path::PathBuf;

use thiserror::Error;

/// Failures of a single store read. The watch engine treats every variant as
/// transient and hands it to the retry policy.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Connection, timeout or protocol failure below HTTP status level.
    #[error("transport error: {0}")]
    Transport(String),

    /// The store answered with a non-success status.
    #[error("unexpected status {status} from {url}: {body}")]
    Status {
        status: u16,
        url: String,
        body: String,
    },

    /// The response could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    #[error("invalid store address '{address}': {reason}")]
    Address { address: String, reason: String },

    /// TLS material could not be read or parsed.
    #[error("TLS setup failed for {path}: {reason}")]
    Tls { path: PathBuf, reason: String },
}

impl From<reqwest::Error> for StoreError {
    fn from(err: reqwest::Error) -> Self {
        StoreError::Transport(err.to_string())
    }
}
