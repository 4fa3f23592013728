//! Error types for tether-core.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// All errors that can arise while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// YAML parse error on load, with file path and serde_yaml's line context.
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// YAML parse error for an in-memory document.
    #[error("failed to parse config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid duration '{value}'")]
    InvalidDuration { value: String },

    #[error("invalid wait: max ({max:?}) must not be less than min ({min:?})")]
    InvalidWait { min: Duration, max: Duration },

    #[error("unknown signal '{0}'")]
    InvalidSignal(String),

    #[error("invalid consul auth: {0}")]
    InvalidAuth(String),

    #[error("invalid template '{spec}': {reason}")]
    InvalidTemplate { spec: String, reason: String },

    #[error("invalid retry policy: {0}")]
    InvalidRetry(String),
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> ConfigError {
    ConfigError::Io {
        path: path.into(),
        source,
    }
}
