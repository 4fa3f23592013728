use std::path::PathBuf;

use thiserror::Error;

use tether_core::{ConfigError, Dependency};
use tether_renderer::RenderError;
use tether_store::StoreError;
use tether_sync::SyncError;

use crate::exec::CommandError;

/// Error surface for the reconciliation engine and its process wiring.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("template error: {0}")]
    Template(#[from] RenderError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("rendering {template} failed: {source}")]
    Render {
        template: String,
        #[source]
        source: RenderError,
    },

    #[error("writing {template} failed: {source}")]
    Output {
        template: String,
        #[source]
        source: SyncError,
    },

    #[error("command for {template} failed: {source}")]
    Command {
        template: String,
        #[source]
        source: CommandError,
    },

    #[error("watch on {dependency} failed: {source}")]
    Dependency {
        dependency: Dependency,
        #[source]
        source: ViewError,
    },

    #[error("reload failed: {0}")]
    Reload(#[source] ReloadError),

    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),
}

impl DaemonError {
    /// Whether the failure comes from invalid configuration or templates
    /// rather than from running them.
    pub fn is_config(&self) -> bool {
        matches!(self, DaemonError::Config(_) | DaemonError::Template(_))
    }
}

/// Why a View stopped on its own.
#[derive(Debug, Error)]
pub enum ViewError {
    #[error("giving up after {attempts} retries: {source}")]
    ExhaustedRetries {
        attempts: u32,
        #[source]
        source: StoreError,
    },
}

/// A reloaded configuration that could not be applied.
#[derive(Debug, Error)]
pub enum ReloadError {
    #[error("{0}")]
    Config(#[from] ConfigError),

    #[error("{0}")]
    Template(#[from] RenderError),
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> DaemonError {
    DaemonError::Io {
        path: path.into(),
        source,
    }
}
