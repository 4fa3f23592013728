//! Error types for tether-renderer.

use std::collections::BTreeSet;
use std::path::PathBuf;

use tether_core::Dependency;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RenderError {
    /// Tera parse failure.
    #[error("template engine error: {0}")]
    Tera(#[from] tera::Error),

    /// Render failed although every touched dependency had a value.
    #[error("template {name} failed to render: {source}")]
    Failed {
        name: String,
        dependencies: BTreeSet<Dependency>,
        source: tera::Error,
    },

    /// A watched value could not be converted into a template value.
    #[error("context serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Template source file could not be read.
    #[error("template io error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("template {id} has neither source nor contents")]
    MissingSource { id: String },
}

impl RenderError {
    /// Dependencies touched before a render failed, when it got that far.
    pub fn dependencies(&self) -> Option<&BTreeSet<Dependency>> {
        match self {
            RenderError::Failed { dependencies, .. } => Some(dependencies),
            _ => None,
        }
    }
}
