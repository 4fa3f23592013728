//! Watched remote resources and the values they resolve to.
//!
//! A [`Dependency`] is the identity of one watch. Constructors normalise their
//! parameters so that two descriptors naming the same resource compare equal,
//! hash equal, and render the same canonical key through `Display`.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Dependency
// ---------------------------------------------------------------------------

/// One watched resource in the remote store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Dependency {
    /// A single key.
    Key { path: String },
    /// Every key below a prefix.
    KeyPrefix { prefix: String },
    /// Healthy instances of a catalog service, optionally filtered by tag.
    Service { name: String, tag: Option<String> },
}

impl Dependency {
    pub fn key(path: impl AsRef<str>) -> Self {
        Self::Key {
            path: trim_slashes(path.as_ref()).to_owned(),
        }
    }

    pub fn key_prefix(prefix: impl AsRef<str>) -> Self {
        let prefix = prefix.as_ref().trim_start_matches('/');
        Self::KeyPrefix {
            prefix: prefix.to_owned(),
        }
    }

    pub fn service(name: impl AsRef<str>, tag: Option<&str>) -> Self {
        Self::Service {
            name: name.as_ref().trim().to_owned(),
            tag: tag.map(str::trim).filter(|t| !t.is_empty()).map(str::to_owned),
        }
    }

    /// Short name of the resource kind, used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Dependency::Key { .. } => "key",
            Dependency::KeyPrefix { .. } => "keyprefix",
            Dependency::Service { .. } => "service",
        }
    }
}

fn trim_slashes(s: &str) -> &str {
    s.trim_matches('/')
}

/// Canonical identity key, e.g. `key(app/port)` or `service(web@canary)`.
impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dependency::Key { path } => write!(f, "key({path})"),
            Dependency::KeyPrefix { prefix } => write!(f, "keyprefix({prefix})"),
            Dependency::Service { name, tag: None } => write!(f, "service({name})"),
            Dependency::Service {
                name,
                tag: Some(tag),
            } => write!(f, "service({name}@{tag})"),
        }
    }
}

// ---------------------------------------------------------------------------
// Values
// ---------------------------------------------------------------------------

/// One entry returned by a prefix read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPair {
    /// Key path relative to the watched prefix.
    pub key: String,
    pub value: String,
}

/// One healthy instance of a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub id: String,
    pub name: String,
    pub node: String,
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// The resolved value of a [`Dependency`].
///
/// A key that does not exist in the store resolves to `Key(None)`: the data
/// has been received and is empty, which is different from never received.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum DependencyValue {
    Key(Option<String>),
    KeyPrefix(Vec<KeyPair>),
    Service(Vec<ServiceInstance>),
}

/// A point-in-time view of received values, keyed by identity.
pub type Values = HashMap<Dependency, DependencyValue>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
