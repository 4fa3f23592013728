//! Run configuration.
//!
//! # File format
//!
//! ```yaml
//! consul:
//!   address: 127.0.0.1:8500
//!   retry:
//!     attempts: 5
//!     backoff: 250ms
//! wait:
//!   min: 2s
//!   max: 10s
//! templates:
//!   - source: /etc/tether/app.conf.tera
//!     destination: /etc/app/app.conf
//!     command: systemctl reload app
//! ```
//!
//! Every section is `#[serde(default)]`, so a partial file lands on top of the
//! defaults. Command-line overrides are applied by the caller afterwards and
//! the finished value is checked once with [`Config::validate`].

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::duration::{self, serde_duration, serde_opt_duration};
use crate::error::{io_err, ConfigError};

pub const DEFAULT_CONSUL_ADDRESS: &str = "127.0.0.1:8500";
pub const DEFAULT_BLOCK_QUERY_WAIT: Duration = Duration::from_secs(60);
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Signals
// ---------------------------------------------------------------------------

const KNOWN_SIGNALS: &[&str] = &[
    "SIGHUP", "SIGINT", "SIGQUIT", "SIGTERM", "SIGUSR1", "SIGUSR2",
];

/// A validated, upper-case POSIX signal name such as `SIGHUP`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SignalName(String);

impl SignalName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for SignalName {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        let name = if upper.starts_with("SIG") {
            upper
        } else {
            format!("SIG{upper}")
        };
        if KNOWN_SIGNALS.contains(&name.as_str()) {
            Ok(Self(name))
        } else {
            Err(ConfigError::InvalidSignal(s.to_owned()))
        }
    }
}

impl TryFrom<String> for SignalName {
    type Error = ConfigError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<SignalName> for String {
    fn from(s: SignalName) -> Self {
        s.0
    }
}

impl fmt::Display for SignalName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// ---------------------------------------------------------------------------
// Consul connection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub username: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl FromStr for AuthConfig {
    type Err = ConfigError;

    /// `username` or `username:password`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (username, password) = match s.split_once(':') {
            Some((user, pass)) => (user, Some(pass.to_owned())),
            None => (s, None),
        };
        if username.is_empty() {
            return Err(ConfigError::InvalidAuth("username must not be empty".into()));
        }
        Ok(Self {
            username: username.to_owned(),
            password,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub enabled: bool,
    /// Maximum retries per failure streak; 0 means unlimited.
    pub attempts: u32,
    #[serde(with = "serde_duration")]
    pub backoff: Duration,
    #[serde(with = "serde_duration")]
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            attempts: 12,
            backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SslConfig {
    pub enabled: bool,
    pub verify: bool,
    pub ca_cert: Option<PathBuf>,
    /// Directory whose every file is a PEM CA certificate to trust.
    pub ca_path: Option<PathBuf>,
    /// PEM file holding the client certificate (and key, if `key` is unset).
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    /// Name to verify the agent's certificate against instead of the
    /// address host.
    pub server_name: Option<String>,
}

impl Default for SslConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            verify: true,
            ca_cert: None,
            ca_path: None,
            cert: None,
            key: None,
            server_name: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    #[serde(with = "serde_duration")]
    pub dial_keep_alive: Duration,
    #[serde(with = "serde_duration")]
    pub dial_timeout: Duration,
    pub disable_keep_alives: bool,
    pub max_idle_conns_per_host: usize,
    #[serde(with = "serde_duration")]
    pub tls_handshake_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            dial_keep_alive: Duration::from_secs(30),
            dial_timeout: Duration::from_secs(30),
            disable_keep_alives: false,
            max_idle_conns_per_host: 100,
            tls_handshake_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsulConfig {
    /// `host:port`, optionally with an `http://` or `https://` scheme.
    pub address: String,
    pub token: Option<String>,
    pub auth: Option<AuthConfig>,
    pub retry: RetryConfig,
    pub ssl: SslConfig,
    pub transport: TransportConfig,
}

impl Default for ConsulConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_CONSUL_ADDRESS.to_owned(),
            token: None,
            auth: None,
            retry: RetryConfig::default(),
            ssl: SslConfig::default(),
            transport: TransportConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Quiescence
// ---------------------------------------------------------------------------

/// Quiescence window: render once `min` has passed without news, or once
/// `max` has passed since the first unrendered change.
///
/// Deserializes from either `{ min, max }` or the `"min[:max]"` shorthand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "RawWait")]
pub struct WaitConfig {
    #[serde(serialize_with = "serde_duration::serialize")]
    pub min: Duration,
    #[serde(
        serialize_with = "serde_opt_duration::serialize",
        skip_serializing_if = "Option::is_none"
    )]
    pub max: Option<Duration>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawWait {
    Shorthand(String),
    Fields(WaitFields),
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct WaitFields {
    #[serde(with = "serde_duration")]
    min: Duration,
    #[serde(with = "serde_opt_duration")]
    max: Option<Duration>,
}

impl TryFrom<RawWait> for WaitConfig {
    type Error = ConfigError;

    fn try_from(raw: RawWait) -> Result<Self, Self::Error> {
        match raw {
            RawWait::Shorthand(text) => text.parse(),
            RawWait::Fields(fields) => {
                let wait = Self {
                    min: fields.min,
                    max: fields.max,
                };
                wait.validate()?;
                Ok(wait)
            }
        }
    }
}

impl WaitConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.max {
            Some(max) if max < self.min => Err(ConfigError::InvalidWait { min: self.min, max }),
            _ => Ok(()),
        }
    }
}

impl FromStr for WaitConfig {
    type Err = ConfigError;

    /// `min` or `min:max`. A lone `min` sets `max` to four times `min`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wait = match s.split_once(':') {
            Some((min, max)) => Self {
                min: duration::parse(min)?,
                max: Some(duration::parse(max)?),
            },
            None => {
                let min = duration::parse(s)?;
                Self {
                    min,
                    max: Some(min.saturating_mul(4)),
                }
            }
        };
        wait.validate()?;
        Ok(wait)
    }
}

// ---------------------------------------------------------------------------
// Templates
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TemplateConfig {
    /// Path of the template file on disk.
    pub source: Option<PathBuf>,
    /// Inline template text, used instead of `source`.
    pub contents: Option<String>,
    pub destination: PathBuf,
    /// Shell command run after the destination changes.
    pub command: Option<String>,
    #[serde(with = "serde_duration")]
    pub command_timeout: Duration,
    /// Unix permission bits for the destination, e.g. `0o644`.
    pub perms: Option<u32>,
    /// Keep the previous destination as `<destination>.bak`.
    pub backup: bool,
    /// Per-template quiescence; falls back to the global `wait`.
    pub wait: Option<WaitConfig>,
}

impl Default for TemplateConfig {
    fn default() -> Self {
        Self {
            source: None,
            contents: None,
            destination: PathBuf::new(),
            command: None,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            perms: None,
            backup: false,
            wait: None,
        }
    }
}

impl TemplateConfig {
    /// Template identity. Destinations are unique within a validated config.
    pub fn id(&self) -> String {
        self.destination.display().to_string()
    }

    pub fn effective_wait(&self, global: &WaitConfig) -> WaitConfig {
        self.wait.unwrap_or(*global)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidTemplate {
            spec: self.id(),
            reason: reason.to_owned(),
        };
        match (&self.source, &self.contents) {
            (Some(_), Some(_)) => return Err(invalid("source and contents are mutually exclusive")),
            (None, None) => return Err(invalid("one of source or contents is required")),
            _ => {}
        }
        if self.destination.as_os_str().is_empty() {
            return Err(invalid("destination is required"));
        }
        if let Some(wait) = &self.wait {
            wait.validate()?;
        }
        Ok(())
    }
}

impl FromStr for TemplateConfig {
    type Err = ConfigError;

    /// `source:destination[:command]`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, ':');
        let source = parts.next().unwrap_or_default();
        let destination = parts.next().unwrap_or_default();
        let command = parts.next().filter(|c| !c.trim().is_empty());

        if source.is_empty() || destination.is_empty() {
            return Err(ConfigError::InvalidTemplate {
                spec: s.to_owned(),
                reason: "expected source:destination[:command]".to_owned(),
            });
        }
        Ok(Self {
            source: Some(PathBuf::from(source)),
            destination: PathBuf::from(destination),
            command: command.map(str::to_owned),
            ..Self::default()
        })
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub consul: ConsulConfig,
    pub kill_signal: SignalName,
    pub reload_signal: SignalName,
    pub log_level: String,
    pub log_json: bool,
    pub pid_file: Option<PathBuf>,
    pub wait: WaitConfig,
    /// Upper bound on one blocking read; the View re-issues the read after it.
    #[serde(with = "serde_duration")]
    pub block_query_wait: Duration,
    pub once: bool,
    pub dry: bool,
    /// Abort the process when a reload produces an invalid configuration.
    pub reload_fatal: bool,
    pub templates: Vec<TemplateConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            consul: ConsulConfig::default(),
            kill_signal: SignalName("SIGINT".to_owned()),
            reload_signal: SignalName("SIGHUP".to_owned()),
            log_level: "info".to_owned(),
            log_json: false,
            pid_file: None,
            wait: WaitConfig::default(),
            block_query_wait: DEFAULT_BLOCK_QUERY_WAIT,
            once: false,
            dry: false,
            reload_fatal: false,
            templates: Vec::new(),
        }
    }
}

impl Config {
    /// Parse a YAML document on top of the defaults.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Load a YAML config file on top of the defaults.
    ///
    /// Returns `ConfigError::Io` if unreadable and `ConfigError::Parse` (with
    /// path and line context) if malformed.
    pub fn load_at(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| io_err(path, e))?;
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Check cross-field invariants. Called once on the finished value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.wait.validate()?;

        let retry = &self.consul.retry;
        if retry.enabled && retry.max_backoff < retry.backoff {
            return Err(ConfigError::InvalidRetry(format!(
                "max_backoff ({}) is less than backoff ({})",
                duration::format(retry.max_backoff),
                duration::format(retry.backoff)
            )));
        }
        if self.block_query_wait.is_zero() {
            return Err(ConfigError::InvalidDuration {
                value: "block_query_wait: 0s".to_owned(),
            });
        }

        let mut destinations = HashSet::new();
        for template in &self.templates {
            template.validate()?;
            if !destinations.insert(&template.destination) {
                return Err(ConfigError::InvalidTemplate {
                    spec: template.id(),
                    reason: "destination is used by more than one template".to_owned(),
                });
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
