//! tether core library: dependency identities, configuration, retry policy.
//!
//! - [`dependency`]: [`Dependency`] descriptors and their resolved values
//! - [`config`]: the finished run [`Config`], YAML loading, validation
//! - [`duration`]: human-readable duration parsing shared by config and CLI
//! - [`retry`]: the stateless [`Retrier`] backoff policy
//! - [`error`]: [`ConfigError`]

pub mod config;
pub mod dependency;
pub mod duration;
pub mod error;
pub mod retry;

pub use config::{
    AuthConfig, Config, ConsulConfig, RetryConfig, SignalName, SslConfig, TemplateConfig,
    TransportConfig, WaitConfig,
};
pub use dependency::{Dependency, DependencyValue, KeyPair, ServiceInstance, Values};
pub use error::ConfigError;
pub use retry::Retrier;
