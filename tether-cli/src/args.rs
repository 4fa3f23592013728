//! Command-line flags and their merge onto the config file.
//!
//! Typed values (durations, signals, waits, templates) are taken as strings
//! and converted in [`Cli::apply`], so a malformed value is reported as a
//! configuration error rather than a flag-parsing error.

use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Parser};

use tether_core::{duration, AuthConfig, Config, ConfigError, TemplateConfig, WaitConfig};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "tether",
    version,
    about = "Render templates from Consul and keep them up to date",
    long_about = None,
)]
pub struct Cli {
    /// YAML config file. Flags override its values.
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Consul agent address (host:port).
    #[arg(long, env = "CONSUL_HTTP_ADDR", value_name = "ADDR")]
    pub consul_addr: Option<String>,

    /// ACL token sent with every request.
    #[arg(long, alias = "token", env = "CONSUL_HTTP_TOKEN", hide_env_values = true)]
    pub consul_token: Option<String>,

    /// HTTP basic auth as `username[:password]`.
    #[arg(long, alias = "auth", value_name = "USER[:PASS]")]
    pub consul_auth: Option<String>,

    /// Retry failed Consul reads.
    #[arg(long, alias = "retry", value_name = "BOOL")]
    pub consul_retry: Option<bool>,

    #[arg(long, alias = "retry-attempts", value_name = "N")]
    pub consul_retry_attempts: Option<u32>,

    #[arg(long, alias = "retry-backoff", value_name = "DURATION")]
    pub consul_retry_backoff: Option<String>,

    #[arg(long, alias = "retry-max-backoff", value_name = "DURATION")]
    pub consul_retry_max_backoff: Option<String>,

    /// Talk to Consul over HTTPS.
    #[arg(long, alias = "ssl")]
    pub consul_ssl: bool,

    #[arg(long, alias = "ssl-verify", value_name = "BOOL")]
    pub consul_ssl_verify: Option<bool>,

    #[arg(long, alias = "ssl-ca-cert", value_name = "PATH")]
    pub consul_ssl_ca_cert: Option<PathBuf>,

    /// Directory of PEM CA certificates.
    #[arg(long, alias = "ssl-ca-path", value_name = "DIR")]
    pub consul_ssl_ca_path: Option<PathBuf>,

    #[arg(long, alias = "ssl-cert", value_name = "PATH")]
    pub consul_ssl_cert: Option<PathBuf>,

    #[arg(long, alias = "ssl-key", value_name = "PATH")]
    pub consul_ssl_key: Option<PathBuf>,

    /// Name to verify the agent's certificate against.
    #[arg(long, alias = "ssl-server-name", value_name = "NAME")]
    pub consul_ssl_server_name: Option<String>,

    #[arg(long, alias = "transport-dial-keep-alive", value_name = "DURATION")]
    pub consul_transport_dial_keep_alive: Option<String>,

    #[arg(long, alias = "transport-dial-timeout", value_name = "DURATION")]
    pub consul_transport_dial_timeout: Option<String>,

    #[arg(long, alias = "transport-disable-keep-alives")]
    pub consul_transport_disable_keep_alives: bool,

    #[arg(long, alias = "transport-max-idle-conns-per-host", value_name = "N")]
    pub consul_transport_max_idle_conns_per_host: Option<usize>,

    #[arg(long, alias = "transport-tls-handshake-timeout", value_name = "DURATION")]
    pub consul_transport_tls_handshake_timeout: Option<String>,

    /// Signal that stops the daemon cleanly.
    #[arg(long, value_name = "SIGNAL")]
    pub kill_signal: Option<String>,

    /// Signal that reloads the configuration.
    #[arg(long, value_name = "SIGNAL")]
    pub reload_signal: Option<String>,

    #[arg(long, value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Emit logs as JSON lines.
    #[arg(long)]
    pub log_json: bool,

    #[arg(long, value_name = "PATH")]
    pub pid_file: Option<PathBuf>,

    /// Default quiescence as `min[:max]`.
    #[arg(long, value_name = "MIN[:MAX]")]
    pub wait: Option<String>,

    /// Long-poll wait for each blocking query.
    #[arg(long, value_name = "DURATION")]
    pub block_query_wait: Option<String>,

    /// Template as `source:destination[:command]`. Repeatable.
    #[arg(long = "template", value_name = "SRC:DEST[:CMD]", action = ArgAction::Append)]
    pub templates: Vec<String>,

    /// Render every template once, then exit.
    #[arg(long)]
    pub once: bool,

    /// Print rendered templates to stdout instead of writing them.
    #[arg(long)]
    pub dry: bool,

    /// Exit when a reload produces an invalid configuration.
    #[arg(long)]
    pub reload_fatal: bool,

    #[arg(hide = true, trailing_var_arg = true)]
    pub extra: Vec<String>,
}

fn parse_duration(value: &Option<String>) -> Result<Option<Duration>, ConfigError> {
    value.as_deref().map(duration::parse).transpose()
}

impl Cli {
    /// Read the config file (if any), apply flags, validate.
    pub fn load(&self) -> Result<Config, ConfigError> {
        let mut config = match &self.config {
            Some(path) => Config::load_at(path)?,
            None => Config::default(),
        };
        self.apply(&mut config)?;
        config.validate()?;
        if config.templates.is_empty() {
            return Err(ConfigError::InvalidTemplate {
                spec: "<none>".to_owned(),
                reason: "at least one template is required".to_owned(),
            });
        }
        Ok(config)
    }

    /// Overlay every flag that was given onto `config`.
    pub fn apply(&self, config: &mut Config) -> Result<(), ConfigError> {
        let consul = &mut config.consul;
        if let Some(addr) = &self.consul_addr {
            consul.address = addr.clone();
        }
        if let Some(token) = &self.consul_token {
            consul.token = Some(token.clone());
        }
        if let Some(auth) = &self.consul_auth {
            consul.auth = Some(auth.parse::<AuthConfig>()?);
        }

        if let Some(enabled) = self.consul_retry {
            consul.retry.enabled = enabled;
        }
        if let Some(attempts) = self.consul_retry_attempts {
            consul.retry.attempts = attempts;
        }
        if let Some(backoff) = parse_duration(&self.consul_retry_backoff)? {
            consul.retry.backoff = backoff;
        }
        if let Some(max) = parse_duration(&self.consul_retry_max_backoff)? {
            consul.retry.max_backoff = max;
        }

        let ssl = &mut consul.ssl;
        ssl.enabled |= self.consul_ssl;
        if let Some(verify) = self.consul_ssl_verify {
            ssl.verify = verify;
        }
        overlay_path(&mut ssl.ca_cert, &self.consul_ssl_ca_cert);
        overlay_path(&mut ssl.ca_path, &self.consul_ssl_ca_path);
        overlay_path(&mut ssl.cert, &self.consul_ssl_cert);
        overlay_path(&mut ssl.key, &self.consul_ssl_key);
        if let Some(name) = &self.consul_ssl_server_name {
            ssl.server_name = Some(name.clone());
        }

        let transport = &mut consul.transport;
        if let Some(d) = parse_duration(&self.consul_transport_dial_keep_alive)? {
            transport.dial_keep_alive = d;
        }
        if let Some(d) = parse_duration(&self.consul_transport_dial_timeout)? {
            transport.dial_timeout = d;
        }
        transport.disable_keep_alives |= self.consul_transport_disable_keep_alives;
        if let Some(n) = self.consul_transport_max_idle_conns_per_host {
            transport.max_idle_conns_per_host = n;
        }
        if let Some(d) = parse_duration(&self.consul_transport_tls_handshake_timeout)? {
            transport.tls_handshake_timeout = d;
        }

        if let Some(signal) = &self.kill_signal {
            config.kill_signal = signal.parse()?;
        }
        if let Some(signal) = &self.reload_signal {
            config.reload_signal = signal.parse()?;
        }
        if let Some(level) = &self.log_level {
            config.log_level = level.clone();
        }
        config.log_json |= self.log_json;
        overlay_path(&mut config.pid_file, &self.pid_file);

        if let Some(wait) = &self.wait {
            config.wait = wait.parse::<WaitConfig>()?;
        }
        if let Some(wait) = parse_duration(&self.block_query_wait)? {
            config.block_query_wait = wait;
        }

        for spec in &self.templates {
            config.templates.push(spec.parse::<TemplateConfig>()?);
        }

        config.once |= self.once;
        config.dry |= self.dry;
        config.reload_fatal |= self.reload_fatal;
        Ok(())
    }
}

fn overlay_path(target: &mut Option<PathBuf>, flag: &Option<PathBuf>) {
    if let Some(path) = flag {
        *target = Some(path.clone());
    }
}
