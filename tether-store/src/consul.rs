//! Consul HTTP API client.
//!
//! | Dependency  | Endpoint                                           |
//! |-------------|----------------------------------------------------|
//! | `Key`       | `GET /v1/kv/<path>`                                |
//! | `KeyPrefix` | `GET /v1/kv/<prefix>?recurse=true`                 |
//! | `Service`   | `GET /v1/health/service/<name>?passing=true[&tag]` |
//!
//! Blocking is driven by the `index` and `wait` query parameters; the new
//! version comes back in the `X-Consul-Index` header. A 404 on the KV
//! endpoints means the key or prefix does not exist and is a valid, empty
//! result.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use tracing::{debug, trace, warn};

use tether_core::{
    AuthConfig, ConsulConfig, Dependency, DependencyValue, KeyPair, ServiceInstance,
};

use crate::error::StoreError;
use crate::store::{ReadResult, Store};

const USER_AGENT: &str = concat!("tether/", env!("CARGO_PKG_VERSION"));
const INDEX_HEADER: &str = "X-Consul-Index";
const TOKEN_HEADER: &str = "X-Consul-Token";

/// Slack on top of `wait`: Consul may hold a query up to `wait + wait/16`.
const REQUEST_SLACK: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct KvEntry {
    #[serde(rename = "Key")]
    key: String,
    #[serde(rename = "Value")]
    value: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HealthEntry {
    #[serde(rename = "Node")]
    node: HealthNode,
    #[serde(rename = "Service")]
    service: HealthService,
}

#[derive(Debug, Deserialize)]
struct HealthNode {
    #[serde(rename = "Node")]
    name: String,
    #[serde(rename = "Address")]
    address: String,
}

#[derive(Debug, Deserialize)]
struct HealthService {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Service")]
    name: String,
    #[serde(rename = "Tags", default)]
    tags: Option<Vec<String>>,
    #[serde(rename = "Address", default)]
    address: String,
    #[serde(rename = "Port")]
    port: u16,
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

fn decode_value(raw: Option<&str>) -> Result<String, StoreError> {
    let Some(raw) = raw else {
        return Ok(String::new());
    };
    let bytes = STANDARD
        .decode(raw)
        .map_err(|e| StoreError::Decode(format!("invalid base64 value: {e}")))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Decode a single-key response body.
pub(crate) fn decode_key(body: &[u8]) -> Result<Option<String>, StoreError> {
    let entries: Vec<KvEntry> =
        serde_json::from_slice(body).map_err(|e| StoreError::Decode(e.to_string()))?;
    entries
        .first()
        .map(|entry| decode_value(entry.value.as_deref()))
        .transpose()
}

/// Decode a recursive KV response body. Keys are made relative to `prefix`;
/// the prefix's own folder entry is skipped.
pub(crate) fn decode_prefix(body: &[u8], prefix: &str) -> Result<Vec<KeyPair>, StoreError> {
    let entries: Vec<KvEntry> =
        serde_json::from_slice(body).map_err(|e| StoreError::Decode(e.to_string()))?;
    let mut pairs = Vec::with_capacity(entries.len());
    for entry in entries {
        let relative = entry.key.strip_prefix(prefix).unwrap_or(&entry.key);
        if relative.is_empty() {
            continue;
        }
        pairs.push(KeyPair {
            key: relative.to_owned(),
            value: decode_value(entry.value.as_deref())?,
        });
    }
    Ok(pairs)
}

/// Decode a health-service response body.
pub(crate) fn decode_services(body: &[u8]) -> Result<Vec<ServiceInstance>, StoreError> {
    let entries: Vec<HealthEntry> =
        serde_json::from_slice(body).map_err(|e| StoreError::Decode(e.to_string()))?;
    Ok(entries
        .into_iter()
        .map(|entry| ServiceInstance {
            id: entry.service.id,
            name: entry.service.name,
            address: if entry.service.address.is_empty() {
                entry.node.address
            } else {
                entry.service.address
            },
            node: entry.node.name,
            port: entry.service.port,
            tags: entry.service.tags.unwrap_or_default(),
        })
        .collect())
}

// ---------------------------------------------------------------------------
// ConsulStore
// ---------------------------------------------------------------------------

/// [`Store`] backed by a Consul agent's HTTP API.
#[derive(Clone)]
pub struct ConsulStore {
    client: reqwest::Client,
    base: Url,
    token: Option<String>,
    auth: Option<AuthConfig>,
}

impl ConsulStore {
    pub fn new(config: &ConsulConfig) -> Result<Self, StoreError> {
        let mut base = base_url(&config.address, config.ssl.enabled)?;
        let transport = &config.transport;

        let mut builder = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            // reqwest's connect timeout covers the TLS handshake as well.
            .connect_timeout(
                transport
                    .dial_timeout
                    .saturating_add(transport.tls_handshake_timeout),
            )
            .tcp_keepalive(transport.dial_keep_alive)
            .pool_max_idle_per_host(if transport.disable_keep_alives {
                0
            } else {
                transport.max_idle_conns_per_host
            });

        let ssl = &config.ssl;
        if ssl.enabled {
            if !ssl.verify {
                warn!("consul TLS certificate verification is disabled");
                builder = builder.danger_accept_invalid_certs(true);
            }
            if let Some(ca) = &ssl.ca_cert {
                let pem = read_pem(ca)?;
                let cert = reqwest::Certificate::from_pem(&pem).map_err(|e| StoreError::Tls {
                    path: ca.clone(),
                    reason: e.to_string(),
                })?;
                builder = builder.add_root_certificate(cert);
            }
            if let Some(dir) = &ssl.ca_path {
                for cert in read_ca_dir(dir)? {
                    builder = builder.add_root_certificate(cert);
                }
            }
            if let Some(cert) = &ssl.cert {
                let mut pem = read_pem(cert)?;
                if let Some(key) = &ssl.key {
                    pem.push(b'\n');
                    pem.extend(read_pem(key)?);
                }
                let identity = reqwest::Identity::from_pem(&pem).map_err(|e| StoreError::Tls {
                    path: cert.clone(),
                    reason: e.to_string(),
                })?;
                builder = builder.identity(identity);
            }
            if let Some(name) = ssl.server_name.as_deref().filter(|n| !n.is_empty()) {
                // Connect to the configured address but present and verify `name`.
                let addr = pinned_addr(&base, &config.address)?;
                builder = builder.resolve(name, addr);
                base.set_host(Some(name)).map_err(|e| StoreError::Address {
                    address: name.to_owned(),
                    reason: e.to_string(),
                })?;
            }
        }

        let client = builder.build()?;
        debug!(address = %base, "consul client configured");

        Ok(Self {
            client,
            base,
            token: config.token.clone().filter(|t| !t.is_empty()),
            auth: config.auth.clone(),
        })
    }

    /// Base URL every request is built from.
    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn endpoint(
        &self,
        dependency: &Dependency,
    ) -> Result<(Url, Vec<(&'static str, String)>), StoreError> {
        let (segments, query): (Vec<&str>, Vec<(&'static str, String)>) = match dependency {
            Dependency::Key { path } => {
                let mut segments = vec!["v1", "kv"];
                segments.extend(path.split('/'));
                (segments, Vec::new())
            }
            Dependency::KeyPrefix { prefix } => {
                let mut segments = vec!["v1", "kv"];
                segments.extend(prefix.split('/'));
                (segments, vec![("recurse", "true".to_owned())])
            }
            Dependency::Service { name, tag } => {
                let mut query = vec![("passing", "true".to_owned())];
                if let Some(tag) = tag {
                    query.push(("tag", tag.clone()));
                }
                (vec!["v1", "health", "service", name.as_str()], query)
            }
        };

        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| StoreError::Address {
                address: self.base.to_string(),
                reason: "cannot be a base URL".to_owned(),
            })?
            .pop_if_empty()
            .extend(segments);
        Ok((url, query))
    }
}

#[async_trait]
impl Store for ConsulStore {
    async fn blocking_read(
        &self,
        dependency: &Dependency,
        since: u64,
        wait: Duration,
    ) -> Result<ReadResult, StoreError> {
        let (url, mut query) = self.endpoint(dependency)?;
        if since > 0 {
            query.push(("index", since.to_string()));
            query.push(("wait", format!("{}ms", wait.as_millis())));
        }

        let mut request = self
            .client
            .get(url.clone())
            .query(&query)
            .timeout(request_timeout(wait));
        if let Some(token) = &self.token {
            request = request.header(TOKEN_HEADER, token);
        }
        if let Some(auth) = &self.auth {
            request = request.basic_auth(&auth.username, auth.password.as_ref());
        }

        trace!(dependency = %dependency, url = %url, since, "blocking query");
        let response = request.send().await?;
        let status = response.status();
        let index = response
            .headers()
            .get(INDEX_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());

        let not_found = status == StatusCode::NOT_FOUND
            && !matches!(dependency, Dependency::Service { .. });
        if !status.is_success() && !not_found {
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::Status {
                status: status.as_u16(),
                url: url.to_string(),
                body,
            });
        }

        let index = index.ok_or_else(|| {
            StoreError::Decode(format!("response from {url} has no {INDEX_HEADER} header"))
        })?;
        let body = response.bytes().await?;

        let value = match dependency {
            Dependency::Key { .. } if not_found => DependencyValue::Key(None),
            Dependency::Key { .. } => DependencyValue::Key(decode_key(&body)?),
            Dependency::KeyPrefix { .. } if not_found => DependencyValue::KeyPrefix(Vec::new()),
            Dependency::KeyPrefix { prefix } => {
                DependencyValue::KeyPrefix(decode_prefix(&body, prefix)?)
            }
            Dependency::Service { .. } => DependencyValue::Service(decode_services(&body)?),
        };

        Ok(ReadResult { value, index })
    }
}

/// Client-side timeout for a blocking query held up to `wait`.
fn request_timeout(wait: Duration) -> Duration {
    wait.saturating_add(wait / 16).saturating_add(REQUEST_SLACK)
}

fn base_url(address: &str, ssl: bool) -> Result<Url, StoreError> {
    let with_scheme = if address.contains("://") {
        address.to_owned()
    } else if ssl {
        format!("https://{address}")
    } else {
        format!("http://{address}")
    };
    Url::parse(&with_scheme).map_err(|e| StoreError::Address {
        address: address.to_owned(),
        reason: e.to_string(),
    })
}

fn pinned_addr(base: &Url, address: &str) -> Result<SocketAddr, StoreError> {
    let unresolved = |reason: String| StoreError::Address {
        address: address.to_owned(),
        reason,
    };
    base.socket_addrs(|| None)
        .map_err(|e| unresolved(e.to_string()))?
        .into_iter()
        .next()
        .ok_or_else(|| unresolved("address did not resolve".to_owned()))
}

/// Every regular file in `dir`, in name order, as a CA certificate.
fn read_ca_dir(dir: &Path) -> Result<Vec<reqwest::Certificate>, StoreError> {
    let tls_err = |path: &Path, reason: String| StoreError::Tls {
        path: path.to_path_buf(),
        reason,
    };
    let mut paths = std::fs::read_dir(dir)
        .map_err(|e| tls_err(dir, e.to_string()))?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| tls_err(dir, e.to_string()))?;
    paths.retain(|p| p.is_file());
    paths.sort();

    paths
        .iter()
        .map(|path| {
            let pem = read_pem(path)?;
            reqwest::Certificate::from_pem(&pem).map_err(|e| tls_err(path, e.to_string()))
        })
        .collect()
}

fn read_pem(path: &Path) -> Result<Vec<u8>, StoreError> {
    std::fs::read(path).map_err(|e| StoreError::Tls {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}
