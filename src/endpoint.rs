//! Connection URL resolution.
//!
//! The socket URL is derived from the application's own origin (the page the
//! dashboard is served from): a secure origin selects `wss`, and the origin's
//! host is used unless an explicit host override is configured.

use crate::config::ConfigError;
use crate::cursor::ReplayCursors;
use std::collections::BTreeSet;
use url::form_urlencoded::byte_serialize;
use url::Url;

/// Path used when no override is configured
pub const DEFAULT_WS_PATH: &str = "/ws";

/// Environment variable holding the websocket host override (`host` or `host:port`)
pub const HOST_ENV: &str = "PULSE_WS_HOST";

/// Environment variable holding the websocket path override
pub const PATH_ENV: &str = "PULSE_WS_PATH";

/// Where the shared socket connects to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    secure: bool,
    origin_authority: String,
    host_override: Option<String>,
    path: String,
}

impl Default for Endpoint {
    fn default() -> Self {
        Self {
            secure: false,
            origin_authority: "localhost".to_string(),
            host_override: None,
            path: DEFAULT_WS_PATH.to_string(),
        }
    }
}

impl Endpoint {
    /// Create an endpoint for an application origin such as `https://radar.example.com`.
    pub fn new(origin: &str) -> Result<Self, ConfigError> {
        let parsed = Url::parse(origin)
            .map_err(|e| ConfigError::InvalidEndpoint(format!("Invalid origin '{}': {}", origin, e)))?;

        let secure = matches!(parsed.scheme(), "https" | "wss");
        let host = parsed
            .host_str()
            .ok_or_else(|| ConfigError::InvalidEndpoint(format!("No host in origin '{}'", origin)))?;

        Ok(Self {
            secure,
            origin_authority: authority(host, parsed.port()),
            host_override: None,
            path: DEFAULT_WS_PATH.to_string(),
        })
    }

    /// Create an endpoint for `origin`, applying `PULSE_WS_HOST` / `PULSE_WS_PATH` if set.
    pub fn from_env(origin: &str) -> Result<Self, ConfigError> {
        let mut endpoint = Self::new(origin)?;
        if let Some(host) = non_empty_env(HOST_ENV) {
            endpoint = endpoint.with_host(host);
        }
        if let Some(path) = non_empty_env(PATH_ENV) {
            endpoint = endpoint.with_path(path);
        }
        Ok(endpoint)
    }

    /// Override the host (optionally with `:port`) instead of using the origin's.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        let host = host.into();
        let (name, port) = split_port(&host);
        self.host_override = Some(authority(name, port));
        self
    }

    /// Override the socket path.
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        let path = path.into();
        self.path = if path.starts_with('/') {
            path
        } else {
            format!("/{}", path)
        };
        self
    }

    /// Whether the socket uses `wss`
    pub fn is_secure(&self) -> bool {
        self.secure
    }

    /// Host (and non-standard port) the socket connects to
    pub fn host(&self) -> &str {
        self.host_override
            .as_deref()
            .unwrap_or(&self.origin_authority)
    }

    /// Socket path
    pub fn path(&self) -> &str {
        &self.path
    }

    /// `ws[s]://host[:port]/path` without any query
    pub fn base_url(&self) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        format!("{}://{}{}", scheme, self.host(), self.path)
    }

    /// Build the URL for a connection carrying `topics` and any non-zero replay cursors.
    ///
    /// Topics are emitted sorted; each name is form-encoded on its own so the
    /// `,` and `:` separators stay literal.
    pub fn connection_url(
        &self,
        topics: &BTreeSet<String>,
        cursors: &ReplayCursors,
    ) -> Result<Url, ConfigError> {
        let topic_param = topics
            .iter()
            .map(|t| encode(t))
            .collect::<Vec<_>>()
            .join(",");

        let mut url = format!("{}?topics={}", self.base_url(), topic_param);

        let last_seq = cursors
            .iter()
            .filter(|(_, seq)| *seq > 0)
            .map(|(topic, seq)| format!("{}:{}", encode(topic), seq))
            .collect::<Vec<_>>();
        if !last_seq.is_empty() {
            url.push_str("&lastSeq=");
            url.push_str(&last_seq.join(","));
        }

        Url::parse(&url)
            .map_err(|e| ConfigError::InvalidEndpoint(format!("Invalid socket URL '{}': {}", url, e)))
    }
}

fn encode(value: &str) -> String {
    byte_serialize(value.as_bytes()).collect()
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Join host and port, dropping the standard ports 80 and 443.
fn authority(host: &str, port: Option<u16>) -> String {
    match port {
        Some(80) | Some(443) | None => host.to_string(),
        Some(port) => format!("{}:{}", host, port),
    }
}

/// Split `host:port`, leaving bare hosts and IPv6 literals without a port intact.
fn split_port(value: &str) -> (&str, Option<u16>) {
    if let Some((host, port)) = value.rsplit_once(':') {
        let is_bare_ipv6 = host.contains(':') && !host.ends_with(']');
        if !is_bare_ipv6 {
            if let Ok(port) = port.parse::<u16>() {
                return (host, Some(port));
            }
        }
    }
    (value, None)
}
