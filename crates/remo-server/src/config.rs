//! Server configuration, passed explicitly to [`crate::Server::new`].

use std::path::PathBuf;
use std::time::Duration;

use ipnet::IpNet;
use remo_core::AuthorizedKeys;

/// Deployment mode of the front door.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Terminate TLS ourselves; requires cert and key material.
    Standalone,
    /// Plain HTTP behind an operator-managed reverse proxy.
    BehindProxy,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Standalone => "standalone",
            Mode::BehindProxy => "behind-proxy",
        }
    }
}

/// Everything the server needs. No global state: construct one, pass it in.
#[derive(Debug, Clone)]
pub struct Config {
    /// Apex domain under which tunnel subdomains live (e.g. `example.test`).
    pub domain: String,
    /// Optional extra label between subdomains and the apex
    /// (`<sub>.<prefix>.<domain>` when set).
    pub subdomain_prefix: String,
    /// Bind address of the public/admin HTTP listener.
    pub http_addr: String,
    /// Bind address of the control-plane (tunnel) listener.
    pub control_addr: String,
    /// Per-dispatch deadline for forwarded requests.
    pub read_timeout: Duration,
    pub mode: Mode,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    /// Peers inside any of these networks may speak for their clients
    /// via forwarding headers.
    pub trusted_proxies: Vec<IpNet>,
    /// Maximum number of `X-Forwarded-For` entries accepted from a
    /// trusted proxy.
    pub trusted_hops: usize,
    /// Explicit admin secret; when `None` it is resolved from the store.
    pub admin_secret: Option<String>,
    /// Key policy; `None` admits any key (reservations still apply).
    pub authorizer: Option<AuthorizedKeys>,
    /// Reserve unreserved subdomains for the first key that claims them.
    pub auto_reserve: bool,
    /// Permit hellos with an empty subdomain and allocate a random name.
    pub allow_random: bool,
}

impl Config {
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            subdomain_prefix: String::new(),
            http_addr: "0.0.0.0:8080".into(),
            control_addr: "0.0.0.0:9922".into(),
            read_timeout: Duration::from_secs(30),
            mode: Mode::BehindProxy,
            tls_cert: None,
            tls_key: None,
            trusted_proxies: Vec::new(),
            trusted_hops: 1,
            admin_secret: None,
            authorizer: None,
            auto_reserve: false,
            allow_random: false,
        }
    }

    /// The full routing suffix public hosts must end with.
    pub fn routing_domain(&self) -> String {
        if self.subdomain_prefix.is_empty() {
            self.domain.clone()
        } else {
            format!("{}.{}", self.subdomain_prefix, self.domain)
        }
    }
}
