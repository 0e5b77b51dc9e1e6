//! Config file: TOML under `~/.remo/`, with CLI flags taking precedence.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub client: ClientSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    /// Public/admin HTTP listen address.
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Control-plane listen address for tunnel clients.
    #[serde(default = "default_control")]
    pub control: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub subdomain_prefix: String,
    /// `standalone` or `behind-proxy`.
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default)]
    pub tls_cert: Option<String>,
    #[serde(default)]
    pub tls_key: Option<String>,
    /// Trusted proxy networks in CIDR form.
    #[serde(default)]
    pub trusted_proxies: Vec<String>,
    #[serde(default = "default_hops")]
    pub trusted_hops: usize,
    #[serde(default)]
    pub authorized_keys: Option<String>,
    #[serde(default)]
    pub admin_secret: Option<String>,
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            control: default_control(),
            domain: String::new(),
            subdomain_prefix: String::new(),
            mode: default_mode(),
            tls_cert: None,
            tls_key: None,
            trusted_proxies: Vec::new(),
            trusted_hops: default_hops(),
            authorized_keys: None,
            admin_secret: None,
            read_timeout_secs: default_read_timeout(),
        }
    }
}

/// `[client]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientSection {
    /// Server control address (`host:port`).
    #[serde(default = "default_server")]
    pub server: String,
    /// Local upstream to expose.
    #[serde(default = "default_upstream")]
    pub upstream: String,
    #[serde(default)]
    pub subdomain: String,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            server: default_server(),
            upstream: default_upstream(),
            subdomain: String::new(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_control() -> String {
    "0.0.0.0:9922".to_string()
}
fn default_mode() -> String {
    "behind-proxy".to_string()
}
fn default_hops() -> usize {
    1
}
fn default_read_timeout() -> u64 {
    30
}
fn default_server() -> String {
    "127.0.0.1:9922".to_string()
}
fn default_upstream() -> String {
    "http://127.0.0.1:3000".to_string()
}

impl ConfigFile {
    /// Load the config file, falling back to defaults when it is absent.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = path
            .map(PathBuf::from)
            .unwrap_or_else(|| remo_dir().join("config.toml"));
        if !path.exists() {
            return Ok(Self::default());
        }
        info!(path = %path.display(), "loading config file");
        let content = std::fs::read_to_string(&path)?;
        let parsed = toml::from_str::<Self>(&content)
            .map_err(|e| anyhow::anyhow!("config parse error: {e}"))?;
        Ok(parsed)
    }
}

/// The per-user remo directory.
pub fn remo_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".remo")
}

/// Default location of the server's state store.
pub fn default_store_path() -> PathBuf {
    remo_dir().join("state.db")
}
