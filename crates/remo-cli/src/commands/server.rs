//! `remo server` — run the public tunnel server.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Args;
use ipnet::IpNet;
use tracing::info;

use remo_core::AuthorizedKeys;
use remo_server::{Config, Mode, Server, Store};

use crate::config::{self, ConfigFile};

#[derive(Args)]
pub struct ServerArgs {
    /// Public/admin HTTP listen address
    #[arg(long)]
    listen: Option<String>,

    /// Control-plane listen address for tunnel clients
    #[arg(long)]
    control: Option<String>,

    /// Apex domain served (e.g. example.test)
    #[arg(long)]
    domain: Option<String>,

    /// Extra routing label between subdomains and the apex
    #[arg(long)]
    subdomain_prefix: Option<String>,

    /// Deployment mode: standalone (terminate TLS) or behind-proxy
    #[arg(long)]
    mode: Option<String>,

    /// TLS certificate PEM (standalone mode)
    #[arg(long)]
    tls_cert: Option<PathBuf>,

    /// TLS private key PEM (standalone mode)
    #[arg(long)]
    tls_key: Option<PathBuf>,

    /// Trusted proxy network in CIDR form (repeatable)
    #[arg(long = "trusted-proxy")]
    trusted_proxies: Vec<String>,

    /// Maximum X-Forwarded-For entries accepted from a trusted proxy
    #[arg(long)]
    trusted_hops: Option<usize>,

    /// Authorized-keys file, imported into the store at startup
    #[arg(long)]
    authorized_keys: Option<PathBuf>,

    /// State store path; pass "none" to run without persistence
    #[arg(long)]
    store: Option<String>,

    /// Reserve unreserved subdomains for their first claimant
    #[arg(long)]
    reserve: bool,

    /// Allow hellos with no subdomain and assign a random name
    #[arg(long)]
    allow_random: bool,

    /// Admin bearer secret (otherwise sourced from the store)
    #[arg(long)]
    admin_secret: Option<String>,

    /// Dispatch deadline in seconds for forwarded requests
    #[arg(long)]
    read_timeout: Option<u64>,
}

pub async fn run(args: ServerArgs, file: &ConfigFile) -> anyhow::Result<()> {
    let section = &file.server;

    let domain = args
        .domain
        .or_else(|| non_empty(&section.domain))
        .context("--domain is required (or set [server] domain in the config file)")?;

    let mode = match args.mode.as_deref().unwrap_or(&section.mode) {
        "standalone" => Mode::Standalone,
        "behind-proxy" => Mode::BehindProxy,
        other => bail!("unknown mode {other:?} (expected standalone or behind-proxy)"),
    };

    let mut trusted = args.trusted_proxies.clone();
    if trusted.is_empty() {
        trusted = section.trusted_proxies.clone();
    }
    let trusted_proxies = trusted
        .iter()
        .map(|cidr| {
            cidr.parse::<IpNet>()
                .with_context(|| format!("invalid trusted proxy CIDR {cidr:?}"))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    let store = match args.store.as_deref() {
        Some("none") => None,
        Some(path) => Some(Store::open(Path::new(path)).await?),
        None => Some(Store::open(&config::default_store_path()).await?),
    };

    let authorizer = build_authorizer(
        args.authorized_keys
            .or_else(|| section.authorized_keys.clone().map(PathBuf::from)),
        store.as_ref(),
    )
    .await?;

    let mut cfg = Config::new(domain);
    cfg.subdomain_prefix = args
        .subdomain_prefix
        .unwrap_or_else(|| section.subdomain_prefix.clone());
    cfg.http_addr = args.listen.unwrap_or_else(|| section.listen.clone());
    cfg.control_addr = args.control.unwrap_or_else(|| section.control.clone());
    cfg.read_timeout = Duration::from_secs(args.read_timeout.unwrap_or(section.read_timeout_secs));
    cfg.mode = mode;
    cfg.tls_cert = args
        .tls_cert
        .or_else(|| section.tls_cert.clone().map(PathBuf::from));
    cfg.tls_key = args
        .tls_key
        .or_else(|| section.tls_key.clone().map(PathBuf::from));
    cfg.trusted_proxies = trusted_proxies;
    cfg.trusted_hops = args.trusted_hops.unwrap_or(section.trusted_hops);
    cfg.admin_secret = args.admin_secret.or_else(|| section.admin_secret.clone());
    cfg.authorizer = authorizer;
    cfg.auto_reserve = args.reserve;
    cfg.allow_random = args.allow_random;

    let server = Arc::new(Server::new(cfg, store).await?);

    let mut runner = {
        let server = server.clone();
        tokio::spawn(async move { server.run().await })
    };

    tokio::select! {
        result = &mut runner => {
            result??;
            return Ok(());
        }
        _ = super::shutdown_signal() => {
            info!("received shutdown signal");
            server.shutdown();
        }
    }
    runner.await??;
    Ok(())
}

/// The effective key policy: file entries are upserted into the store,
/// and the store's full set (or the file alone, without a store) becomes
/// the authorizer. With neither, any key is admitted.
async fn build_authorizer(
    path: Option<PathBuf>,
    store: Option<&Store>,
) -> anyhow::Result<Option<AuthorizedKeys>> {
    let file_keys = match &path {
        Some(path) => Some(
            AuthorizedKeys::load(path)
                .with_context(|| format!("loading authorized keys from {}", path.display()))?,
        ),
        None => None,
    };

    let Some(store) = store else {
        return Ok(file_keys);
    };

    if let Some(keys) = &file_keys {
        for entry in keys.entries() {
            store.upsert_authorized_key(&entry.key, &entry.rule).await?;
        }
        info!(count = keys.entries().len(), "imported authorized keys into store");
    }

    let entries = store.authorized_entries().await?;
    if entries.is_empty() {
        return Ok(None);
    }
    Ok(Some(AuthorizedKeys::new(entries)))
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}
