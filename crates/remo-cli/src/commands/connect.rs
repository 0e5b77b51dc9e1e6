//! `remo connect` — expose a local service through a tunnel.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Args;
use tracing::info;

use remo_client::{Client, Config};
use remo_core::identity::{default_identity_path, Identity};

use crate::config::ConfigFile;

#[derive(Args)]
pub struct ConnectArgs {
    /// Server control address (host:port)
    #[arg(long)]
    server: Option<String>,

    /// Subdomain to claim; omit to let the server assign a random one
    /// (requires the server's allow-random flag)
    #[arg(long)]
    subdomain: Option<String>,

    /// Local upstream URL to expose
    #[arg(long)]
    upstream: Option<String>,

    /// Identity file path
    #[arg(long)]
    identity: Option<PathBuf>,
}

pub async fn run(args: ConnectArgs, file: &ConfigFile) -> anyhow::Result<()> {
    let section = &file.client;
    let identity_path = args.identity.unwrap_or_else(default_identity_path);
    let identity = Identity::load(&identity_path).with_context(|| {
        format!(
            "no identity at {} (run `remo auth init` first)",
            identity_path.display()
        )
    })?;
    info!(pubkey = %identity.public_key_base64(), "loaded identity");

    let mut cfg = Config::new(
        args.server.unwrap_or_else(|| section.server.clone()),
        args.upstream.unwrap_or_else(|| section.upstream.clone()),
        identity,
    );
    cfg.subdomain = args.subdomain.unwrap_or_else(|| section.subdomain.clone());

    let client = Arc::new(Client::new(cfg));
    let mut runner = {
        let client = client.clone();
        tokio::spawn(async move { client.run().await })
    };

    tokio::select! {
        result = &mut runner => {
            result??;
            return Ok(());
        }
        _ = super::shutdown_signal() => {
            info!("received shutdown signal");
            client.shutdown();
        }
    }
    runner.await??;
    Ok(())
}
