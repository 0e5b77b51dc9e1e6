//! `remo status` — query a running server's status endpoint.

use anyhow::{bail, Context};
use clap::Args;

use crate::config::ConfigFile;

#[derive(Args)]
pub struct StatusArgs {
    /// Base URL of the server's admin surface
    #[arg(long, default_value = "http://127.0.0.1:8080")]
    server: String,

    /// Admin bearer secret
    #[arg(long)]
    admin_secret: Option<String>,
}

pub async fn run(args: StatusArgs, file: &ConfigFile) -> anyhow::Result<()> {
    let secret = args
        .admin_secret
        .or_else(|| file.server.admin_secret.clone())
        .context("--admin-secret is required")?;

    let url = format!("{}/status", args.server.trim_end_matches('/'));
    let response = reqwest::Client::new()
        .get(&url)
        .bearer_auth(&secret)
        .send()
        .await
        .with_context(|| format!("request to {url} failed"))?;

    if !response.status().is_success() {
        bail!("server returned {}", response.status());
    }

    let status: serde_json::Value = response.json().await.context("malformed status body")?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}
