//! `remo keys` — manage authorized keys in the state store.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Subcommand};

use remo_core::auth::decode_public_key;
use remo_server::Store;

use crate::config;

#[derive(Args)]
pub struct KeysArgs {
    /// State store path
    #[arg(long)]
    store: Option<PathBuf>,

    #[command(subcommand)]
    action: KeysAction,
}

#[derive(Subcommand)]
enum KeysAction {
    /// List authorized keys and their rules
    List,
    /// Add or update an authorized key
    Add {
        /// Base64-encoded Ed25519 public key
        public_key: String,
        /// Subdomain rule: empty or "*" for any, "prefix*", or a literal
        #[arg(default_value = "")]
        rule: String,
    },
    /// Remove an authorized key
    Remove {
        /// Base64-encoded Ed25519 public key
        public_key: String,
    },
}

pub async fn run(args: KeysArgs) -> anyhow::Result<()> {
    let path = args.store.unwrap_or_else(config::default_store_path);
    let store = Store::open(&path).await?;

    match args.action {
        KeysAction::List => {
            use base64::{engine::general_purpose::STANDARD, Engine as _};
            let entries = store.authorized_entries().await?;
            if entries.is_empty() {
                println!("no authorized keys");
                return Ok(());
            }
            for entry in entries {
                let rule = if entry.rule.is_empty() { "*" } else { &entry.rule };
                println!("{} {}", STANDARD.encode(entry.key.as_bytes()), rule);
            }
            Ok(())
        }
        KeysAction::Add { public_key, rule } => {
            let key = decode_public_key(&public_key).context("invalid public key")?;
            store.upsert_authorized_key(&key, &rule).await?;
            println!("authorized {public_key}");
            Ok(())
        }
        KeysAction::Remove { public_key } => {
            store.delete_authorized_key(&public_key).await?;
            println!("removed {public_key}");
            Ok(())
        }
    }
}
