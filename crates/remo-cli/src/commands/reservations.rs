//! `remo reservations` — manage subdomain reservations.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Subcommand};

use remo_core::auth::decode_public_key;
use remo_server::Store;

use crate::config;

#[derive(Args)]
pub struct ReservationsArgs {
    /// State store path
    #[arg(long)]
    store: Option<PathBuf>,

    #[command(subcommand)]
    action: ReservationsAction,
}

#[derive(Subcommand)]
enum ReservationsAction {
    /// List reservations
    List,
    /// Reserve a subdomain for a key (overwrites a prior owner)
    Set {
        subdomain: String,
        /// Base64-encoded Ed25519 public key of the owner
        public_key: String,
    },
}

pub async fn run(args: ReservationsArgs) -> anyhow::Result<()> {
    let path = args.store.unwrap_or_else(config::default_store_path);
    let store = Store::open(&path).await?;

    match args.action {
        ReservationsAction::List => {
            let reservations = store.reservations().await?;
            if reservations.is_empty() {
                println!("no reservations");
                return Ok(());
            }
            for reservation in reservations {
                println!(
                    "{} {} {}",
                    reservation.subdomain, reservation.pubkey, reservation.created_at
                );
            }
            Ok(())
        }
        ReservationsAction::Set {
            subdomain,
            public_key,
        } => {
            decode_public_key(&public_key).context("invalid public key")?;
            store.reserve_subdomain(&subdomain, &public_key).await?;
            println!("reserved {subdomain} for {public_key}");
            Ok(())
        }
    }
}
