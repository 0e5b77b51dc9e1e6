//! `remo auth` — manage the local signing identity.

use std::path::PathBuf;

use clap::Subcommand;

use remo_core::identity::{default_identity_path, Identity};

#[derive(Subcommand)]
pub enum AuthAction {
    /// Generate an identity if none exists and print the public key
    Init {
        /// Identity file path
        #[arg(long)]
        identity: Option<PathBuf>,
    },
    /// Replace the identity with a fresh key pair
    Rotate {
        /// Identity file path
        #[arg(long)]
        identity: Option<PathBuf>,
    },
}

pub async fn run(action: AuthAction) -> anyhow::Result<()> {
    match action {
        AuthAction::Init { identity } => {
            let path = identity.unwrap_or_else(default_identity_path);
            if path.exists() {
                let existing = Identity::load(&path)?;
                println!("identity already exists at {}", path.display());
                println!("public key: {}", existing.public_key_base64());
                return Ok(());
            }
            let fresh = Identity::generate();
            fresh.save(&path)?;
            println!("identity written to {}", path.display());
            println!("public key: {}", fresh.public_key_base64());
            Ok(())
        }
        AuthAction::Rotate { identity } => {
            let path = identity.unwrap_or_else(default_identity_path);
            let fresh = Identity::generate();
            fresh.save(&path)?;
            println!("identity rotated at {}", path.display());
            println!("public key: {}", fresh.public_key_base64());
            println!("note: servers must authorize the new key before reconnecting");
            Ok(())
        }
    }
}
