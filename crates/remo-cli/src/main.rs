//! remo — self-hosted reverse HTTP tunnels.
//!
//! One binary for both sides: `remo server` runs the public front door,
//! `remo connect` exposes a local service through it. Key and reservation
//! management operate on the server's state store.

mod commands;
mod config;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::error;

/// remo — expose local HTTP services on your own domain
#[derive(Parser)]
#[command(name = "remo", version, about = "Self-hosted reverse HTTP tunnels")]
struct Cli {
    /// Log level (trace, debug, info, warn, error). The REMO_LOG
    /// environment variable takes precedence.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Config file path (default: ~/.remo/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the public tunnel server
    Server(commands::server::ServerArgs),

    /// Expose a local service through a tunnel
    Connect(commands::connect::ConnectArgs),

    /// Manage the local signing identity
    Auth {
        #[command(subcommand)]
        action: commands::auth::AuthAction,
    },

    /// Manage authorized keys in the state store
    Keys(commands::keys::KeysArgs),

    /// Manage subdomain reservations
    Reservations(commands::reservations::ReservationsArgs),

    /// Query a running server's status endpoint
    Status(commands::status::StatusArgs),

    /// Print the version
    Version,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_env("REMO_LOG")
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    let file = match config::ConfigFile::load(cli.config.as_deref()) {
        Ok(file) => file,
        Err(e) => {
            error!(error = %e, "failed to load config file");
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Command::Server(args) => commands::server::run(args, &file).await,
        Command::Connect(args) => commands::connect::run(args, &file).await,
        Command::Auth { action } => commands::auth::run(action).await,
        Command::Keys(args) => commands::keys::run(args).await,
        Command::Reservations(args) => commands::reservations::run(args).await,
        Command::Status(args) => commands::status::run(args, &file).await,
        Command::Version => {
            println!("remo {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    };

    if let Err(e) = result {
        error!(error = %e, "command failed");
        std::process::exit(1);
    }
}
