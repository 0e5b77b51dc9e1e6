//! remo-server: the public-facing half of the tunnel.
//!
//! Terminates public HTTP(S) requests on wildcard subdomains, authenticates
//! clients over the framed control protocol, and multiplexes every public
//! request over the owning client's link.

pub mod config;
pub mod events;
mod handshake;
pub mod metrics;
mod proxy;
pub mod registry;
pub mod server;
pub mod store;
pub mod tunnel;

pub use config::{Config, Mode};
pub use server::Server;
pub use store::Store;
