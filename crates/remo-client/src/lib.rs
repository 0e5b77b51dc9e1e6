//! remo-client: the private half of the tunnel.
//!
//! Dials out to the server, authenticates with the local identity, and
//! serves every forwarded request against a local upstream. No inbound
//! port is ever opened.

mod client;
mod upstream;

pub use client::{Client, Config};
