//! remo-core: Shared protocol library for the remo reverse HTTP tunnel.
//!
//! Provides the framed JSON envelope codec spoken on the control link,
//! Ed25519 identity management, and the handshake/authorization rules
//! shared by the server and the client.

pub mod auth;
pub mod error;
pub mod identity;
pub mod protocol;

// Re-export commonly used items at crate root.
pub use auth::{build_handshake_message, fresh_timestamp, AuthorizedKeys, KeyEntry};
pub use error::{RemoError, RemoResult};
pub use identity::Identity;
pub use protocol::{
    read_envelope, write_envelope, Envelope, EnvelopeKind, HelloPayload, ReadyPayload,
    RequestPayload, ResponsePayload, MAX_FRAME_BYTES,
};
