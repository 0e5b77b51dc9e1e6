//! Length-prefixed JSON framing for the remo control link.
//!
//! Wire format: `[4-byte big-endian length][JSON payload]`
//!
//! The payload is a single self-describing envelope with a `type`
//! discriminator and optional per-kind payloads. Field names are part of
//! the wire contract and must stay stable across versions. Envelopes with
//! an unrecognized discriminator decode to [`EnvelopeKind::Unknown`] and
//! are skipped by readers outside the handshake.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{RemoError, RemoResult};

/// Maximum serialized frame size. Anything larger is a fatal protocol
/// error on either side of the link.
pub const MAX_FRAME_BYTES: usize = 1 << 20;

/// Envelope discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeKind {
    Hello,
    Ready,
    Request,
    Response,
    Error,
    /// Liveness probe. Carries no payload; peers that do not know it
    /// ignore it like any other unknown kind.
    Ping,
    #[serde(other)]
    Unknown,
}

/// A single control-link message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hello: Option<HelloPayload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ready: Option<ReadyPayload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<RequestPayload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<ResponsePayload>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

/// Client handshake: claim a subdomain with a signed timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloPayload {
    /// Requested subdomain; empty requests a random allocation.
    pub subdomain: String,
    /// Base64-encoded Ed25519 public key (32 bytes).
    pub public_key: String,
    /// Seconds since epoch at signing time.
    pub timestamp: i64,
    /// Base64-encoded Ed25519 signature over `subdomain + "|" + timestamp`.
    pub signature: String,
}

/// Server acceptance; `subdomain` is the authoritative assigned name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadyPayload {
    pub message: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub subdomain: String,
}

/// A public HTTP request forwarded through the tunnel.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestPayload {
    /// Correlation id, unique within the tunnel. Assigned by the server.
    #[serde(default)]
    pub id: String,
    pub method: String,
    /// Path plus query string, as received from the public side.
    pub target: String,
    #[serde(default)]
    pub headers: HashMap<String, Vec<String>>,
    #[serde(default, with = "base64_bytes")]
    pub body: Vec<u8>,
}

/// The client's reply, correlated back to the waiter by `id`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponsePayload {
    #[serde(default)]
    pub id: String,
    pub status: u16,
    #[serde(default)]
    pub headers: HashMap<String, Vec<String>>,
    #[serde(default, with = "base64_bytes")]
    pub body: Vec<u8>,
}

impl Envelope {
    fn empty(kind: EnvelopeKind) -> Self {
        Self {
            kind,
            hello: None,
            ready: None,
            request: None,
            response: None,
            error: String::new(),
        }
    }

    pub fn hello(payload: HelloPayload) -> Self {
        Self {
            hello: Some(payload),
            ..Self::empty(EnvelopeKind::Hello)
        }
    }

    pub fn ready(message: impl Into<String>, subdomain: impl Into<String>) -> Self {
        Self {
            ready: Some(ReadyPayload {
                message: message.into(),
                subdomain: subdomain.into(),
            }),
            ..Self::empty(EnvelopeKind::Ready)
        }
    }

    pub fn request(payload: RequestPayload) -> Self {
        Self {
            request: Some(payload),
            ..Self::empty(EnvelopeKind::Request)
        }
    }

    pub fn response(payload: ResponsePayload) -> Self {
        Self {
            response: Some(payload),
            ..Self::empty(EnvelopeKind::Response)
        }
    }

    pub fn error(reason: impl Into<String>) -> Self {
        Self {
            error: reason.into(),
            ..Self::empty(EnvelopeKind::Error)
        }
    }

    pub fn ping() -> Self {
        Self::empty(EnvelopeKind::Ping)
    }
}

/// Write one length-prefixed envelope to the link.
///
/// Callers bound the write with `tokio::time::timeout`; a deadline expiry
/// must be treated as fatal for the link.
pub async fn write_envelope<W>(writer: &mut W, envelope: &Envelope) -> RemoResult<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let payload = serde_json::to_vec(envelope)?;
    if payload.len() > MAX_FRAME_BYTES {
        return Err(RemoError::Protocol("frame too large".into()));
    }
    writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed envelope from the link.
///
/// Oversized frames are a fatal protocol error: the remaining stream
/// cannot be resynchronized and the link must be closed.
pub async fn read_envelope<R>(reader: &mut R) -> RemoResult<Envelope>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; 4];
    reader.read_exact(&mut header).await?;
    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(RemoError::Protocol("frame too large".into()));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(serde_json::from_slice(&payload)?)
}

/// Serialize byte bodies as standard-alphabet base64 strings so frames
/// stay valid JSON text regardless of payload content.
mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
