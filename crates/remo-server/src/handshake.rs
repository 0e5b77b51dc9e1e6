//! Control-plane accept loop and the per-link handshake state machine.
//!
//! A link moves `AwaitingHello → Verifying → Accepted → Serving`; any
//! verification failure sends one `error` envelope and closes the link.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use ed25519_dalek::{Signature, Verifier};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use remo_core::auth::{build_handshake_message, decode_public_key, fresh_timestamp};
use remo_core::protocol::{read_envelope, write_envelope, Envelope, EnvelopeKind};

use crate::server::Inner;
use crate::tunnel::Tunnel;

/// Deadline for the single hello envelope after accept.
const HELLO_TIMEOUT: Duration = Duration::from_secs(10);
/// Deadline for writing the ready / rejection envelope.
const REPLY_TIMEOUT: Duration = Duration::from_secs(10);
/// Bounded retries for random-name collisions before failing the handshake.
const RANDOM_ATTEMPTS: usize = 8;

/// Accept control links until shutdown; one task per link.
pub(crate) async fn accept_loop(inner: Arc<Inner>, listener: TcpListener) {
    let mut shutdown = inner.shutdown.subscribe();
    loop {
        if *shutdown.borrow() {
            return;
        }
        tokio::select! {
            _ = shutdown.changed() => return,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let inner = inner.clone();
                    tokio::spawn(async move {
                        handle_link(inner, stream, peer).await;
                    });
                }
                Err(e) => warn!(error = %e, "control accept failed"),
            },
        }
    }
}

/// Run one link through the handshake and, if accepted, serve its tunnel
/// until it closes. Generic over the link so tests can drive an in-memory
/// stream.
pub(crate) async fn handle_link<L>(inner: Arc<Inner>, mut link: L, peer: SocketAddr)
where
    L: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    debug!(peer = %peer, "control connection accepted");

    let envelope = match timeout(HELLO_TIMEOUT, read_envelope(&mut link)).await {
        Ok(Ok(envelope)) => envelope,
        _ => {
            reject(&mut link, "invalid handshake").await;
            return;
        }
    };
    let hello = match (envelope.kind, envelope.hello) {
        (EnvelopeKind::Hello, Some(hello)) => hello,
        _ => {
            reject(&mut link, "invalid handshake").await;
            return;
        }
    };

    // The signature covers the *originally requested* subdomain, which is
    // empty when the client asks for a random allocation.
    let requested = hello.subdomain.clone();

    if !fresh_timestamp(hello.timestamp) {
        reject(&mut link, "stale handshake").await;
        return;
    }

    let key = match decode_public_key(&hello.public_key) {
        Ok(key) => key,
        Err(_) => {
            reject(&mut link, "invalid public key").await;
            return;
        }
    };
    let signature = match decode_signature(&hello.signature) {
        Some(signature) => signature,
        None => {
            reject(&mut link, "invalid signature").await;
            return;
        }
    };

    let message = build_handshake_message(&requested, hello.timestamp);
    if key.verify(&message, &signature).is_err() {
        reject(&mut link, "signature mismatch").await;
        return;
    }

    let subdomain = if requested.is_empty() {
        if !inner.cfg.allow_random {
            reject(&mut link, "missing subdomain (random not enabled)").await;
            return;
        }
        match allocate_random(&inner).await {
            Some(name) => name,
            None => {
                reject(&mut link, "failed to generate subdomain").await;
                return;
            }
        }
    } else {
        requested
    };

    let pubkey = hello.public_key.clone();

    if let Some(authorizer) = &inner.cfg.authorizer {
        if !authorizer.allow(&key, &subdomain) {
            inner.audit("handshake", &subdomain, &pubkey);
            reject(&mut link, &format!("unauthorized subdomain {subdomain}")).await;
            return;
        }
    }

    if let Some(store) = &inner.store {
        let owner = match store.reservation_owner(&subdomain).await {
            Ok(owner) => owner,
            Err(e) => {
                reject(&mut link, &e.to_string()).await;
                return;
            }
        };
        match owner {
            Some(owner) if owner != pubkey => {
                inner.audit("handshake", &subdomain, &pubkey);
                reject(&mut link, "subdomain reserved").await;
                return;
            }
            None if inner.cfg.auto_reserve => {
                match store.try_reserve_subdomain(&subdomain, &pubkey).await {
                    Ok(true) => inner.audit("register", &subdomain, &pubkey),
                    // Lost the race with a concurrent first claim; only
                    // proceed if that claim was ours.
                    Ok(false) => {
                        let owner = store.reservation_owner(&subdomain).await.ok().flatten();
                        if owner.as_deref() != Some(pubkey.as_str()) {
                            inner.audit("handshake", &subdomain, &pubkey);
                            reject(&mut link, "subdomain reserved").await;
                            return;
                        }
                    }
                    Err(e) => {
                        reject(&mut link, &e.to_string()).await;
                        return;
                    }
                }
            }
            _ => {}
        }
    }

    let ready = Envelope::ready("ready", &subdomain);
    match timeout(REPLY_TIMEOUT, write_envelope(&mut link, &ready)).await {
        Ok(Ok(())) => {}
        _ => {
            warn!(subdomain, "failed to send ready");
            return;
        }
    }

    let (read_half, write_half) = tokio::io::split(link);
    let tunnel = Arc::new(Tunnel::new(&subdomain, &pubkey, Box::new(write_half)));

    if !inner.registry.register(&subdomain, tunnel.clone()).await {
        warn!(subdomain, "subdomain already in use");
        tunnel.send_error("subdomain busy").await;
        tunnel.close(None).await;
        return;
    }

    info!(subdomain, pubkey = %pubkey, peer = %peer, "tunnel connected and registered");
    inner.audit("connect", &subdomain, &pubkey);

    tokio::spawn(tunnel.clone().run_reader(Box::new(read_half)));
    tokio::spawn(tunnel.clone().run_keepalive());

    let mut closed = tunnel.subscribe_closed();
    if !*closed.borrow() {
        let _ = closed.changed().await;
    }

    inner.registry.unregister(&subdomain, &tunnel).await;
    inner.audit("disconnect", &subdomain, &pubkey);
}

fn decode_signature(encoded: &str) -> Option<Signature> {
    let bytes = STANDARD.decode(encoded).ok()?;
    let bytes: [u8; 64] = bytes.as_slice().try_into().ok()?;
    Some(Signature::from_bytes(&bytes))
}

/// Generate an 8-hex-char name not currently registered. Bounded so a
/// hostile client cannot turn collisions into unbounded registry load.
async fn allocate_random(inner: &Inner) -> Option<String> {
    for _ in 0..RANDOM_ATTEMPTS {
        let raw: [u8; 4] = rand::random();
        let name = hex::encode(raw);
        if !inner.registry.has(&name).await {
            return Some(name);
        }
    }
    None
}

async fn reject<L>(link: &mut L, reason: &str)
where
    L: AsyncWrite + Unpin,
{
    debug!(reason, "handshake rejected");
    let envelope = Envelope::error(reason);
    let _ = timeout(REPLY_TIMEOUT, write_envelope(link, &envelope)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    use remo_core::protocol::HelloPayload;
    use remo_core::{AuthorizedKeys, Identity};
    use remo_core::auth::KeyEntry;

    use crate::config::Config;
    use crate::server::test_inner as inner_with;
    use crate::store::Store;

    fn now() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:4000".parse().unwrap()
    }

    fn hello(identity: &Identity, subdomain: &str, timestamp: i64) -> Envelope {
        Envelope::hello(HelloPayload {
            subdomain: subdomain.into(),
            public_key: identity.public_key_base64(),
            timestamp,
            signature: identity.sign_handshake_base64(subdomain, timestamp),
        })
    }

    /// Drive one handshake over an in-memory link; returns the first reply.
    async fn shake(inner: Arc<Inner>, envelope: Envelope) -> Envelope {
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(handle_link(inner, server, peer()));
        write_envelope(&mut client, &envelope).await.unwrap();
        read_envelope(&mut client).await.unwrap()
    }

    #[tokio::test]
    async fn happy_path_registers_tunnel() {
        let identity = Identity::generate();
        let inner = inner_with(Config::new("example.test"), None);

        let reply = shake(inner.clone(), hello(&identity, "demo", now())).await;
        assert_eq!(reply.kind, EnvelopeKind::Ready);
        assert_eq!(reply.ready.unwrap().subdomain, "demo");

        // Registration is visible once the ready reply is out.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(inner.registry.has("demo").await);
    }

    #[tokio::test]
    async fn stale_timestamp_is_rejected() {
        let identity = Identity::generate();
        let inner = inner_with(Config::new("example.test"), None);

        let reply = shake(inner.clone(), hello(&identity, "demo", now() - 600)).await;
        assert_eq!(reply.kind, EnvelopeKind::Error);
        assert_eq!(reply.error, "stale handshake");
        assert!(!inner.registry.has("demo").await);
    }

    #[tokio::test]
    async fn zero_timestamp_is_rejected() {
        let identity = Identity::generate();
        let inner = inner_with(Config::new("example.test"), None);
        let reply = shake(inner, hello(&identity, "demo", 0)).await;
        assert_eq!(reply.error, "stale handshake");
    }

    #[tokio::test]
    async fn tampered_signature_is_rejected() {
        let identity = Identity::generate();
        let inner = inner_with(Config::new("example.test"), None);

        let mut envelope = hello(&identity, "demo", now());
        envelope.hello.as_mut().unwrap().subdomain = "other".into();
        let reply = shake(inner, envelope).await;
        assert_eq!(reply.error, "signature mismatch");
    }

    #[tokio::test]
    async fn malformed_key_and_signature_are_rejected() {
        let identity = Identity::generate();
        let inner = inner_with(Config::new("example.test"), None);

        let mut envelope = hello(&identity, "demo", now());
        envelope.hello.as_mut().unwrap().public_key = "AAAA".into();
        let reply = shake(inner.clone(), envelope).await;
        assert_eq!(reply.error, "invalid public key");

        let mut envelope = hello(&identity, "demo", now());
        envelope.hello.as_mut().unwrap().signature = "!!!".into();
        let reply = shake(inner, envelope).await;
        assert_eq!(reply.error, "invalid signature");
    }

    #[tokio::test]
    async fn non_hello_first_envelope_is_invalid() {
        let inner = inner_with(Config::new("example.test"), None);
        let reply = shake(inner, Envelope::ping()).await;
        assert_eq!(reply.error, "invalid handshake");
    }

    #[tokio::test]
    async fn random_allocation_requires_opt_in() {
        let identity = Identity::generate();
        let inner = inner_with(Config::new("example.test"), None);
        let reply = shake(inner, hello(&identity, "", now())).await;
        assert_eq!(reply.error, "missing subdomain (random not enabled)");
    }

    #[tokio::test]
    async fn random_allocation_assigns_hex_name() {
        let identity = Identity::generate();
        let mut cfg = Config::new("example.test");
        cfg.allow_random = true;
        let inner = inner_with(cfg, None);

        let reply = shake(inner.clone(), hello(&identity, "", now())).await;
        assert_eq!(reply.kind, EnvelopeKind::Ready);
        let assigned = reply.ready.unwrap().subdomain;
        assert_eq!(assigned.len(), 8);
        assert!(assigned.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn authorizer_gates_subdomains() {
        let identity = Identity::generate();
        let mut cfg = Config::new("example.test");
        cfg.authorizer = Some(AuthorizedKeys::new(vec![KeyEntry {
            key: identity.verifying_key(),
            rule: "app*".into(),
        }]));
        let inner = inner_with(cfg, None);

        let reply = shake(inner.clone(), hello(&identity, "blog", now())).await;
        assert_eq!(reply.error, "unauthorized subdomain blog");

        let reply = shake(inner, hello(&identity, "app-prod", now())).await;
        assert_eq!(reply.kind, EnvelopeKind::Ready);
    }

    #[tokio::test]
    async fn reservation_conflict_rejects_other_keys() {
        let owner = Identity::generate();
        let intruder = Identity::generate();
        let store = Store::open_in_memory().await.unwrap();
        store
            .reserve_subdomain("blog", &owner.public_key_base64())
            .await
            .unwrap();

        let inner = inner_with(Config::new("example.test"), Some(store));

        let reply = shake(inner.clone(), hello(&intruder, "blog", now())).await;
        assert_eq!(reply.error, "subdomain reserved");

        let reply = shake(inner, hello(&owner, "blog", now())).await;
        assert_eq!(reply.kind, EnvelopeKind::Ready);
    }

    #[tokio::test]
    async fn auto_reserve_records_first_claimant() {
        let identity = Identity::generate();
        let store = Store::open_in_memory().await.unwrap();
        let mut cfg = Config::new("example.test");
        cfg.auto_reserve = true;
        let inner = inner_with(cfg, Some(store.clone()));

        let reply = shake(inner, hello(&identity, "fresh", now())).await;
        assert_eq!(reply.kind, EnvelopeKind::Ready);

        let owner = store.reservation_owner("fresh").await.unwrap();
        assert_eq!(owner.as_deref(), Some(identity.public_key_base64().as_str()));
    }

    #[tokio::test]
    async fn second_claim_of_live_subdomain_is_busy() {
        let identity = Identity::generate();
        let inner = inner_with(Config::new("example.test"), None);

        let reply = shake(inner.clone(), hello(&identity, "demo", now())).await;
        assert_eq!(reply.kind, EnvelopeKind::Ready);
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Second handshake for the same name: ready is emitted, then the
        // registration collision surfaces as an error envelope.
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(handle_link(inner.clone(), server, peer()));
        write_envelope(&mut client, &hello(&identity, "demo", now()))
            .await
            .unwrap();
        let first = read_envelope(&mut client).await.unwrap();
        assert_eq!(first.kind, EnvelopeKind::Ready);
        let second = read_envelope(&mut client).await.unwrap();
        assert_eq!(second.kind, EnvelopeKind::Error);
        assert_eq!(second.error, "subdomain busy");
    }
}
