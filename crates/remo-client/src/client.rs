//! Connection lifecycle: dial, handshake, serve loop, reconnect.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use remo_core::protocol::{read_envelope, write_envelope, Envelope, EnvelopeKind, HelloPayload};
use remo_core::{Identity, RemoError, RemoResult};

use crate::upstream;

/// Deadline for the dial plus each handshake envelope.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Client configuration.
pub struct Config {
    /// `host:port` of the server's control listener.
    pub server_addr: String,
    /// Requested subdomain; empty asks the server for a random one.
    pub subdomain: String,
    /// Base URL of the local service to expose, e.g. `http://127.0.0.1:3000`.
    pub upstream_url: String,
    pub identity: Identity,
    pub dial_timeout: Duration,
    pub reconnect_min: Duration,
    pub reconnect_max: Duration,
}

impl Config {
    pub fn new(
        server_addr: impl Into<String>,
        upstream_url: impl Into<String>,
        identity: Identity,
    ) -> Self {
        Self {
            server_addr: server_addr.into(),
            subdomain: String::new(),
            upstream_url: upstream_url.into(),
            identity,
            dial_timeout: Duration::from_secs(15),
            reconnect_min: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(30),
        }
    }
}

pub struct Client {
    cfg: Config,
    http: reqwest::Client,
    /// The server-assigned name, sticky across reconnects within this
    /// process so a random allocation survives a dropped link.
    assigned: Mutex<Option<String>>,
    shutdown: watch::Sender<bool>,
}

impl Client {
    pub fn new(cfg: Config) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            cfg,
            http: reqwest::Client::new(),
            assigned: Mutex::new(None),
            shutdown,
        }
    }

    /// Abort the session and any pending reconnect.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// The subdomain the server assigned on the last successful handshake.
    pub async fn assigned_subdomain(&self) -> Option<String> {
        self.assigned.lock().await.clone()
    }

    /// Run sessions until shutdown, reconnecting with exponential backoff.
    /// Authentication rejections are not retried.
    pub async fn run(self: Arc<Self>) -> RemoResult<()> {
        let mut shutdown = self.shutdown.subscribe();
        let mut attempt: u32 = 0;
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }
            match self.run_session().await {
                Ok(()) => return Ok(()),
                Err(RemoError::Handshake(reason)) => {
                    return Err(RemoError::Handshake(reason));
                }
                Err(e) => {
                    attempt += 1;
                    let delay = self.backoff(attempt);
                    warn!(error = %e, attempt, backoff = ?delay, "session ended; reconnecting");
                    tokio::select! {
                        _ = shutdown.changed() => return Ok(()),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// One dial-to-disconnect session. Returns `Ok` only on shutdown.
    async fn run_session(&self) -> RemoResult<()> {
        let stream = timeout(
            self.cfg.dial_timeout,
            TcpStream::connect(&self.cfg.server_addr),
        )
        .await
        .map_err(|_| RemoError::Timeout)??;
        let mut stream = stream;

        // Reconnects re-request the name the server last assigned, so
        // random allocations stay stable for the session.
        let requested = self
            .assigned
            .lock()
            .await
            .clone()
            .unwrap_or_else(|| self.cfg.subdomain.clone());

        let timestamp = unix_now();
        let hello = Envelope::hello(HelloPayload {
            subdomain: requested.clone(),
            public_key: self.cfg.identity.public_key_base64(),
            timestamp,
            signature: self.cfg.identity.sign_handshake_base64(&requested, timestamp),
        });
        timeout(HANDSHAKE_TIMEOUT, write_envelope(&mut stream, &hello))
            .await
            .map_err(|_| RemoError::Timeout)??;

        let reply = timeout(HANDSHAKE_TIMEOUT, read_envelope(&mut stream))
            .await
            .map_err(|_| RemoError::Timeout)??;
        let assigned = match reply.kind {
            EnvelopeKind::Ready => reply
                .ready
                .map(|ready| ready.subdomain)
                .filter(|subdomain| !subdomain.is_empty())
                .unwrap_or(requested),
            EnvelopeKind::Error => return Err(RemoError::Handshake(reply.error)),
            _ => {
                return Err(RemoError::Protocol(
                    "unexpected envelope during handshake".into(),
                ))
            }
        };
        info!(subdomain = %assigned, server = %self.cfg.server_addr, "tunnel established");
        *self.assigned.lock().await = Some(assigned);

        let (mut reader, writer) = tokio::io::split(stream);
        let writer = Arc::new(Mutex::new(writer));
        let mut shutdown = self.shutdown.subscribe();

        loop {
            tokio::select! {
                _ = shutdown.changed() => return Ok(()),
                result = read_envelope(&mut reader) => {
                    let envelope = result.map_err(|e| RemoError::Transport(e.to_string()))?;
                    match envelope.kind {
                        EnvelopeKind::Request => {
                            let Some(request) = envelope.request else { continue };
                            debug!(id = %request.id, method = %request.method, target = %request.target, "forwarded request");
                            let http = self.http.clone();
                            let upstream_url = self.cfg.upstream_url.clone();
                            let writer = writer.clone();
                            tokio::spawn(async move {
                                let response = upstream::execute(&http, &upstream_url, &request).await;
                                let envelope = Envelope::response(response);
                                let mut writer = writer.lock().await;
                                if let Err(e) = write_envelope(&mut *writer, &envelope).await {
                                    warn!(error = %e, "failed to send response envelope");
                                }
                            });
                        }
                        // The server closed the session with a reason.
                        EnvelopeKind::Error => {
                            return Err(RemoError::Transport(envelope.error));
                        }
                        // Keepalive probes and future kinds.
                        _ => {}
                    }
                }
            }
        }
    }

    /// Exponential backoff: base doubling per attempt, capped, with
    /// uniform jitter up to 25% of the current delay.
    fn backoff(&self, attempt: u32) -> Duration {
        let mut delay = self.cfg.reconnect_min;
        for _ in 1..attempt {
            delay = delay.saturating_mul(2);
            if delay >= self.cfg.reconnect_max {
                delay = self.cfg.reconnect_max;
                break;
            }
        }
        let jitter = delay.div_f64(4.0).mul_f64(rand::random::<f64>());
        delay + jitter
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
