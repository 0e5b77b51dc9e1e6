//! Per-client tunnel: multiplexes many in-flight public requests over one
//! control link and correlates replies by request id.
//!
//! Lock order: the inflight map mutex is never held across a link write;
//! link writes are serialized by their own mutex so frames never interleave.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{oneshot, watch, Mutex};
use tracing::{debug, info, warn};

use remo_core::protocol::{self, Envelope, EnvelopeKind, RequestPayload, ResponsePayload};
use remo_core::RemoError;

/// Read half of a control link.
pub type LinkReader = Box<dyn AsyncRead + Send + Unpin>;
/// Write half of a control link.
pub type LinkWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Liveness probe cadence. Bounds half-open detection to roughly this
/// interval plus one round trip.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
/// Deadline for a single keepalive write.
const KEEPALIVE_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// A live, authenticated client session.
pub struct Tunnel {
    subdomain: String,
    public_key: String,
    writer: Mutex<LinkWriter>,
    inflight: Mutex<HashMap<String, oneshot::Sender<ResponsePayload>>>,
    counter: AtomicU64,
    closing: AtomicBool,
    closed_tx: watch::Sender<bool>,
    created_at: Instant,
    last_ping: StdMutex<Instant>,
}

impl Tunnel {
    pub fn new(subdomain: impl Into<String>, public_key: impl Into<String>, writer: LinkWriter) -> Self {
        let (closed_tx, _) = watch::channel(false);
        Self {
            subdomain: subdomain.into(),
            public_key: public_key.into(),
            writer: Mutex::new(writer),
            inflight: Mutex::new(HashMap::new()),
            counter: AtomicU64::new(0),
            closing: AtomicBool::new(false),
            closed_tx,
            created_at: Instant::now(),
            last_ping: StdMutex::new(Instant::now()),
        }
    }

    pub fn subdomain(&self) -> &str {
        &self.subdomain
    }

    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// A receiver that resolves when the tunnel enters the close path.
    pub fn subscribe_closed(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }

    /// When the last successful keepalive probe completed.
    pub fn last_ping(&self) -> Instant {
        *self.last_ping.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn next_request_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}-{}", self.subdomain, n)
    }

    /// Send one public request through the tunnel and await its reply.
    ///
    /// Exactly one of three things happens to the waiter: the matching
    /// response arrives, the deadline expires, or the tunnel closes.
    pub async fn dispatch(
        &self,
        mut request: RequestPayload,
        deadline: Duration,
    ) -> Result<ResponsePayload, RemoError> {
        if self.is_closing() {
            return Err(RemoError::TunnelClosed);
        }

        let id = self.next_request_id();
        request.id = id.clone();

        let (tx, rx) = oneshot::channel();
        self.inflight.lock().await.insert(id.clone(), tx);

        // Re-check: a close racing the insert above would otherwise leave
        // this sink stranded in a dead map.
        if self.is_closing() {
            self.remove_inflight(&id).await;
            return Err(RemoError::TunnelClosed);
        }

        let envelope = Envelope::request(request);
        {
            let mut writer = self.writer.lock().await;
            if let Err(e) = protocol::write_envelope(&mut *writer, &envelope).await {
                drop(writer);
                self.remove_inflight(&id).await;
                return Err(RemoError::Transport(e.to_string()));
            }
        }

        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(response)) => Ok(response),
            // Sender dropped: the close path drained the inflight map.
            Ok(Err(_)) => Err(RemoError::TunnelClosed),
            Err(_) => {
                self.remove_inflight(&id).await;
                Err(RemoError::Timeout)
            }
        }
    }

    async fn remove_inflight(&self, id: &str) {
        self.inflight.lock().await.remove(id);
    }

    /// Best-effort error envelope to the peer, for rejections that happen
    /// after the link has been handed to the tunnel.
    pub(crate) async fn send_error(&self, reason: &str) {
        let envelope = Envelope::error(reason);
        let mut writer = self.writer.lock().await;
        let _ = protocol::write_envelope(&mut *writer, &envelope).await;
    }

    /// Read envelopes off the link until it errors or the tunnel closes.
    /// Any read error is fatal to the tunnel.
    pub async fn run_reader(self: std::sync::Arc<Self>, mut reader: LinkReader) {
        let mut closed = self.subscribe_closed();
        loop {
            tokio::select! {
                _ = closed.changed() => return,
                result = protocol::read_envelope(&mut reader) => match result {
                    Ok(envelope) => self.handle_envelope(envelope).await,
                    Err(e) => {
                        self.close(Some(&e.to_string())).await;
                        return;
                    }
                },
            }
        }
    }

    async fn handle_envelope(&self, envelope: Envelope) {
        match envelope.kind {
            EnvelopeKind::Response => {
                let Some(response) = envelope.response else {
                    return;
                };
                let sink = self.inflight.lock().await.remove(&response.id);
                match sink {
                    Some(tx) => {
                        let _ = tx.send(response);
                    }
                    // Late reply after the waiter timed out.
                    None => debug!(subdomain = %self.subdomain, id = %response.id, "discarding unmatched response"),
                }
            }
            // Unknown and non-response kinds are ignored on an established
            // tunnel for forward compatibility.
            _ => {}
        }
    }

    /// Probe the link every 30 s; a failed or stalled write closes the tunnel.
    pub async fn run_keepalive(self: std::sync::Arc<Self>) {
        let mut ticker = tokio::time::interval(KEEPALIVE_INTERVAL);
        ticker.tick().await; // consume the immediate first tick
        let mut closed = self.subscribe_closed();
        loop {
            tokio::select! {
                _ = closed.changed() => return,
                _ = ticker.tick() => {
                    let ping = Envelope::ping();
                    let result = {
                        let mut writer = self.writer.lock().await;
                        tokio::time::timeout(
                            KEEPALIVE_WRITE_TIMEOUT,
                            protocol::write_envelope(&mut *writer, &ping),
                        )
                        .await
                    };
                    match result {
                        Ok(Ok(())) => {
                            *self.last_ping.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
                        }
                        _ => {
                            self.close(Some("keepalive failed")).await;
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Enter the close path: runs at most once, from any task. Wakes every
    /// outstanding waiter with a tunnel-closed failure and shuts the link.
    pub async fn close(&self, reason: Option<&str>) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.closed_tx.send(true);

        // Dropping the senders wakes every pending dispatch.
        self.inflight.lock().await.clear();

        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
        drop(writer);

        match reason {
            Some(reason) => warn!(
                subdomain = %self.subdomain,
                reason,
                lived = ?self.created_at.elapsed(),
                "tunnel closed"
            ),
            None => info!(
                subdomain = %self.subdomain,
                lived = ?self.created_at.elapsed(),
                "tunnel closed"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::task::JoinSet;

    /// A tunnel wired to an in-memory link, plus the peer's halves.
    fn harness() -> (Arc<Tunnel>, LinkReader, LinkWriter) {
        let (near, far) = tokio::io::duplex(256 * 1024);
        let (far_read, far_write) = tokio::io::split(far);
        let (near_read, near_write) = tokio::io::split(near);

        let tunnel = Arc::new(Tunnel::new("demo", "key", Box::new(far_write)));
        tokio::spawn(tunnel.clone().run_reader(Box::new(far_read)));
        (tunnel, Box::new(near_read), Box::new(near_write))
    }

    /// Echo peer: replies to every request with `OK-<body>`.
    async fn echo_peer(mut reader: LinkReader, mut writer: LinkWriter) {
        while let Ok(envelope) = protocol::read_envelope(&mut reader).await {
            if envelope.kind != EnvelopeKind::Request {
                continue;
            }
            let request = envelope.request.unwrap();
            let mut body = b"OK-".to_vec();
            body.extend_from_slice(&request.body);
            let reply = Envelope::response(ResponsePayload {
                id: request.id,
                status: 200,
                headers: HashMap::new(),
                body,
            });
            if protocol::write_envelope(&mut writer, &reply).await.is_err() {
                return;
            }
        }
    }

    #[tokio::test]
    async fn dispatch_correlates_concurrent_requests() {
        let (tunnel, peer_read, peer_write) = harness();
        tokio::spawn(echo_peer(peer_read, peer_write));

        let mut tasks = JoinSet::new();
        for i in 0..100u32 {
            let tunnel = tunnel.clone();
            tasks.spawn(async move {
                let request = RequestPayload {
                    method: "GET".into(),
                    target: format!("/{i}"),
                    body: format!("b{i}").into_bytes(),
                    ..Default::default()
                };
                let response = tunnel.dispatch(request, Duration::from_secs(5)).await.unwrap();
                (i, response)
            });
        }

        let mut seen = 0;
        while let Some(result) = tasks.join_next().await {
            let (i, response) = result.unwrap();
            assert_eq!(response.status, 200);
            assert_eq!(response.body, format!("OK-b{i}").into_bytes());
            seen += 1;
        }
        assert_eq!(seen, 100);
    }

    #[tokio::test]
    async fn request_ids_are_monotonic_per_tunnel() {
        let (tunnel, mut peer_read, mut peer_write) = harness();

        let dispatcher = tunnel.clone();
        tokio::spawn(async move {
            for _ in 0..3 {
                let _ = dispatcher
                    .dispatch(RequestPayload::default(), Duration::from_secs(1))
                    .await;
            }
        });

        for expected in ["demo-1", "demo-2", "demo-3"] {
            let envelope = protocol::read_envelope(&mut peer_read).await.unwrap();
            let request = envelope.request.unwrap();
            assert_eq!(request.id, expected);
            let reply = Envelope::response(ResponsePayload {
                id: request.id,
                status: 204,
                ..Default::default()
            });
            protocol::write_envelope(&mut peer_write, &reply).await.unwrap();
        }
    }

    #[tokio::test]
    async fn close_wakes_all_pending_dispatches() {
        let (tunnel, _peer_read, _peer_write) = harness();

        let mut tasks = JoinSet::new();
        for _ in 0..10 {
            let tunnel = tunnel.clone();
            tasks.spawn(async move {
                tunnel
                    .dispatch(RequestPayload::default(), Duration::from_secs(30))
                    .await
            });
        }

        // Let the dispatches write their envelopes and park on their sinks.
        tokio::time::sleep(Duration::from_millis(50)).await;
        tunnel.close(Some("test")).await;

        while let Some(result) = tasks.join_next().await {
            assert!(matches!(result.unwrap(), Err(RemoError::TunnelClosed)));
        }
    }

    #[tokio::test]
    async fn dispatch_after_close_fails_fast() {
        let (tunnel, _peer_read, _peer_write) = harness();
        tunnel.close(None).await;
        let err = tunnel
            .dispatch(RequestPayload::default(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, RemoError::TunnelClosed));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (tunnel, _peer_read, _peer_write) = harness();
        tunnel.close(None).await;
        tunnel.close(Some("again")).await;
        assert!(tunnel.is_closing());
    }

    #[tokio::test]
    async fn late_response_is_discarded() {
        let (tunnel, mut peer_read, mut peer_write) = harness();

        let err = tunnel
            .dispatch(RequestPayload::default(), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, RemoError::Timeout));

        // Reply after the waiter gave up; the reader must not fall over.
        let envelope = protocol::read_envelope(&mut peer_read).await.unwrap();
        let id = envelope.request.unwrap().id;
        let reply = Envelope::response(ResponsePayload {
            id,
            status: 200,
            ..Default::default()
        });
        protocol::write_envelope(&mut peer_write, &reply).await.unwrap();

        // The tunnel is still serviceable for the next dispatch.
        let dispatcher = tunnel.clone();
        let pending = tokio::spawn(async move {
            dispatcher
                .dispatch(RequestPayload::default(), Duration::from_secs(1))
                .await
        });
        let envelope = protocol::read_envelope(&mut peer_read).await.unwrap();
        let id = envelope.request.unwrap().id;
        protocol::write_envelope(
            &mut peer_write,
            &Envelope::response(ResponsePayload {
                id,
                status: 201,
                ..Default::default()
            }),
        )
        .await
        .unwrap();
        assert_eq!(pending.await.unwrap().unwrap().status, 201);
    }

    #[tokio::test]
    async fn peer_disconnect_closes_tunnel() {
        let (tunnel, peer_read, peer_write) = harness();
        drop(peer_read);
        drop(peer_write);

        let err = tunnel
            .dispatch(RequestPayload::default(), Duration::from_secs(1))
            .await;
        // Either the write fails or the sink is drained by the close path.
        assert!(err.is_err());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(tunnel.is_closing());
    }
}
