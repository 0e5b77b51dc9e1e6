//! Server wiring: owns the registry, store handle, metrics, and event
//! ring, and runs the control-plane and HTTP listeners until shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use chrono::{DateTime, Utc};
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tower::ServiceExt;
use tracing::{info, warn};

use remo_core::{RemoError, RemoResult};

use crate::config::{Config, Mode};
use crate::events::EventRing;
use crate::handshake;
use crate::metrics::Metrics;
use crate::proxy;
use crate::registry::Registry;
use crate::store::Store;

/// Bounded grace window for draining public connections on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub(crate) struct Inner {
    pub cfg: Config,
    pub registry: Registry,
    pub store: Option<Store>,
    pub metrics: Metrics,
    pub events: EventRing,
    pub admin_secret: String,
    pub started: DateTime<Utc>,
    pub shutdown: watch::Sender<bool>,
}

impl Inner {
    /// Append an audit event without blocking the caller.
    pub fn audit(&self, event: &'static str, subdomain: &str, pubkey: &str) {
        if let Some(store) = self.store.clone() {
            let subdomain = subdomain.to_string();
            let pubkey = pubkey.to_string();
            tokio::spawn(async move {
                store.log_event(event, &subdomain, &pubkey).await;
            });
        }
    }

    pub async fn snapshot(&self) -> StatusResponse {
        let subdomains = self.registry.list().await;
        let store_stats = match &self.store {
            Some(store) => store.stats().await.unwrap_or_default(),
            None => Default::default(),
        };
        let metrics = self.metrics.snapshot();
        let uptime = Utc::now().signed_duration_since(self.started);
        StatusResponse {
            domain: self.cfg.domain.clone(),
            mode: self.cfg.mode.as_str(),
            started_at: self.started,
            uptime_seconds: uptime.num_seconds().max(0),
            active_tunnels: subdomains.len(),
            subdomains,
            authorized_keys: store_stats.authorized_keys,
            reservations: store_stats.reservations,
            total_requests: metrics.total_requests,
            total_errors: metrics.total_errors,
            bytes_in: metrics.bytes_in,
            bytes_out: metrics.bytes_out,
            avg_latency_ms: metrics.avg_latency_ms,
        }
    }
}

/// JSON body of `GET /status`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub domain: String,
    pub mode: &'static str,
    pub started_at: DateTime<Utc>,
    pub uptime_seconds: i64,
    pub active_tunnels: usize,
    pub subdomains: Vec<String>,
    pub authorized_keys: u64,
    pub reservations: u64,
    pub total_requests: u64,
    pub total_errors: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub avg_latency_ms: f64,
}

pub struct Server {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server").finish_non_exhaustive()
    }
}

impl Server {
    /// Validate the configuration, resolve the admin secret, and build the
    /// server. Configuration problems are fatal here, before any listener
    /// is bound.
    pub async fn new(cfg: Config, store: Option<Store>) -> RemoResult<Self> {
        if cfg.domain.is_empty() {
            return Err(RemoError::Config("domain is required".into()));
        }
        if cfg.mode == Mode::Standalone && (cfg.tls_cert.is_none() || cfg.tls_key.is_none()) {
            return Err(RemoError::Config(
                "standalone mode requires tls cert and key".into(),
            ));
        }

        let admin_secret = resolve_admin_secret(cfg.admin_secret.clone(), store.as_ref()).await?;

        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(Inner {
                cfg,
                registry: Registry::new(),
                store,
                metrics: Metrics::new(),
                events: EventRing::default(),
                admin_secret,
                started: Utc::now(),
                shutdown,
            }),
        })
    }

    /// The front-door router, exposed for in-process tests.
    pub fn handler(&self) -> Router {
        proxy::router(self.inner.clone())
    }

    /// Signal the root cancellation: stop accepting, close every tunnel,
    /// drain HTTP within the grace window.
    pub fn shutdown(&self) {
        let _ = self.inner.shutdown.send(true);
    }

    /// Bind both listeners from the configured addresses and serve.
    pub async fn run(&self) -> RemoResult<()> {
        let control = TcpListener::bind(&self.inner.cfg.control_addr).await?;
        let http = TcpListener::bind(&self.inner.cfg.http_addr).await?;
        self.run_with_listeners(control, http).await
    }

    /// Serve on pre-bound listeners (tests bind to port 0 and pass them in).
    pub async fn run_with_listeners(
        &self,
        control: TcpListener,
        http: TcpListener,
    ) -> RemoResult<()> {
        let inner = self.inner.clone();
        info!(
            domain = %inner.cfg.domain,
            mode = inner.cfg.mode.as_str(),
            http = %local_addr(&http),
            control = %local_addr(&control),
            "server starting"
        );

        let control_task = tokio::spawn(handshake::accept_loop(inner.clone(), control));

        // Close every tunnel as soon as shutdown fires so pending
        // dispatches fail while HTTP is still draining.
        {
            let inner = inner.clone();
            tokio::spawn(async move {
                wait_shutdown(inner.shutdown.subscribe()).await;
                inner.registry.close_all().await;
            });
        }

        let app = proxy::router(inner.clone());
        let result = match inner.cfg.mode {
            Mode::BehindProxy => self.serve_plain(http, app).await,
            Mode::Standalone => self.serve_tls(http, app).await,
        };

        control_task.abort();
        self.inner.registry.close_all().await;
        info!("server stopped");
        result
    }

    async fn serve_plain(&self, listener: TcpListener, app: Router) -> RemoResult<()> {
        let graceful = wait_shutdown(self.inner.shutdown.subscribe());
        let serve = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(graceful);

        let grace = async {
            wait_shutdown(self.inner.shutdown.subscribe()).await;
            tokio::time::sleep(SHUTDOWN_GRACE).await;
        };

        tokio::select! {
            result = serve => result.map_err(RemoError::from),
            _ = grace => {
                warn!("shutdown grace window elapsed, dropping remaining connections");
                Ok(())
            }
        }
    }

    /// Standalone mode: terminate TLS ourselves, speaking HTTP/1.1 and
    /// HTTP/2 by ALPN. Each accepted connection gets its own task; the
    /// peer address is injected so `ConnectInfo` keeps working.
    async fn serve_tls(&self, listener: TcpListener, app: Router) -> RemoResult<()> {
        let cfg = &self.inner.cfg;
        let (cert, key) = match (&cfg.tls_cert, &cfg.tls_key) {
            (Some(cert), Some(key)) => (cert.clone(), key.clone()),
            _ => {
                return Err(RemoError::Config(
                    "standalone mode requires tls cert and key".into(),
                ))
            }
        };
        let tls_config = load_tls_config(&cert, &key)?;
        let acceptor = TlsAcceptor::from(Arc::new(tls_config));

        let mut shutdown = self.inner.shutdown.subscribe();
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    let acceptor = acceptor.clone();
                    let app = app.clone();
                    tokio::spawn(async move {
                        let tls_stream = match acceptor.accept(stream).await {
                            Ok(stream) => stream,
                            Err(e) => {
                                warn!(peer = %peer, error = %e, "tls handshake failed");
                                return;
                            }
                        };
                        let io = TokioIo::new(tls_stream);
                        let service = hyper::service::service_fn(move |req: hyper::Request<Incoming>| {
                            let app = app.clone();
                            async move {
                                let (mut parts, body) = req.into_parts();
                                parts
                                    .extensions
                                    .insert(axum::extract::ConnectInfo(peer));
                                let req =
                                    axum::extract::Request::from_parts(parts, axum::body::Body::new(body));
                                app.oneshot(req).await
                            }
                        });
                        if let Err(e) = AutoBuilder::new(TokioExecutor::new())
                            .serve_connection(io, service)
                            .await
                        {
                            warn!(peer = %peer, error = %e, "connection error");
                        }
                    });
                }
            }
        }
        // Bounded grace for the connection tasks still in flight.
        tokio::time::sleep(SHUTDOWN_GRACE).await;
        Ok(())
    }
}

/// Resolve the admin secret: explicit config, then the store's
/// `admin_secret` setting, then a fresh 32-byte random persisted to the
/// store. No store and no explicit secret is a startup failure.
async fn resolve_admin_secret(explicit: Option<String>, store: Option<&Store>) -> RemoResult<String> {
    if let Some(secret) = explicit {
        if secret.is_empty() {
            return Err(RemoError::Config("admin secret must not be empty".into()));
        }
        return Ok(secret);
    }
    let Some(store) = store else {
        return Err(RemoError::Config(
            "admin secret required when no state store is configured".into(),
        ));
    };
    if let Some(secret) = store
        .get_setting("admin_secret")
        .await
        .map_err(|e| RemoError::Store(e.to_string()))?
    {
        return Ok(secret);
    }

    use rand::Rng;
    let mut raw = [0u8; 32];
    rand::thread_rng().fill(&mut raw[..]);
    let secret = hex::encode(raw);
    store
        .set_setting("admin_secret", &secret)
        .await
        .map_err(|e| RemoError::Store(e.to_string()))?;
    info!("generated admin secret on first boot");
    Ok(secret)
}

/// Wait for the shutdown flag, robust to subscribing after the send.
async fn wait_shutdown(mut rx: watch::Receiver<bool>) {
    if *rx.borrow() {
        return;
    }
    let _ = rx.changed().await;
}

fn local_addr(listener: &TcpListener) -> String {
    listener
        .local_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "?".into())
}

fn load_tls_config(
    cert_path: &std::path::Path,
    key_path: &std::path::Path,
) -> RemoResult<rustls::ServerConfig> {
    // More than one rustls crypto provider ends up in the dependency graph,
    // so the process default must be pinned before the first builder call.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let cert_pem = std::fs::read(cert_path).map_err(|e| {
        RemoError::Config(format!("cannot read cert {}: {e}", cert_path.display()))
    })?;
    let key_pem = std::fs::read(key_path)
        .map_err(|e| RemoError::Config(format!("cannot read key {}: {e}", key_path.display())))?;

    let certs: Vec<rustls::pki_types::CertificateDer<'static>> =
        rustls_pemfile::certs(&mut &cert_pem[..])
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| RemoError::Config(format!("invalid cert pem: {e}")))?;
    let key = rustls_pemfile::private_key(&mut &key_pem[..])
        .map_err(|e| RemoError::Config(format!("invalid key pem: {e}")))?
        .ok_or_else(|| RemoError::Config("no private key found in PEM".into()))?;

    let mut tls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| RemoError::Config(format!("tls config: {e}")))?;
    tls_config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(tls_config)
}

/// Build a bare `Inner` for in-crate tests without going through
/// `Server::new`'s secret resolution.
#[cfg(test)]
pub(crate) fn test_inner(cfg: Config, store: Option<Store>) -> Arc<Inner> {
    let (shutdown, _) = watch::channel(false);
    Arc::new(Inner {
        cfg,
        registry: Registry::new(),
        store,
        metrics: Metrics::new(),
        events: EventRing::default(),
        admin_secret: "secret".into(),
        started: Utc::now(),
        shutdown,
    })
}
