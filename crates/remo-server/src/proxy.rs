//! The HTTP front door: routes public requests to tunnels by Host,
//! rewrites forwarding headers with a trust-aware policy, and serves the
//! admin read surface.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{ConnectInfo, Host, Request, State};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use chrono::Utc;
use http::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use http::StatusCode;
use ipnet::IpNet;
use subtle::ConstantTimeEq;
use tracing::{debug, error, warn};

use remo_core::protocol::{RequestPayload, MAX_FRAME_BYTES};

use crate::config::Mode;
use crate::events::RequestEvent;
use crate::server::Inner;

/// Maximum accepted public request body. Larger bodies are rejected, not
/// truncated.
const MAX_BODY_BYTES: usize = MAX_FRAME_BYTES;

/// Marker header distinguishing server-originated gateway failures.
const ERROR_HEADER: &str = "x-remo-error";

pub(crate) fn router(inner: Arc<Inner>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/status", get(status))
        .route("/metrics", get(metrics))
        .route("/events", get(events))
        .fallback(proxy)
        .with_state(inner)
}

// ── Public proxy path ────────────────────────────────────────────────

async fn proxy(
    State(inner): State<Arc<Inner>>,
    Host(host): Host,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request,
) -> Response {
    let start = Instant::now();

    let Some(subdomain) = extract_subdomain(&host, &inner.cfg.routing_domain()) else {
        return plain_error(StatusCode::BAD_REQUEST, "missing subdomain");
    };

    let trusted = trusted_proxy(peer.ip(), &inner.cfg.trusted_proxies);
    if trusted && !hops_within_limit(request.headers(), inner.cfg.trusted_hops) {
        return plain_error(StatusCode::BAD_REQUEST, "too many proxy hops");
    }

    let (parts, body) = request.into_parts();
    let method = parts.method.as_str().to_string();
    let target = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let remote = peer.ip().to_string();

    debug!(subdomain, method, target, remote, "incoming request");

    let Some(tunnel) = inner.registry.get(&subdomain).await else {
        warn!(subdomain, "tunnel not found for subdomain");
        record(&inner, &subdomain, &method, &target, 502, start, &remote, 0, 0, true);
        let mut response = plain_error(StatusCode::BAD_GATEWAY, "tunnel not available");
        response.headers_mut().insert(
            HeaderName::from_static(ERROR_HEADER),
            HeaderValue::from_static("no-tunnel"),
        );
        return response;
    };

    let body = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(_) => {
            record(&inner, &subdomain, &method, &target, 400, start, &remote, 0, 0, true);
            return plain_error(StatusCode::BAD_REQUEST, "request body too large");
        }
    };
    let bytes_in = body.len() as u64;

    let payload = RequestPayload {
        id: String::new(),
        method: method.clone(),
        target: target.clone(),
        headers: forward_headers(&parts.headers, peer.ip(), trusted, inner.cfg.mode, &subdomain),
        body: body.to_vec(),
    };

    let reply = match tunnel.dispatch(payload, inner.cfg.read_timeout).await {
        Ok(reply) => reply,
        Err(e) => {
            error!(subdomain, error = %e, "dispatch failed");
            record(&inner, &subdomain, &method, &target, 502, start, &remote, bytes_in, 0, true);
            return plain_error(StatusCode::BAD_GATEWAY, "tunnel dispatch failed");
        }
    };

    let bytes_out = reply.body.len() as u64;
    let status = StatusCode::from_u16(reply.status).unwrap_or(StatusCode::BAD_GATEWAY);
    debug!(
        subdomain,
        status = status.as_u16(),
        latency = ?start.elapsed(),
        "request completed"
    );
    record(
        &inner,
        &subdomain,
        &method,
        &target,
        status.as_u16(),
        start,
        &remote,
        bytes_in,
        bytes_out,
        status.is_server_error(),
    );

    let mut response = Response::new(Body::from(reply.body));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    for (name, values) in &reply.headers {
        let Ok(name) = HeaderName::try_from(name.as_str()) else {
            continue;
        };
        for value in values {
            if let Ok(value) = HeaderValue::try_from(value.as_str()) {
                headers.append(name.clone(), value);
            }
        }
    }
    response
}

#[allow(clippy::too_many_arguments)]
fn record(
    inner: &Inner,
    subdomain: &str,
    method: &str,
    path: &str,
    status: u16,
    start: Instant,
    remote: &str,
    bytes_in: u64,
    bytes_out: u64,
    failed: bool,
) {
    let latency = start.elapsed();
    inner.metrics.record(subdomain, bytes_in, bytes_out, latency, failed);
    inner.events.record(RequestEvent {
        time: Utc::now(),
        method: method.to_string(),
        path: path.to_string(),
        status,
        latency_ms: latency.as_millis() as u64,
        remote: remote.to_string(),
        bytes_in,
        bytes_out,
    });
}

/// Pull the tunnel subdomain out of a Host header value.
///
/// The port is stripped, the routing domain must follow a literal dot, and
/// the *last* label of whatever remains is the subdomain, so
/// `deep.sub.example.test` routes to `sub`.
pub(crate) fn extract_subdomain(host: &str, routing_domain: &str) -> Option<String> {
    let host = host.trim();
    let host = host.split(':').next().unwrap_or(host);
    let labels = host.strip_suffix(routing_domain)?;
    let labels = labels.strip_suffix('.')?;
    let subdomain = labels.rsplit('.').next()?;
    if subdomain.is_empty() {
        return None;
    }
    Some(subdomain.to_string())
}

/// Whether the direct peer is one of the operator's trusted proxies.
pub(crate) fn trusted_proxy(peer: IpAddr, trusted: &[IpNet]) -> bool {
    trusted.iter().any(|net| net.contains(&peer))
}

/// Accept at most `limit` comma-separated entries in `X-Forwarded-For`.
pub(crate) fn hops_within_limit(headers: &HeaderMap, limit: usize) -> bool {
    let Some(forwarded) = header_str(headers, "x-forwarded-for") else {
        return true;
    };
    if forwarded.is_empty() {
        return true;
    }
    forwarded.split(',').count() <= limit
}

/// Clone the public request headers and rewrite the forwarding set.
///
/// `X-Forwarded-For` is appended only when the peer is trusted and a prior
/// value exists; otherwise it is replaced by the peer address.
pub(crate) fn forward_headers(
    headers: &HeaderMap,
    peer: IpAddr,
    trusted: bool,
    mode: Mode,
    subdomain: &str,
) -> HashMap<String, Vec<String>> {
    let mut out: HashMap<String, Vec<String>> = HashMap::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            out.entry(name.as_str().to_string())
                .or_default()
                .push(value.to_string());
        }
    }
    // The rewritten set replaces whatever the peer sent.
    out.remove("x-forwarded-for");
    out.remove("x-forwarded-proto");
    out.remove("x-remo-subdomain");

    let peer = peer.to_string();
    let forwarded_for = match header_str(headers, "x-forwarded-for") {
        Some(prior) if trusted && !prior.is_empty() => format!("{prior}, {peer}"),
        _ => peer,
    };
    out.insert("X-Forwarded-For".to_string(), vec![forwarded_for]);

    let proto = match mode {
        Mode::Standalone => "https".to_string(),
        Mode::BehindProxy => match header_str(headers, "x-forwarded-proto") {
            Some(prior) if trusted && !prior.is_empty() => prior.to_string(),
            _ => "http".to_string(),
        },
    };
    out.insert("X-Forwarded-Proto".to_string(), vec![proto]);
    out.insert("X-Remo-Subdomain".to_string(), vec![subdomain.to_string()]);
    out
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

// ── Admin surface ────────────────────────────────────────────────────

async fn healthz() -> &'static str {
    "ok"
}

async fn status(State(inner): State<Arc<Inner>>, headers: HeaderMap) -> Response {
    if !authorize_admin(&headers, &inner.admin_secret) {
        return plain_error(StatusCode::UNAUTHORIZED, "unauthorized");
    }
    Json(inner.snapshot().await).into_response()
}

async fn metrics(State(inner): State<Arc<Inner>>, headers: HeaderMap) -> Response {
    if !authorize_admin(&headers, &inner.admin_secret) {
        return plain_error(StatusCode::UNAUTHORIZED, "unauthorized");
    }
    let snapshot = inner.snapshot().await;
    let mut body = String::new();
    let _ = writeln!(body, "remo_active_tunnels {}", snapshot.active_tunnels);
    let _ = writeln!(body, "remo_authorized_keys {}", snapshot.authorized_keys);
    let _ = writeln!(body, "remo_reservations {}", snapshot.reservations);
    let _ = writeln!(body, "remo_requests_total {}", snapshot.total_requests);
    let _ = writeln!(body, "remo_errors_total {}", snapshot.total_errors);
    let _ = writeln!(body, "remo_bytes_in_total {}", snapshot.bytes_in);
    let _ = writeln!(body, "remo_bytes_out_total {}", snapshot.bytes_out);
    let _ = writeln!(body, "remo_request_latency_ms_avg {}", snapshot.avg_latency_ms);
    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response()
}

/// The request-event ring, for the local dashboard. Loopback peers only.
async fn events(
    State(inner): State<Arc<Inner>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> Response {
    if !peer.ip().is_loopback() {
        return plain_error(StatusCode::FORBIDDEN, "forbidden");
    }
    Json(inner.events.snapshot()).into_response()
}

/// Constant-time bearer comparison. An empty configured secret denies
/// everything.
pub(crate) fn authorize_admin(headers: &HeaderMap, secret: &str) -> bool {
    if secret.is_empty() {
        return false;
    }
    let Some(value) = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) else {
        return false;
    };
    let Some(token) = value.strip_prefix("Bearer ") else {
        return false;
    };
    token.trim().as_bytes().ct_eq(secret.as_bytes()).into()
}

fn plain_error(status: StatusCode, message: &'static str) -> Response {
    (status, message).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::server::test_inner;
    use tower::ServiceExt;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(
                HeaderName::try_from(*name).unwrap(),
                HeaderValue::try_from(*value).unwrap(),
            );
        }
        map
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn subdomain_extraction() {
        let cases = [
            ("foo.example.test", Some("foo")),
            ("foo.example.test:443", Some("foo")),
            ("deep.sub.example.test", Some("sub")),
            ("example.test", None),
            ("other.example.com", None),
            ("", None),
            (".example.test", None),
        ];
        for (host, expected) in cases {
            assert_eq!(
                extract_subdomain(host, "example.test").as_deref(),
                expected,
                "host {host:?}"
            );
        }
    }

    #[test]
    fn subdomain_extraction_with_prefix() {
        assert_eq!(
            extract_subdomain("foo.tun.example.test", "tun.example.test").as_deref(),
            Some("foo")
        );
        assert_eq!(extract_subdomain("foo.example.test", "tun.example.test"), None);
    }

    #[test]
    fn forward_headers_standalone() {
        let rewritten = forward_headers(
            &headers(&[]),
            ip("1.2.3.4"),
            false,
            Mode::Standalone,
            "foo",
        );
        assert_eq!(rewritten["X-Forwarded-Proto"], vec!["https"]);
        assert_eq!(rewritten["X-Forwarded-For"], vec!["1.2.3.4"]);
        assert_eq!(rewritten["X-Remo-Subdomain"], vec!["foo"]);
    }

    #[test]
    fn forward_headers_trusted_proxy_appends() {
        let incoming = headers(&[
            ("x-forwarded-for", "10.0.0.1"),
            ("x-forwarded-proto", "https"),
        ]);
        let rewritten = forward_headers(&incoming, ip("127.0.0.1"), true, Mode::BehindProxy, "bar");
        assert_eq!(rewritten["X-Forwarded-For"], vec!["10.0.0.1, 127.0.0.1"]);
        assert_eq!(rewritten["X-Forwarded-Proto"], vec!["https"]);
    }

    #[test]
    fn forward_headers_untrusted_peer_is_overwritten() {
        let incoming = headers(&[("x-forwarded-for", "spoofed")]);
        let rewritten = forward_headers(&incoming, ip("10.0.0.1"), false, Mode::BehindProxy, "foo");
        assert_eq!(rewritten["X-Forwarded-For"], vec!["10.0.0.1"]);
        assert_eq!(rewritten["X-Forwarded-Proto"], vec!["http"]);
        assert!(!rewritten.contains_key("x-forwarded-for"));
    }

    #[test]
    fn trusted_proxy_predicate() {
        let nets = vec!["127.0.0.0/8".parse().unwrap(), "10.1.0.0/16".parse().unwrap()];
        assert!(trusted_proxy(ip("127.0.0.1"), &nets));
        assert!(trusted_proxy(ip("10.1.2.3"), &nets));
        assert!(!trusted_proxy(ip("10.2.0.1"), &nets));
        assert!(!trusted_proxy(ip("8.8.8.8"), &nets));
        assert!(!trusted_proxy(ip("127.0.0.1"), &[]));
    }

    #[test]
    fn hop_limit() {
        assert!(hops_within_limit(&headers(&[]), 1));
        assert!(hops_within_limit(&headers(&[("x-forwarded-for", "a")]), 1));
        assert!(!hops_within_limit(&headers(&[("x-forwarded-for", "a, b")]), 1));
        assert!(hops_within_limit(&headers(&[("x-forwarded-for", "a, b")]), 2));
        // A zero limit rejects any forwarded chain but not direct requests.
        assert!(hops_within_limit(&headers(&[]), 0));
        assert!(!hops_within_limit(&headers(&[("x-forwarded-for", "a")]), 0));
    }

    #[test]
    fn admin_authorization() {
        assert!(!authorize_admin(&headers(&[]), "secret"));
        assert!(!authorize_admin(&headers(&[("authorization", "Bearer anything")]), ""));
        assert!(!authorize_admin(&headers(&[("authorization", "Basic secret")]), "secret"));
        assert!(!authorize_admin(&headers(&[("authorization", "Bearer wrong")]), "secret"));
        assert!(authorize_admin(&headers(&[("authorization", "Bearer secret")]), "secret"));
        assert!(authorize_admin(&headers(&[("authorization", "Bearer  secret ")]), "secret"));
    }

    // ── Router-level checks ──────────────────────────────────────────

    fn request(host: &str, path: &str, peer: &str) -> Request {
        Request::builder()
            .uri(path)
            .header("host", host)
            .extension(ConnectInfo::<SocketAddr>(peer.parse().unwrap()))
            .body(Body::empty())
            .unwrap()
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8_lossy(&bytes).to_string()
    }

    #[tokio::test]
    async fn healthz_is_unauthenticated() {
        let app = router(test_inner(Config::new("example.test"), None));
        let response = app
            .oneshot(request("example.test", "/healthz", "9.9.9.9:1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "ok");
    }

    #[tokio::test]
    async fn status_requires_bearer() {
        let inner = test_inner(Config::new("example.test"), None);
        let app = router(inner);

        let response = app
            .clone()
            .oneshot(request("example.test", "/status", "9.9.9.9:1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let mut authed = request("example.test", "/status", "9.9.9.9:1");
        authed
            .headers_mut()
            .insert("authorization", HeaderValue::from_static("Bearer secret"));
        let response = app.oneshot(authed).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_text(response).await;
        assert!(body.contains("\"domain\":\"example.test\""));
    }

    #[tokio::test]
    async fn unknown_subdomain_gets_marker_header() {
        let app = router(test_inner(Config::new("example.test"), None));
        let response = app
            .oneshot(request("ghost.example.test", "/", "9.9.9.9:1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            response.headers().get(ERROR_HEADER).unwrap(),
            "no-tunnel"
        );
        assert_eq!(body_text(response).await, "tunnel not available");
    }

    #[tokio::test]
    async fn host_outside_apex_is_bad_request() {
        let app = router(test_inner(Config::new("example.test"), None));
        let response = app
            .oneshot(request("other.example.com", "/", "9.9.9.9:1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_text(response).await, "missing subdomain");
    }

    #[tokio::test]
    async fn too_many_hops_from_trusted_proxy() {
        let mut cfg = Config::new("example.test");
        cfg.trusted_proxies = vec!["127.0.0.0/8".parse().unwrap()];
        cfg.trusted_hops = 1;
        let app = router(test_inner(cfg, None));

        let mut req = request("foo.example.test", "/", "127.0.0.1:9");
        req.headers_mut().insert(
            "x-forwarded-for",
            HeaderValue::from_static("10.0.0.1, 10.0.0.2"),
        );
        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_text(response).await, "too many proxy hops");
    }

    #[tokio::test]
    async fn zero_hop_limit_rejects_any_forwarded_chain() {
        let mut cfg = Config::new("example.test");
        cfg.trusted_proxies = vec!["127.0.0.0/8".parse().unwrap()];
        cfg.trusted_hops = 0;
        let app = router(test_inner(cfg, None));

        let mut req = request("foo.example.test", "/", "127.0.0.1:9");
        req.headers_mut()
            .insert("x-forwarded-for", HeaderValue::from_static("10.0.0.1"));
        let response = app.clone().oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_text(response).await, "too many proxy hops");

        // Without a forwarded chain the request proceeds to tunnel lookup.
        let response = app
            .oneshot(request("foo.example.test", "/", "127.0.0.1:9"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn events_is_loopback_only() {
        let inner = test_inner(Config::new("example.test"), None);
        let app = router(inner);

        let response = app
            .clone()
            .oneshot(request("example.test", "/events", "9.9.9.9:1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = app
            .oneshot(request("example.test", "/events", "127.0.0.1:1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "[]");
    }
}
