//! Execute one forwarded request against the configured local upstream.
//!
//! Every request gets a reply envelope, even on failure, so the public
//! waiter on the server side is never left hanging.

use std::collections::HashMap;

use remo_core::protocol::{RequestPayload, ResponsePayload, MAX_FRAME_BYTES};

/// Cap on the upstream response body carried back through the tunnel.
const MAX_RESPONSE_BYTES: usize = MAX_FRAME_BYTES;

/// Run `request` against `upstream`, mapping any failure to a 502 reply
/// with the error text as body.
pub(crate) async fn execute(
    http: &reqwest::Client,
    upstream: &str,
    request: &RequestPayload,
) -> ResponsePayload {
    match try_execute(http, upstream, request).await {
        Ok(mut response) => {
            response.id = request.id.clone();
            response
        }
        Err(message) => ResponsePayload {
            id: request.id.clone(),
            status: 502,
            headers: HashMap::new(),
            body: message.into_bytes(),
        },
    }
}

async fn try_execute(
    http: &reqwest::Client,
    upstream: &str,
    request: &RequestPayload,
) -> Result<ResponsePayload, String> {
    let url = format!("{}{}", upstream.trim_end_matches('/'), request.target);
    let method = reqwest::Method::from_bytes(request.method.as_bytes())
        .map_err(|e| format!("invalid method: {e}"))?;

    let mut builder = http.request(method, &url);
    for (name, values) in &request.headers {
        if skip_request_header(name) {
            continue;
        }
        for value in values {
            builder = builder.header(name.as_str(), value.as_str());
        }
    }
    if !request.body.is_empty() {
        builder = builder.body(request.body.clone());
    }

    let mut response = builder
        .send()
        .await
        .map_err(|e| format!("upstream request failed: {e}"))?;

    let status = response.status().as_u16();
    let mut headers: HashMap<String, Vec<String>> = HashMap::new();
    for (name, value) in response.headers() {
        if skip_response_header(name.as_str()) {
            continue;
        }
        if let Ok(value) = value.to_str() {
            headers
                .entry(name.as_str().to_string())
                .or_default()
                .push(value.to_string());
        }
    }

    let mut body = Vec::new();
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| format!("upstream read failed: {e}"))?
    {
        if body.len() + chunk.len() > MAX_RESPONSE_BYTES {
            return Err("upstream response body too large".to_string());
        }
        body.extend_from_slice(&chunk);
    }

    Ok(ResponsePayload {
        id: String::new(),
        status,
        headers,
        body,
    })
}

/// Headers the upstream request must not inherit from the public side.
fn skip_request_header(name: &str) -> bool {
    name.eq_ignore_ascii_case("host")
        || name.eq_ignore_ascii_case("content-length")
        || name.eq_ignore_ascii_case("connection")
        || name.eq_ignore_ascii_case("transfer-encoding")
}

/// Hop-by-hop headers that must not ride back through the tunnel.
fn skip_response_header(name: &str) -> bool {
    name.eq_ignore_ascii_case("content-length")
        || name.eq_ignore_ascii_case("connection")
        || name.eq_ignore_ascii_case("transfer-encoding")
        || name.eq_ignore_ascii_case("keep-alive")
}
