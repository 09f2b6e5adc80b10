//! # Proxy Pipeline
//!
//! The catch-all public handler for `ANY /{tunnel_id}/{rest…}`. Resolves
//! the tunnel by its first path segment, buffers the request body, frames
//! the request, and awaits the correlated response from the agent session
//! within the request timeout. Hop-by-hop headers are stripped on both
//! legs; `host` is replaced for the local origin and preserved as
//! `x-forwarded-host`; the caller's address is appended as
//! `x-forwarded-for`.

use axum::body::{to_bytes, Body};
use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::{HeaderMap, HeaderName, HeaderValue};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use std::net::SocketAddr;
use tracing::debug;

use tunnel_protocol::is_hop_by_hop;

use crate::error::ApiError;
use crate::registry::RouteError;
use crate::session::{ProxiedRequest, ProxiedResponse, SendError};
use crate::AppState;

/// First path segments that are never tunnel ids.
const RESERVED_SEGMENTS: [&str; 2] = ["api", "health"];

/// Router fallback: everything that is not a control-plane route lands
/// here and is treated as `/{tunnel_id}/{rest…}`.
pub async fn proxy_handler(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    req: Request,
) -> Response {
    match proxy_request(state, peer, req).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn proxy_request(
    state: AppState,
    peer: SocketAddr,
    req: Request,
) -> Result<Response, ApiError> {
    let (parts, body) = req.into_parts();

    let (tunnel_id, rest) =
        split_tunnel_path(parts.uri.path()).ok_or(ApiError::TunnelNotFound)?;
    if RESERVED_SEGMENTS.contains(&tunnel_id) {
        return Err(ApiError::TunnelNotFound);
    }

    let session = state.registry.attached(tunnel_id).map_err(|e| match e {
        RouteError::NotFound => ApiError::TunnelNotFound,
        RouteError::NotConnected => ApiError::TunnelNotConnected,
    })?;

    // The whole body is buffered before framing; over the cap the session
    // is never engaged.
    let body = to_bytes(body, state.config.max_body_bytes)
        .await
        .map_err(|_| ApiError::PayloadTooLarge)?;

    let request = ProxiedRequest {
        method: parts.method.as_str().to_string(),
        path: rest,
        query: parts.uri.query().unwrap_or("").to_string(),
        headers: forward_headers(&parts.headers, peer),
        body: body.to_vec(),
    };
    debug!(tunnel_id, method = %parts.method, path = %request.path, "proxying request");

    match session
        .send_request(request, state.config.request_timeout)
        .await
    {
        Ok(response) => build_response(response),
        Err(SendError::Timeout) => Err(ApiError::RequestTimeout),
        Err(SendError::SessionClosed) => Err(ApiError::UpstreamGone(
            "agent session closed before responding".into(),
        )),
        Err(SendError::Busy) => Err(ApiError::TunnelBusy),
        Err(SendError::PayloadTooLarge) => Err(ApiError::PayloadTooLarge),
        Err(SendError::Codec) => Err(ApiError::Internal("failed to frame request".into())),
    }
}

/// Splits `/{tunnel_id}/{rest…}` into the id and the remaining path with
/// its leading slash. `None` for the bare root.
fn split_tunnel_path(path: &str) -> Option<(&str, String)> {
    let trimmed = path.strip_prefix('/')?;
    if trimmed.is_empty() {
        return None;
    }
    match trimmed.split_once('/') {
        Some((id, rest)) => Some((id, format!("/{rest}"))),
        None => Some((trimmed, "/".to_string())),
    }
}

/// Flattens the inbound header map into the frame's ordered list,
/// dropping hop-by-hop headers, replacing `host`, and appending
/// forwarding headers. Duplicate keys survive as separate entries.
fn forward_headers(headers: &HeaderMap, peer: SocketAddr) -> Vec<(String, String)> {
    let mut out = Vec::with_capacity(headers.len() + 2);
    let mut original_host = None;

    for (name, value) in headers {
        let name = name.as_str();
        if is_hop_by_hop(name) || name == "content-length" {
            continue;
        }
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        if name == "host" {
            // The agent substitutes its local origin; keep the original
            // on the side.
            original_host = Some(value);
            continue;
        }
        out.push((name.to_string(), value));
    }

    if let Some(host) = original_host {
        out.push(("x-forwarded-host".to_string(), host));
    }
    out.push(("x-forwarded-for".to_string(), peer.ip().to_string()));
    out
}

/// Materializes the agent's response frame as a public HTTP response,
/// with the same hop-by-hop filtering on the way back.
fn build_response(response: ProxiedResponse) -> Result<Response, ApiError> {
    let status = StatusCode::from_u16(response.status)
        .map_err(|_| ApiError::Internal("agent returned an invalid status code".into()))?;

    let mut out = Response::builder()
        .status(status)
        .body(Body::from(response.body))
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    let headers = out.headers_mut();
    for (name, value) in response.headers {
        if is_hop_by_hop(&name) || name.eq_ignore_ascii_case("content-length") {
            continue;
        }
        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) else {
            // A header the agent relayed that is not valid HTTP; skip it
            // rather than failing the whole response.
            continue;
        };
        headers.append(name, value);
    }
    Ok(out)
}
