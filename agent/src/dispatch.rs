//! # Local Dispatch
//!
//! Executes one request frame against the configured local origin and
//! produces the response frame with the same correlation id. A local
//! failure never surfaces as a transport error: it becomes a synthetic
//! response (502 for an unreachable origin, 504 for a local timeout) with
//! a structured JSON body, so one broken request does not cost the
//! session.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::time::Duration;
use tracing::{debug, warn};

use tunnel_protocol::{self as protocol, is_hop_by_hop, Frame};

/// One request frame's fields, as received from the server.
#[derive(Debug)]
pub struct IncomingRequest {
    pub id: u64,
    pub method: String,
    pub path: String,
    pub query: String,
    pub headers: Vec<(String, String)>,
    pub body_b64: String,
}

/// Runs the request against `origin_base` (e.g. `http://127.0.0.1:3000`)
/// and returns the response frame to send back.
pub async fn dispatch(
    client: &reqwest::Client,
    origin_base: &str,
    timeout: Duration,
    request: IncomingRequest,
) -> Frame {
    let id = request.id;

    let Ok(body) = protocol::decode_body(&request.body_b64) else {
        return error_frame(id, 500, "BAD_REQUEST_BODY", "request body failed to decode");
    };
    let Ok(method) = reqwest::Method::from_bytes(request.method.as_bytes()) else {
        return error_frame(id, 500, "BAD_METHOD", "request method is not valid HTTP");
    };

    let mut url = format!("{origin_base}{}", request.path);
    if !request.query.is_empty() {
        url.push('?');
        url.push_str(&request.query);
    }
    debug!(id, %method, %url, "dispatching to local origin");

    let outcome = client
        .request(method, &url)
        .headers(request_headers(&request.headers))
        .body(body)
        .timeout(timeout)
        .send()
        .await;

    let response = match outcome {
        Ok(response) => response,
        Err(err) if err.is_timeout() => {
            warn!(id, %err, "local origin timed out");
            return error_frame(id, 504, "LOCAL_TIMEOUT", "local origin did not respond in time");
        }
        Err(err) if err.is_connect() => {
            warn!(id, %err, "local origin unreachable");
            return error_frame(id, 502, "LOCAL_UNREACHABLE", "could not connect to local origin");
        }
        Err(err) => {
            warn!(id, %err, "local origin call failed");
            return error_frame(id, 502, "LOCAL_ERROR", "local origin request failed");
        }
    };

    let status = response.status().as_u16();
    let headers = response_headers(response.headers());
    match response.bytes().await {
        Ok(bytes) => Frame::Response {
            id,
            status,
            headers,
            body_b64: protocol::encode_body(&bytes),
        },
        Err(err) => {
            warn!(id, %err, "failed reading local origin body");
            error_frame(id, 502, "LOCAL_ERROR", "failed reading local origin body")
        }
    }
}

/// Headers for the local call: hop-by-hop headers are stripped, `host`
/// and `content-length` are set by the HTTP client itself.
fn request_headers(headers: &[(String, String)]) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        if is_hop_by_hop(name)
            || name.eq_ignore_ascii_case("host")
            || name.eq_ignore_ascii_case("content-length")
        {
            continue;
        }
        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) else {
            continue;
        };
        map.append(name, value);
    }
    map
}

/// Headers for the response frame, with the same hop-by-hop filtering on
/// the way back.
fn response_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter(|(name, _)| {
            !is_hop_by_hop(name.as_str()) && name.as_str() != "content-length"
        })
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect()
}

/// Synthetic response for a locally-failed request.
fn error_frame(id: u64, status: u16, kind: &str, message: &str) -> Frame {
    let body = serde_json::json!({ "error": kind, "message": message });
    Frame::Response {
        id,
        status,
        headers: vec![("content-type".to_string(), "application/json".to_string())],
        body_b64: protocol::encode_body(body.to_string().as_bytes()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Query;
    use axum::http::HeaderMap as AxumHeaderMap;
    use axum::routing::post;
    use axum::Router;
    use std::collections::HashMap;
    use std::net::SocketAddr;

    async fn spawn_origin(app: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    fn incoming(id: u64, method: &str, path: &str, query: &str, body: &[u8]) -> IncomingRequest {
        IncomingRequest {
            id,
            method: method.into(),
            path: path.into(),
            query: query.into(),
            headers: vec![
                ("x-test".into(), "1".into()),
                ("connection".into(), "keep-alive".into()),
            ],
            body_b64: protocol::encode_body(body),
        }
    }

    #[tokio::test]
    async fn round_trips_through_the_origin() {
        let app = Router::new().route(
            "/echo",
            post(
                |Query(params): Query<HashMap<String, String>>,
                 headers: AxumHeaderMap,
                 body: axum::body::Bytes| async move {
                    assert_eq!(params.get("n").map(String::as_str), Some("42"));
                    assert_eq!(headers.get("x-test").unwrap(), "1");
                    assert!(headers.get("connection").is_none(), "hop-by-hop leaked");
                    body
                },
            ),
        );
        let addr = spawn_origin(app).await;

        let client = reqwest::Client::new();
        let frame = dispatch(
            &client,
            &format!("http://{addr}"),
            Duration::from_secs(5),
            incoming(9, "POST", "/echo", "n=42", b"payload"),
        )
        .await;

        match frame {
            Frame::Response {
                id,
                status,
                body_b64,
                ..
            } => {
                assert_eq!(id, 9);
                assert_eq!(status, 200);
                assert_eq!(protocol::decode_body(&body_b64).unwrap(), b"payload");
            }
            other => panic!("expected response frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unreachable_origin_becomes_a_synthetic_502() {
        let client = reqwest::Client::new();
        // Nothing listens here; the connect is refused immediately.
        let frame = dispatch(
            &client,
            "http://127.0.0.1:1",
            Duration::from_secs(5),
            incoming(3, "GET", "/", "", b""),
        )
        .await;

        match frame {
            Frame::Response {
                id,
                status,
                body_b64,
                ..
            } => {
                assert_eq!(id, 3);
                assert_eq!(status, 502);
                let body = protocol::decode_body(&body_b64).unwrap();
                let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
                assert_eq!(json["error"], "LOCAL_UNREACHABLE");
            }
            other => panic!("expected response frame, got {other:?}"),
        }
    }

    #[test]
    fn header_translation_strips_what_it_must() {
        let map = request_headers(&[
            ("content-type".into(), "text/plain".into()),
            ("host".into(), "public.example.com".into()),
            ("transfer-encoding".into(), "chunked".into()),
            ("content-length".into(), "12".into()),
            ("x-custom".into(), "yes".into()),
        ]);
        assert!(map.get("host").is_none());
        assert!(map.get("transfer-encoding").is_none());
        assert!(map.get("content-length").is_none());
        assert_eq!(map.get("x-custom").unwrap(), "yes");
        assert_eq!(map.get("content-type").unwrap(), "text/plain");
    }
}
