//! # Transport Session
//!
//! One [`Session`] per attached agent. It owns the pending-request table
//! that pairs proxied requests with the response frames the agent sends
//! back, and the bounded outbound queue drained by the connection's write
//! pump. The WebSocket pumps themselves live in [`crate::handlers`]; this
//! module is transport-agnostic and fully unit-testable.
//!
//! Shutdown is a one-shot transition: the first caller of [`Session::close`]
//! records the cause, fires the cancellation token, and clears the pending
//! table, which resolves every outstanding waiter with `SessionClosed`.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tunnel_protocol::{self as protocol, CloseKind, Frame};

/// Capacity of the outbound frame queue. Bounded so a slow agent applies
/// backpressure to callers instead of growing server memory; a full queue
/// makes `send_request` wait, up to its deadline.
pub const OUTBOUND_QUEUE_FRAMES: usize = 64;

/// A public request, fully buffered, ready to be framed.
#[derive(Debug, Clone)]
pub struct ProxiedRequest {
    pub method: String,
    pub path: String,
    pub query: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// The agent's fully-buffered answer to one [`ProxiedRequest`].
#[derive(Debug)]
pub struct ProxiedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// Ways `send_request` can fail without a response.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SendError {
    /// The deadline fired first. The waiter is gone; a response arriving
    /// later is dropped and counted.
    #[error("request timed out")]
    Timeout,

    /// The session terminated before (or while) the request was in flight.
    #[error("session closed")]
    SessionClosed,

    /// The per-session in-flight cap is reached.
    #[error("too many requests in flight")]
    Busy,

    /// The encoded request frame would exceed the frame size limit.
    #[error("request frame too large")]
    PayloadTooLarge,

    /// The frame failed to serialize. Not expected for well-formed input.
    #[error("request frame failed to encode")]
    Codec,
}

/// State for one live agent connection.
#[derive(Debug)]
pub struct Session {
    tunnel_id: String,

    /// Process-unique number identifying this session in the registry, so
    /// a stale detach cannot remove a newer session for the same tunnel.
    seq: u64,

    /// Pre-encoded frames waiting for the write pump. Only the pump writes
    /// to the socket, which keeps frame bytes atomic per frame.
    outbound: mpsc::Sender<String>,

    /// Correlation id → single-shot completion slot.
    pending: DashMap<u64, oneshot::Sender<ProxiedResponse>>,

    next_correlation: AtomicU64,
    max_inflight: usize,
    max_frame_bytes: usize,

    cancel: CancellationToken,
    close_cause: OnceLock<CloseKind>,

    /// Responses that arrived after their waiter was gone.
    late_responses: AtomicU64,

    /// Pings sent since the last pong.
    heartbeat_misses: AtomicU32,
}

impl Session {
    pub fn new(
        tunnel_id: &str,
        seq: u64,
        outbound: mpsc::Sender<String>,
        max_inflight: usize,
        max_frame_bytes: usize,
    ) -> Arc<Self> {
        Arc::new(Session {
            tunnel_id: tunnel_id.to_string(),
            seq,
            outbound,
            pending: DashMap::new(),
            next_correlation: AtomicU64::new(1),
            max_inflight,
            max_frame_bytes,
            cancel: CancellationToken::new(),
            close_cause: OnceLock::new(),
            late_responses: AtomicU64::new(0),
            heartbeat_misses: AtomicU32::new(0),
        })
    }

    pub fn tunnel_id(&self) -> &str {
        &self.tunnel_id
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Token the pumps listen on; fires once when the session closes.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn close_cause(&self) -> Option<CloseKind> {
        self.close_cause.get().copied()
    }

    pub fn late_responses(&self) -> u64 {
        self.late_responses.load(Ordering::Relaxed)
    }

    /// Terminates the session. Idempotent; only the first cause sticks.
    /// Clearing the pending table drops every waiter's sender, which the
    /// awaiting proxy calls observe as [`SendError::SessionClosed`].
    pub fn close(&self, cause: CloseKind) {
        if self.close_cause.set(cause).is_ok() {
            self.cancel.cancel();
            self.pending.clear();
        }
    }

    /// Sends one request frame and awaits its correlated response.
    ///
    /// The correlation id is allocated here and never reused for the
    /// lifetime of the session. Exactly one of the following removes the
    /// pending entry: the matching response, the deadline, or session
    /// close.
    pub async fn send_request(
        &self,
        request: ProxiedRequest,
        timeout: Duration,
    ) -> Result<ProxiedResponse, SendError> {
        if self.is_closed() {
            return Err(SendError::SessionClosed);
        }
        if self.pending.len() >= self.max_inflight {
            return Err(SendError::Busy);
        }

        let id = self.next_correlation.fetch_add(1, Ordering::Relaxed);
        let frame = Frame::Request {
            id,
            method: request.method,
            path: request.path,
            query: request.query,
            headers: request.headers,
            body_b64: protocol::encode_body(&request.body),
        };
        let text = protocol::encode(&frame).map_err(|_| SendError::Codec)?;
        if text.len() > self.max_frame_bytes {
            return Err(SendError::PayloadTooLarge);
        }

        let (waiter_tx, waiter_rx) = oneshot::channel();
        self.pending.insert(id, waiter_tx);

        let outcome = tokio::time::timeout(timeout, async {
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(SendError::SessionClosed),
                sent = self.outbound.send(text) => {
                    if sent.is_err() {
                        return Err(SendError::SessionClosed);
                    }
                }
            }
            waiter_rx.await.map_err(|_| SendError::SessionClosed)
        })
        .await;

        match outcome {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(err)) => {
                self.pending.remove(&id);
                Err(err)
            }
            Err(_deadline) => {
                self.pending.remove(&id);
                Err(SendError::Timeout)
            }
        }
    }

    /// Delivers a response frame to its waiter. A response whose waiter is
    /// gone (timeout or close won the race) is dropped without affecting
    /// any other waiter; only a counter records it.
    pub fn complete_response(&self, id: u64, response: ProxiedResponse) {
        match self.pending.remove(&id) {
            Some((_, waiter)) => {
                // The waiter may have been dropped between removal and
                // send; that is the same late-arrival case.
                if waiter.send(response).is_err() {
                    self.late_responses.fetch_add(1, Ordering::Relaxed);
                }
            }
            None => {
                debug!(tunnel_id = %self.tunnel_id, id, "dropping late response");
                self.late_responses.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Queues a control frame (ack, pong, ...) behind any in-flight writes.
    /// Returns false if the session is closed or the frame did not encode.
    pub async fn enqueue(&self, frame: &Frame) -> bool {
        let Ok(text) = protocol::encode(frame) else {
            return false;
        };
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            sent = self.outbound.send(text) => sent.is_ok(),
        }
    }

    // ── Heartbeat accounting ──
    // The write pump ticks once per heartbeat interval: it tears the
    // session down once the miss count reaches the threshold, and
    // otherwise records a ping. A pong resets the count.

    pub fn heartbeat_misses(&self) -> u32 {
        self.heartbeat_misses.load(Ordering::Relaxed)
    }

    pub fn note_ping_sent(&self) {
        self.heartbeat_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pong(&self) {
        self.heartbeat_misses.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tunnel_protocol::DEFAULT_MAX_FRAME_BYTES;

    fn request(path: &str) -> ProxiedRequest {
        ProxiedRequest {
            method: "GET".into(),
            path: path.into(),
            query: String::new(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    fn session_pair(max_inflight: usize) -> (Arc<Session>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_FRAMES);
        let session = Session::new("t1", 1, tx, max_inflight, DEFAULT_MAX_FRAME_BYTES);
        (session, rx)
    }

    /// Reads the next outbound frame and returns its correlation id.
    async fn next_request_id(rx: &mut mpsc::Receiver<String>) -> u64 {
        let text = rx.recv().await.expect("outbound frame");
        match protocol::decode(&text, DEFAULT_MAX_FRAME_BYTES).unwrap() {
            Frame::Request { id, .. } => id,
            other => panic!("expected request frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn response_completes_the_matching_waiter() {
        let (session, mut rx) = session_pair(8);
        let s = session.clone();
        let echo = tokio::spawn(async move {
            let id = next_request_id(&mut rx).await;
            s.complete_response(
                id,
                ProxiedResponse {
                    status: 200,
                    headers: vec![("content-type".into(), "text/plain".into())],
                    body: b"ok".to_vec(),
                },
            );
        });

        let response = session
            .send_request(request("/"), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, b"ok");
        echo.await.unwrap();
    }

    #[tokio::test]
    async fn correlation_ids_are_unique_and_monotonic() {
        let (session, mut rx) = session_pair(8);
        let s = session.clone();
        let ids = tokio::spawn(async move {
            let a = next_request_id(&mut rx).await;
            s.complete_response(
                a,
                ProxiedResponse {
                    status: 204,
                    headers: Vec::new(),
                    body: Vec::new(),
                },
            );
            let b = next_request_id(&mut rx).await;
            s.complete_response(
                b,
                ProxiedResponse {
                    status: 204,
                    headers: Vec::new(),
                    body: Vec::new(),
                },
            );
            (a, b)
        });

        session
            .send_request(request("/a"), Duration::from_secs(5))
            .await
            .unwrap();
        session
            .send_request(request("/b"), Duration::from_secs(5))
            .await
            .unwrap();
        let (a, b) = ids.await.unwrap();
        assert!(b > a, "ids must never repeat within a session: {a} then {b}");
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_removes_the_waiter_and_late_responses_are_counted() {
        let (session, mut rx) = session_pair(8);

        let err = session
            .send_request(request("/slow"), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert_eq!(err, SendError::Timeout);

        // The request frame made it out; answering it now is too late.
        let id = next_request_id(&mut rx).await;
        session.complete_response(
            id,
            ProxiedResponse {
                status: 200,
                headers: Vec::new(),
                body: Vec::new(),
            },
        );
        assert_eq!(session.late_responses(), 1);
    }

    #[tokio::test]
    async fn close_resolves_outstanding_waiters_with_session_closed() {
        let (session, mut rx) = session_pair(8);
        let s = session.clone();
        let call =
            tokio::spawn(
                async move { s.send_request(request("/"), Duration::from_secs(30)).await },
            );
        // Wait for the request frame so the waiter is definitely pending.
        let _ = next_request_id(&mut rx).await;

        session.close(CloseKind::PeerClose);
        assert_eq!(call.await.unwrap().unwrap_err(), SendError::SessionClosed);
        assert_eq!(session.close_cause(), Some(CloseKind::PeerClose));

        // Further sends fail fast.
        let err = session
            .send_request(request("/"), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err, SendError::SessionClosed);
    }

    #[tokio::test]
    async fn close_keeps_only_the_first_cause() {
        let (session, _rx) = session_pair(8);
        session.close(CloseKind::HeartbeatTimeout);
        session.close(CloseKind::PeerClose);
        assert_eq!(session.close_cause(), Some(CloseKind::HeartbeatTimeout));
    }

    #[tokio::test]
    async fn inflight_cap_returns_busy() {
        let (session, mut rx) = session_pair(1);
        let s = session.clone();
        let first =
            tokio::spawn(
                async move { s.send_request(request("/a"), Duration::from_secs(30)).await },
            );
        let id = next_request_id(&mut rx).await;

        let err = session
            .send_request(request("/b"), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err, SendError::Busy);

        session.complete_response(
            id,
            ProxiedResponse {
                status: 200,
                headers: Vec::new(),
                body: Vec::new(),
            },
        );
        assert!(first.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn oversized_request_frame_is_rejected_up_front() {
        let (tx, _rx) = mpsc::channel(OUTBOUND_QUEUE_FRAMES);
        let session = Session::new("t1", 1, tx, 8, 512);
        let mut big = request("/upload");
        big.body = vec![0u8; 4096];
        let err = session
            .send_request(big, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err, SendError::PayloadTooLarge);
        assert_eq!(session.late_responses(), 0);
    }

    #[tokio::test]
    async fn heartbeat_misses_accumulate_and_reset() {
        let (session, _rx) = session_pair(8);
        session.note_ping_sent();
        session.note_ping_sent();
        assert_eq!(session.heartbeat_misses(), 2);
        session.record_pong();
        assert_eq!(session.heartbeat_misses(), 0);
    }
}
