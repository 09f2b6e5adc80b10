//! # Transport Endpoint
//!
//! WebSocket lifecycle for agent sessions:
//! - Upgrading `GET /api/tunnel/connect/{id}` to a WebSocket
//! - The attach handshake (first frame MUST be `attach`)
//! - The inbound pump (response routing, heartbeat bookkeeping)
//! - The outbound pump (sole socket writer, heartbeat ticking)
//! - Teardown and registry detach

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use tunnel_protocol::{self as protocol, CloseKind, CodecError, ErrorKind, Frame};

use crate::registry::AttachError;
use crate::session::{ProxiedResponse, Session, OUTBOUND_QUEUE_FRAMES};
use crate::AppState;

/// How long the agent has to send its attach frame after the upgrade.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// WebSocket close code sent on handshake rejection (policy violation).
const CLOSE_POLICY_VIOLATION: u16 = 1008;

// ─── Upgrade Endpoint ───────────────────────────────────────────

/// `GET /api/tunnel/connect/{id}` — upgrades to a WebSocket and runs the
/// session until either side ends it.
pub async fn connect_handler(
    ws: WebSocketUpgrade,
    Path(tunnel_id): Path<String>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_session(socket, tunnel_id, state))
}

// ─── Session Lifecycle ──────────────────────────────────────────

async fn handle_session(socket: WebSocket, tunnel_id: String, state: AppState) {
    let (mut ws_sink, mut ws_stream) = socket.split();

    // ── Attach Handshake ──
    // The very first message must be an attach frame carrying the token
    // issued at create time. Anything else ends the connection here,
    // before a session exists.
    let token = match tokio::time::timeout(HANDSHAKE_TIMEOUT, ws_stream.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => {
            match protocol::decode(&text, state.config.max_frame_bytes) {
                Ok(Frame::Attach { auth_token }) => auth_token,
                Ok(other) => {
                    warn!(%tunnel_id, frame = other.kind_str(), "expected attach frame");
                    reject(&mut ws_sink, None, "attach frame required").await;
                    return;
                }
                Err(err) => {
                    warn!(%tunnel_id, %err, "undecodable handshake frame");
                    reject(&mut ws_sink, None, "malformed attach frame").await;
                    return;
                }
            }
        }
        _ => {
            debug!(%tunnel_id, "connection dropped before attach");
            return;
        }
    };

    let (outbound_tx, outbound_rx) = mpsc::channel::<String>(OUTBOUND_QUEUE_FRAMES);
    let session = Session::new(
        &tunnel_id,
        state.registry.next_session_seq(),
        outbound_tx,
        state.config.max_inflight_per_session,
        state.config.max_frame_bytes,
    );

    if let Err(err) = state.registry.attach(&tunnel_id, &token, session.clone()) {
        let kind = match err {
            AttachError::UnknownId => ErrorKind::UnknownId,
            AttachError::BadToken => ErrorKind::BadToken,
            AttachError::AlreadyAttached => ErrorKind::AlreadyAttached,
        };
        warn!(%tunnel_id, %kind, "attach rejected");
        reject(&mut ws_sink, Some(kind), "attach rejected").await;
        return;
    }
    info!(%tunnel_id, seq = session.seq(), "agent attached");

    // The ack goes through the queue so the write pump is the only writer
    // from here on.
    let _ = session.enqueue(&Frame::Ack).await;

    let outbound = tokio::spawn(outbound_pump(
        ws_sink,
        outbound_rx,
        session.clone(),
        state.clone(),
    ));

    inbound_pump(&mut ws_stream, &session, &state).await;

    // ── Teardown ──
    // Whichever cause was recorded first wins; a clean peer disconnect
    // lands here with no cause set yet.
    session.close(CloseKind::PeerClose);
    let _ = outbound.await;
    state.registry.detach(&tunnel_id, session.seq());
    info!(
        %tunnel_id,
        cause = %session.close_cause().unwrap_or(CloseKind::PeerClose),
        late_responses = session.late_responses(),
        "session closed"
    );
}

/// Sends an optional error frame followed by a non-normal close. Used only
/// during the handshake, before the write pump exists.
async fn reject(sink: &mut SplitSink<WebSocket, Message>, kind: Option<ErrorKind>, reason: &str) {
    if let Some(kind) = kind {
        if let Ok(text) = protocol::encode(&Frame::Error {
            kind,
            message: reason.to_string(),
        }) {
            let _ = sink.send(Message::Text(text.into())).await;
        }
    }
    let _ = sink
        .send(Message::Close(Some(CloseFrame {
            code: CLOSE_POLICY_VIOLATION,
            reason: reason.to_string().into(),
        })))
        .await;
}

// ─── Inbound Pump ───────────────────────────────────────────────

/// Reads frames until error or close. Response frames complete pending
/// waiters; a frame that is invalid at this position ends the session.
async fn inbound_pump(
    ws_stream: &mut SplitStream<WebSocket>,
    session: &Arc<Session>,
    state: &AppState,
) {
    while let Some(Ok(msg)) = ws_stream.next().await {
        match msg {
            Message::Text(text) => {
                state.registry.touch(session.tunnel_id());
                match protocol::decode(&text, state.config.max_frame_bytes) {
                    Ok(Frame::Response {
                        id,
                        status,
                        headers,
                        body_b64,
                    }) => match protocol::decode_body(&body_b64) {
                        Ok(body) => session.complete_response(
                            id,
                            ProxiedResponse {
                                status,
                                headers,
                                body,
                            },
                        ),
                        Err(err) => {
                            warn!(tunnel_id = %session.tunnel_id(), %err, "bad response body");
                            session.close(CloseKind::MalformedFrame);
                            break;
                        }
                    },
                    Ok(Frame::Pong { .. }) => session.record_pong(),
                    Ok(Frame::Ping { t }) => {
                        let _ = session.enqueue(&Frame::Pong { t }).await;
                    }
                    Ok(Frame::Close { kind, message }) => {
                        debug!(tunnel_id = %session.tunnel_id(), %kind, %message, "peer closed");
                        session.close(CloseKind::PeerClose);
                        break;
                    }
                    Ok(other) => {
                        // e.g. a request frame sent to the server side
                        warn!(
                            tunnel_id = %session.tunnel_id(),
                            frame = other.kind_str(),
                            "frame invalid on an agent session"
                        );
                        session.close(CloseKind::Protocol);
                        break;
                    }
                    Err(CodecError::FrameTooLarge { len, max }) => {
                        warn!(tunnel_id = %session.tunnel_id(), len, max, "frame over limit");
                        session.close(CloseKind::FrameTooLarge);
                        break;
                    }
                    Err(err) => {
                        warn!(tunnel_id = %session.tunnel_id(), %err, "malformed frame");
                        session.close(CloseKind::MalformedFrame);
                        break;
                    }
                }
            }
            Message::Close(_) => {
                session.close(CloseKind::PeerClose);
                break;
            }
            // Binary frames and transport-level ping/pong are not part of
            // the protocol; ignore them.
            _ => {}
        }
        if session.is_closed() {
            break;
        }
    }
}

// ─── Outbound Pump ──────────────────────────────────────────────

/// Drains the session's frame queue onto the socket. This task is the only
/// writer, which makes each frame's bytes atomic on the wire. Also runs
/// the heartbeat: one tick per interval, a ping when the interval passed
/// without traffic, teardown once the miss threshold is reached.
async fn outbound_pump(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<String>,
    session: Arc<Session>,
    state: AppState,
) {
    let interval = state.config.heartbeat_interval;
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    let mut ping_tag: u64 = 0;
    let mut wrote_since_tick = false;
    let cancel = session.cancel_token();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                // Best effort: tell the peer why before closing the socket.
                let cause = session.close_cause().unwrap_or(CloseKind::Shutdown);
                if let Ok(text) = protocol::encode(&Frame::Close {
                    kind: cause,
                    message: String::new(),
                }) {
                    let _ = sink.send(Message::Text(text.into())).await;
                }
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
            maybe = rx.recv() => match maybe {
                Some(text) => {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        session.close(CloseKind::PeerClose);
                        break;
                    }
                    wrote_since_tick = true;
                    state.registry.touch(session.tunnel_id());
                }
                None => break,
            },
            _ = ticker.tick() => {
                if session.heartbeat_misses() >= state.config.heartbeat_miss_threshold {
                    warn!(tunnel_id = %session.tunnel_id(), "heartbeat timeout");
                    session.close(CloseKind::HeartbeatTimeout);
                    // Next iteration takes the cancelled branch and flushes
                    // the close frame.
                    continue;
                }
                if !wrote_since_tick {
                    ping_tag += 1;
                    session.note_ping_sent();
                    if let Ok(text) = protocol::encode(&Frame::Ping { t: ping_tag }) {
                        if sink.send(Message::Text(text.into())).await.is_err() {
                            session.close(CloseKind::PeerClose);
                            break;
                        }
                        state.registry.touch(session.tunnel_id());
                    }
                }
                wrote_since_tick = false;
            }
        }
    }
}
