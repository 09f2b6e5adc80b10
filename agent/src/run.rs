//! # Connection Loop
//!
//! Dials the tunnel server, performs the attach handshake, and runs the
//! two pumps until the session ends:
//! - the inbound loop turns request frames into local dispatch tasks and
//!   handles heartbeats,
//! - the write pump is the sole socket writer and runs the outgoing
//!   heartbeat.
//!
//! On interrupt (or a server-side close) the loop stops accepting new
//! requests, drains in-flight local calls up to a grace window, and exits.

use anyhow::{bail, Context};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use tunnel_protocol::{self as protocol, CloseKind, CodecError, Frame};

use crate::cli::Cli;
use crate::control;
use crate::dispatch::{self, IncomingRequest};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const CONNECT_ATTEMPTS: u32 = 3;
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(3);
const OUTBOUND_QUEUE_FRAMES: usize = 64;

pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let client = reqwest::Client::new();

    // Either reuse a pre-issued tunnel or create a fresh one.
    let (tunnel_id, auth_token) = match (cli.tunnel_id.clone(), cli.auth_token.clone()) {
        (Some(id), Some(token)) => {
            info!(tunnel_id = %id, "using pre-issued tunnel");
            (id, token)
        }
        _ => {
            let created = control::create_tunnel(&client, &cli).await?;
            (created.tunnel_id, created.auth_token)
        }
    };

    let connect_url = cli.connect_url(&tunnel_id);
    let mut ws = connect_with_retry(&connect_url).await?;

    // ── Attach Handshake ──
    // First frame on the wire must be the attach; the server answers with
    // ack or an error frame naming the cause.
    let attach = protocol::encode(&Frame::Attach { auth_token })?;
    ws.send(Message::Text(attach.into()))
        .await
        .context("failed to send attach frame")?;
    match tokio::time::timeout(HANDSHAKE_TIMEOUT, ws.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => {
            match protocol::decode(text.as_str(), cli.max_frame_bytes) {
                Ok(Frame::Ack) => info!(%tunnel_id, "attached"),
                Ok(Frame::Error { kind, message }) => bail!("attach rejected: {kind}: {message}"),
                Ok(other) => bail!("unexpected `{}` frame during attach", other.kind_str()),
                Err(err) => bail!("undecodable attach reply: {err}"),
            }
        }
        Ok(_) => bail!("server closed the connection during attach"),
        Err(_) => bail!("attach handshake timed out"),
    }

    run_session(&cli, ws, client).await;
    Ok(())
}

async fn connect_with_retry(url: &str) -> anyhow::Result<WsStream> {
    let mut attempt = 1;
    loop {
        match connect_async(url).await {
            Ok((ws, _)) => return Ok(ws),
            Err(err) if attempt < CONNECT_ATTEMPTS => {
                warn!(%err, attempt, "connect failed, retrying");
                attempt += 1;
                tokio::time::sleep(CONNECT_RETRY_DELAY).await;
            }
            Err(err) => return Err(err).with_context(|| format!("could not reach {url}")),
        }
    }
}

// ─── Session ────────────────────────────────────────────────────

async fn run_session(cli: &Cli, ws: WsStream, client: reqwest::Client) {
    let (ws_sink, mut ws_stream) = ws.split();
    let (tx, rx) = mpsc::channel::<String>(OUTBOUND_QUEUE_FRAMES);
    let misses = Arc::new(AtomicU32::new(0));
    let interrupt = CancellationToken::new();

    // SIGINT stops the inbound loop; in-flight dispatches get drained.
    {
        let interrupt = interrupt.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, shutting down");
                interrupt.cancel();
            }
        });
    }

    let mut writer = tokio::spawn(write_pump(
        ws_sink,
        rx,
        misses.clone(),
        cli.heartbeat_interval(),
        cli.heartbeat_miss_threshold,
        interrupt.clone(),
    ));

    let origin = cli.local_origin();
    let tracker = TaskTracker::new();

    // ── Inbound Loop ──
    loop {
        tokio::select! {
            _ = interrupt.cancelled() => break,
            next = ws_stream.next() => {
                let Some(Ok(msg)) = next else {
                    info!("transport closed");
                    break;
                };
                let text = match msg {
                    Message::Text(text) => text,
                    Message::Close(_) => {
                        info!("transport closed by server");
                        break;
                    }
                    _ => continue,
                };
                match protocol::decode(text.as_str(), cli.max_frame_bytes) {
                    Ok(Frame::Request { id, method, path, query, headers, body_b64 }) => {
                        let request = IncomingRequest { id, method, path, query, headers, body_b64 };
                        let client = client.clone();
                        let origin = origin.clone();
                        let tx = tx.clone();
                        let timeout = cli.local_timeout();
                        tracker.spawn(async move {
                            let frame = dispatch::dispatch(&client, &origin, timeout, request).await;
                            if let Ok(text) = protocol::encode(&frame) {
                                let _ = tx.send(text).await;
                            }
                        });
                    }
                    Ok(Frame::Ping { t }) => {
                        if let Ok(text) = protocol::encode(&Frame::Pong { t }) {
                            let _ = tx.send(text).await;
                        }
                    }
                    Ok(Frame::Pong { .. }) => misses.store(0, Ordering::Relaxed),
                    Ok(Frame::Close { kind, message }) => {
                        info!(%kind, %message, "server closed the session");
                        break;
                    }
                    Ok(Frame::Error { kind, message }) => {
                        error!(%kind, %message, "server reported an error");
                        break;
                    }
                    Ok(other) => {
                        // e.g. a response frame arriving at the agent
                        warn!(frame = other.kind_str(), "frame invalid on the agent side");
                        if let Ok(text) = protocol::encode(&Frame::Close {
                            kind: CloseKind::Protocol,
                            message: format!("unexpected `{}` frame", other.kind_str()),
                        }) {
                            let _ = tx.send(text).await;
                        }
                        break;
                    }
                    Err(CodecError::FrameTooLarge { len, max }) => {
                        warn!(len, max, "oversized frame from server");
                        break;
                    }
                    Err(err) => {
                        warn!(%err, "malformed frame from server");
                        break;
                    }
                }
            }
        }
    }

    // ── Drain & Exit ──
    tracker.close();
    if tokio::time::timeout(cli.drain_grace(), tracker.wait())
        .await
        .is_err()
    {
        warn!("drain grace expired with local calls still in flight");
    }
    drop(tx);
    // The write pump flushes what the drained tasks produced, closes the
    // socket, and exits; a straggler past the grace window still holds a
    // queue sender, so don't wait on it forever.
    if tokio::time::timeout(Duration::from_secs(2), &mut writer)
        .await
        .is_err()
    {
        writer.abort();
    }
    info!("agent exit");
}

// ─── Write Pump ─────────────────────────────────────────────────

/// Sole socket writer. Drains the frame queue, pings when an interval
/// passes without traffic, and gives up once the miss threshold is hit.
async fn write_pump(
    mut sink: SplitSink<WsStream, Message>,
    mut rx: mpsc::Receiver<String>,
    misses: Arc<AtomicU32>,
    interval: Duration,
    miss_threshold: u32,
    interrupt: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    let mut ping_tag: u64 = 0;
    let mut wrote_since_tick = false;

    loop {
        tokio::select! {
            maybe = rx.recv() => match maybe {
                Some(text) => {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                    wrote_since_tick = true;
                }
                // Queue closed: the session is over, say goodbye.
                None => {
                    send_close(&mut sink, CloseKind::Shutdown).await;
                    break;
                }
            },
            _ = ticker.tick() => {
                if misses.load(Ordering::Relaxed) >= miss_threshold {
                    warn!("server stopped answering heartbeats");
                    send_close(&mut sink, CloseKind::HeartbeatTimeout).await;
                    interrupt.cancel();
                    break;
                }
                if !wrote_since_tick {
                    ping_tag += 1;
                    misses.fetch_add(1, Ordering::Relaxed);
                    if let Ok(text) = protocol::encode(&Frame::Ping { t: ping_tag }) {
                        if sink.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                }
                wrote_since_tick = false;
            }
        }
    }
}

async fn send_close(sink: &mut SplitSink<WsStream, Message>, kind: CloseKind) {
    if let Ok(text) = protocol::encode(&Frame::Close {
        kind,
        message: String::new(),
    }) {
        let _ = sink.send(Message::Text(text.into())).await;
    }
    let _ = sink.send(Message::Close(None)).await;
}
