//! # Tunnel Wire Protocol
//!
//! Defines the logical frames exchanged between the tunnel server and its
//! agents, and the textual codec that carries them over the WebSocket
//! transport. Frames are serialized as JSON text messages using serde's
//! internally-tagged representation (`"type": "..."` field); binary HTTP
//! bodies travel as base64 strings so they survive the text transport.
//!
//! Both sides of the tunnel depend on this crate, so anything that must
//! stay in sync lives here: the frame shapes, the error/close kinds, the
//! body encoding, and the hop-by-hop header set that proxies must strip.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default upper bound on a single encoded frame, base64 overhead included.
/// Frames over the limit are rejected on receive and the session torn down.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

// ─── Frames ─────────────────────────────────────────────────────

/// All frames in the tunnel protocol.
///
/// The `#[serde(tag = "type")]` attribute means each variant is serialized
/// as a JSON object with a `"type"` field whose value is the snake_case
/// variant name, e.g. `Frame::Ack` serializes to `{"type": "ack"}`.
/// Unknown fields are ignored on decode for forward compatibility.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    // ── Attach Handshake ──────────────────────────────────────────

    /// First frame an agent sends after dialing the transport endpoint.
    /// Carries the attach token issued at create time.
    Attach { auth_token: String },

    /// Server acknowledgment that the attach succeeded; the session is
    /// live and request frames may follow.
    Ack,

    /// Server rejection of the attach (or an agent-reported error), with
    /// a machine-readable kind and a short human message.
    Error { kind: ErrorKind, message: String },

    // ── Proxied HTTP Traffic ──────────────────────────────────────

    /// One public HTTP request, fully buffered. `id` is the correlation
    /// id pairing this frame with its response; `headers` preserves
    /// duplicate keys and order; `body_b64` is the base64-encoded body.
    Request {
        id: u64,
        method: String,
        path: String,
        #[serde(default)]
        query: String,
        #[serde(default)]
        headers: Vec<(String, String)>,
        #[serde(default)]
        body_b64: String,
    },

    /// The response to the request frame carrying the same `id`.
    Response {
        id: u64,
        status: u16,
        #[serde(default)]
        headers: Vec<(String, String)>,
        #[serde(default)]
        body_b64: String,
    },

    // ── Heartbeat ─────────────────────────────────────────────────

    /// Liveness probe. `t` is a monotonic tag echoed back in the pong.
    Ping { t: u64 },

    /// Heartbeat response, echoing the ping's tag.
    Pong { t: u64 },

    // ── Teardown ──────────────────────────────────────────────────

    /// Orderly session teardown with a reason.
    Close {
        kind: CloseKind,
        #[serde(default)]
        message: String,
    },
}

impl Frame {
    /// The wire tag for this frame, as it appears in the `type` field.
    pub fn kind_str(&self) -> &'static str {
        match self {
            Frame::Attach { .. } => "attach",
            Frame::Ack => "ack",
            Frame::Error { .. } => "error",
            Frame::Request { .. } => "request",
            Frame::Response { .. } => "response",
            Frame::Ping { .. } => "ping",
            Frame::Pong { .. } => "pong",
            Frame::Close { .. } => "close",
        }
    }
}

/// Frame tags this protocol version understands. Anything else decodes to
/// [`CodecError::UnknownType`].
const KNOWN_TYPES: [&str; 8] = [
    "attach", "ack", "error", "request", "response", "ping", "pong", "close",
];

// ─── Kinds ──────────────────────────────────────────────────────

/// Machine-readable kinds carried by `error` frames.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// The tunnel id in the connect URL does not exist.
    UnknownId,
    /// The attach token does not match the one issued at create time.
    BadToken,
    /// Another session is already attached to this tunnel.
    AlreadyAttached,
    /// The server is at its configured tunnel capacity.
    Capacity,
    /// The agent could not reach its configured local origin.
    LocalUnreachable,
}

/// Reasons carried by `close` frames, and recorded as a session's
/// termination cause.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CloseKind {
    /// The peer sent a frame that is invalid at its position.
    Protocol,
    /// The peer sent bytes the codec could not parse.
    MalformedFrame,
    /// The peer sent a frame over the configured size limit.
    FrameTooLarge,
    /// An operator deleted the tunnel out from under the session.
    AdminDelete,
    /// Too many heartbeat intervals elapsed without a pong.
    HeartbeatTimeout,
    /// The process is shutting down.
    Shutdown,
    /// The peer closed the underlying connection.
    PeerClose,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::UnknownId => "UNKNOWN_ID",
            ErrorKind::BadToken => "BAD_TOKEN",
            ErrorKind::AlreadyAttached => "ALREADY_ATTACHED",
            ErrorKind::Capacity => "CAPACITY",
            ErrorKind::LocalUnreachable => "LOCAL_UNREACHABLE",
        };
        f.write_str(s)
    }
}

impl std::fmt::Display for CloseKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CloseKind::Protocol => "PROTOCOL",
            CloseKind::MalformedFrame => "MALFORMED_FRAME",
            CloseKind::FrameTooLarge => "FRAME_TOO_LARGE",
            CloseKind::AdminDelete => "ADMIN_DELETE",
            CloseKind::HeartbeatTimeout => "HEARTBEAT_TIMEOUT",
            CloseKind::Shutdown => "SHUTDOWN",
            CloseKind::PeerClose => "PEER_CLOSE",
        };
        f.write_str(s)
    }
}

// ─── Codec ──────────────────────────────────────────────────────

/// Ways a frame can fail to cross the codec.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The outer JSON envelope could not be parsed at all.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// The envelope parsed but the `type` tag is not one we know.
    #[error("unknown frame type `{0}`")]
    UnknownType(String),

    /// A field the tag requires is absent.
    #[error("missing field `{field}` in `{frame_type}` frame")]
    FieldMissing { frame_type: String, field: String },

    /// The encoded frame exceeds the configured size limit.
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },

    /// A frame failed to serialize. Does not happen for well-formed
    /// frames; surfaced rather than panicking in the write path.
    #[error("frame serialization failed: {0}")]
    Serialize(String),
}

/// Serializes a frame to its JSON text form.
///
/// Encoding itself is not size-capped; receivers enforce the limit. A
/// sender that must pre-validate (e.g. the proxy pipeline rejecting
/// oversized request frames with 413) checks the returned text's length.
pub fn encode(frame: &Frame) -> Result<String, CodecError> {
    serde_json::to_string(frame).map_err(|e| CodecError::Serialize(e.to_string()))
}

/// Parses one JSON text message into a frame, enforcing `max_bytes`.
pub fn decode(text: &str, max_bytes: usize) -> Result<Frame, CodecError> {
    if text.len() > max_bytes {
        return Err(CodecError::FrameTooLarge {
            len: text.len(),
            max: max_bytes,
        });
    }

    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|e| CodecError::MalformedFrame(e.to_string()))?;
    let tag = value
        .as_object()
        .and_then(|obj| obj.get("type"))
        .and_then(|t| t.as_str())
        .ok_or_else(|| CodecError::MalformedFrame("missing `type` tag".into()))?;
    if !KNOWN_TYPES.contains(&tag) {
        return Err(CodecError::UnknownType(tag.to_string()));
    }

    let tag = tag.to_string();
    serde_json::from_value(value).map_err(|e| classify_decode_error(&tag, &e))
}

/// Maps a serde error for a known tag onto the codec taxonomy. serde
/// reports absent required fields as "missing field `name`"; everything
/// else (wrong types, bad enum values) is malformed.
fn classify_decode_error(tag: &str, err: &serde_json::Error) -> CodecError {
    let msg = err.to_string();
    match msg
        .strip_prefix("missing field `")
        .and_then(|rest| rest.split('`').next())
    {
        Some(field) => CodecError::FieldMissing {
            frame_type: tag.to_string(),
            field: field.to_string(),
        },
        None => CodecError::MalformedFrame(msg),
    }
}

// ─── Body Encoding ──────────────────────────────────────────────

/// Encodes raw body bytes for transport in a `body_b64` field.
pub fn encode_body(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

/// Decodes a `body_b64` field back into raw bytes.
pub fn decode_body(b64: &str) -> Result<Vec<u8>, CodecError> {
    BASE64
        .decode(b64)
        .map_err(|e| CodecError::MalformedFrame(format!("invalid base64 body: {e}")))
}

// ─── Hop-by-Hop Headers ─────────────────────────────────────────

/// Headers whose meaning is connection-scoped. Stripped on both legs of
/// the proxied call, in both directions.
pub const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// True if `name` is one of the hop-by-hop headers (case-insensitive).
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}
