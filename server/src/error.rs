//! # Error Taxonomy
//!
//! The kinds a caller of the public surface can observe, and their HTTP
//! materialization. Every error response carries a small JSON body of the
//! shape `{"error": KIND, "message": "..."}` — never a stack trace, never
//! token material.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    /// The first path segment is not a known tunnel id.
    #[error("no tunnel with this id")]
    TunnelNotFound,

    /// The tunnel exists but no agent session is attached.
    #[error("tunnel exists but no agent is connected")]
    TunnelNotConnected,

    /// The session is at its in-flight request cap.
    #[error("tunnel is at its concurrent request limit")]
    TunnelBusy,

    /// The agent did not answer within the request timeout.
    #[error("the agent did not respond in time")]
    RequestTimeout,

    /// The agent session died while the request was in flight.
    #[error("{0}")]
    UpstreamGone(String),

    /// The request body (or the frame it would produce) is over the cap.
    #[error("payload exceeds the configured size limit")]
    PayloadTooLarge,

    /// The operator credential header is absent.
    #[error("missing operator credential")]
    Unauthorized,

    /// The operator credential header is present but wrong.
    #[error("invalid operator credential")]
    Forbidden,

    /// A rate-limit policy rejected the call.
    #[error("too many requests")]
    Throttled,

    /// Create would exceed the configured tunnel cap.
    #[error("tunnel capacity reached")]
    CapacityExceeded,

    /// Anything else. The message stays generic on the wire.
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    /// The machine-readable kind string carried in the response body.
    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::TunnelNotFound => "TUNNEL_NOT_FOUND",
            ApiError::TunnelNotConnected => "TUNNEL_NOT_CONNECTED",
            ApiError::TunnelBusy => "TUNNEL_BUSY",
            ApiError::RequestTimeout => "REQUEST_TIMEOUT",
            ApiError::UpstreamGone(_) => "UPSTREAM_GONE",
            ApiError::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            ApiError::Unauthorized => "UNAUTHORIZED",
            ApiError::Forbidden => "FORBIDDEN",
            ApiError::Throttled => "THROTTLED",
            ApiError::CapacityExceeded => "CAPACITY_EXCEEDED",
            ApiError::Internal(_) => "INTERNAL",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::TunnelNotFound => StatusCode::NOT_FOUND,
            ApiError::TunnelNotConnected => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::TunnelBusy => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            ApiError::UpstreamGone(_) => StatusCode::BAD_GATEWAY,
            ApiError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::Throttled => StatusCode::TOO_MANY_REQUESTS,
            ApiError::CapacityExceeded => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.kind(),
            message: self.to_string(),
        };
        (self.status(), Json(body)).into_response()
    }
}
