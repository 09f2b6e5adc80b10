//! # Control Plane
//!
//! REST surface for operating tunnels: health probe, route index, and the
//! create/list/status/delete operations over the registry. Everything
//! under `/api/tunnels` is guarded by the operator credential header.

use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::Response;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::info;

use crate::error::ApiError;
use crate::registry::{CreateError, TunnelSnapshot, TunnelSpec};
use crate::AppState;

// ─── Operator Auth ──────────────────────────────────────────────

/// Middleware for the control-plane routes. A missing credential header
/// is 401; a present-but-wrong one is 403. The admin key, when
/// configured, is accepted everywhere the operator key is.
pub async fn require_operator(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let supplied = req
        .headers()
        .get(state.config.auth_header.as_str())
        .ok_or(ApiError::Unauthorized)?;

    let matches_operator = supplied.as_bytes() == state.config.api_key.as_bytes();
    let matches_admin = state
        .config
        .admin_key
        .as_deref()
        .is_some_and(|admin| supplied.as_bytes() == admin.as_bytes());
    if !matches_operator && !matches_admin {
        return Err(ApiError::Forbidden);
    }
    Ok(next.run(req).await)
}

// ─── Service Endpoints ──────────────────────────────────────────

/// `GET /health` — unauthenticated liveness probe.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "environment": state.config.environment,
    }))
}

/// `GET /api` — lists the control-plane routes.
pub async fn index() -> Json<Value> {
    Json(json!({
        "routes": [
            { "method": "GET", "path": "/health" },
            { "method": "POST", "path": "/api/tunnels/create" },
            { "method": "GET", "path": "/api/tunnels/list" },
            { "method": "GET", "path": "/api/tunnels/{id}/status" },
            { "method": "DELETE", "path": "/api/tunnels/{id}" },
            { "method": "GET", "path": "/api/tunnel/connect/{id}" },
            { "method": "ANY", "path": "/{tunnel_id}/{path}" },
        ],
    }))
}

// ─── Tunnel CRUD ────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct CreateTunnelRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub local_port: Option<u16>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// The only response that ever carries the attach token.
#[derive(Debug, Serialize)]
pub struct CreateTunnelResponse {
    pub tunnel_id: String,
    pub auth_token: String,
    pub url: String,
    pub created_at: DateTime<Utc>,
}

/// `POST /api/tunnels/create`
pub async fn create_tunnel(
    State(state): State<AppState>,
    body: Option<Json<CreateTunnelRequest>>,
) -> Result<Json<CreateTunnelResponse>, ApiError> {
    let req = body.map(|Json(b)| b).unwrap_or_default();
    let created = state
        .registry
        .create(TunnelSpec {
            name: req.name,
            local_port: req.local_port,
            metadata: req.metadata,
        })
        .map_err(|e| match e {
            CreateError::CapacityExceeded => ApiError::CapacityExceeded,
            CreateError::MetadataTooLarge => ApiError::PayloadTooLarge,
        })?;

    // The id is safe to log; the token never is.
    info!(tunnel_id = %created.tunnel_id, "tunnel created");
    let url = format!(
        "{}/{}",
        state.config.public_base_url.trim_end_matches('/'),
        created.tunnel_id
    );
    Ok(Json(CreateTunnelResponse {
        tunnel_id: created.tunnel_id,
        auth_token: created.auth_token,
        url,
        created_at: created.created_at,
    }))
}

#[derive(Debug, Serialize)]
pub struct ListTunnelsResponse {
    pub tunnels: Vec<TunnelSnapshot>,
    pub total: usize,
}

/// `GET /api/tunnels/list`
pub async fn list_tunnels(State(state): State<AppState>) -> Json<ListTunnelsResponse> {
    let tunnels = state.registry.list();
    Json(ListTunnelsResponse {
        total: tunnels.len(),
        tunnels,
    })
}

/// `GET /api/tunnels/{id}/status`
pub async fn tunnel_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TunnelSnapshot>, ApiError> {
    state
        .registry
        .snapshot(&id)
        .map(Json)
        .ok_or(ApiError::TunnelNotFound)
}

/// `DELETE /api/tunnels/{id}` — authoritative: severs any attached
/// session with cause `ADMIN_DELETE`.
pub async fn delete_tunnel(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.registry.delete(&id) {
        info!(tunnel_id = %id, "tunnel deleted");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::TunnelNotFound)
    }
}
