//! # Tunnel Server
//!
//! A self-hosted HTTP tunneling service. Agents dial out to this server
//! over a persistent WebSocket and advertise a local HTTP service; public
//! requests under `/{tunnel_id}/…` are framed, carried over that
//! connection, executed by the agent against its local origin, and the
//! response is returned to the original caller.
//!
//! ```text
//! Caller ──HTTP──► Proxy Pipeline ──frame──► Session ──WS──► Agent ──HTTP──► Local Origin
//! ```
//!
//! ## Modules
//!
//! - [`config`]   — environment configuration
//! - [`error`]    — error taxonomy and its HTTP materialization
//! - [`registry`] — tunnel descriptors and lifecycle
//! - [`session`]  — per-agent pending-request table and outbound queue
//! - [`handlers`] — WebSocket attach handshake and pumps
//! - [`proxy`]    — public catch-all reverse-proxy handler
//! - [`api`]      — control-plane REST endpoints
//! - [`sweep`]    — idle-tunnel eviction task

pub mod api;
pub mod config;
pub mod error;
pub mod handlers;
pub mod proxy;
pub mod registry;
pub mod session;
pub mod sweep;

use std::sync::Arc;

use axum::middleware;
use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::cors::CorsLayer;

use crate::config::Config;
use crate::registry::Registry;

/// Shared application state, cloned into each handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<Registry>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let registry = Arc::new(Registry::new(config.max_tunnels, config.idle_timeout));
        AppState {
            config: Arc::new(config),
            registry,
        }
    }
}

/// Builds the full public router: control plane, transport endpoint, and
/// the proxy fallback. Exposed so the integration suite can serve it on
/// an ephemeral listener.
pub fn app(state: AppState) -> Router {
    let control = Router::new()
        .route("/create", post(api::create_tunnel))
        .route("/list", get(api::list_tunnels))
        .route("/{id}/status", get(api::tunnel_status))
        .route("/{id}", delete(api::delete_tunnel))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            api::require_operator,
        ));

    Router::new()
        .route("/health", get(api::health))
        .route("/api", get(api::index))
        .nest("/api/tunnels", control)
        .route("/api/tunnel/connect/{id}", get(handlers::connect_handler))
        // Everything else is /{tunnel_id}/{rest…}
        .fallback(proxy::proxy_handler)
        .layer(CorsLayer::permissive())
        .with_state(state)
}
