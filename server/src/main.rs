//! Server entry point: configuration, logging, the listener, the sweeper,
//! and graceful shutdown on interrupt.

use std::net::SocketAddr;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::fmt::time::{ChronoLocal, ChronoUtc};
use tracing_subscriber::EnvFilter;

use tunnel_server::config::{Config, LogTimezone};
use tunnel_server::{sweep, AppState};

#[tokio::main]
async fn main() {
    // A bad environment is a startup failure, reported before logging is
    // configured.
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            std::process::exit(2);
        }
    };
    init_tracing(&config);

    let state = AppState::new(config.clone());
    let registry = state.registry.clone();

    let sweeper_cancel = CancellationToken::new();
    let sweeper = sweep::spawn_sweeper(
        registry.clone(),
        config.sweep_interval,
        sweeper_cancel.clone(),
    );

    let app = tunnel_server::app(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(%addr, %err, "failed to bind");
            std::process::exit(2);
        }
    };
    info!("🚇 tunnel server listening on {}", addr);

    // On interrupt, close every attached session so their handler tasks
    // finish and the graceful shutdown can complete.
    let shutdown = {
        let registry = registry.clone();
        async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("interrupt received, shutting down");
            registry.shutdown_sessions();
        }
    };

    let serve = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown);

    if let Err(err) = serve.await {
        error!(%err, "server error");
        std::process::exit(1);
    }

    sweeper_cancel.cancel();
    let _ = sweeper.await;
    info!("shutdown complete");
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    match config.log_timezone {
        LogTimezone::Utc => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_timer(ChronoUtc::rfc_3339())
            .init(),
        LogTimezone::Local => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_timer(ChronoLocal::rfc_3339())
            .init(),
    }
}
