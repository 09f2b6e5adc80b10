//! # Tunnel Agent
//!
//! Headless client for the tunnel server. It creates (or reuses) a tunnel
//! via the control plane, dials the transport endpoint, and serves the
//! request frames it receives against a local HTTP origin.
//!
//! ```text
//! Tunnel Server ──WS frames──► Agent ──HTTP──► Local Origin
//! ```
//!
//! ## Modules
//!
//! - [`cli`]      — flags and environment configuration
//! - [`control`]  — control-plane create call
//! - [`run`]      — connection loop and pumps
//! - [`dispatch`] — per-request local origin call

mod cli;
mod control;
mod dispatch;
mod run;

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let cli = cli::Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "tunnel_agent=info".into()),
        )
        .init();

    if let Err(err) = run::run(cli).await {
        error!("{err:#}");
        std::process::exit(1);
    }
}
