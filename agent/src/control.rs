//! Control-plane client: the one create call made before dialing the
//! transport endpoint.

use anyhow::{bail, Context};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use tracing::info;

use crate::cli::Cli;

/// What create hands back. The token is shown here once and never again.
#[derive(Debug, Deserialize)]
pub struct CreatedTunnel {
    pub tunnel_id: String,
    pub auth_token: String,
    pub url: String,
}

pub async fn create_tunnel(client: &reqwest::Client, cli: &Cli) -> anyhow::Result<CreatedTunnel> {
    let endpoint = format!(
        "{}/api/tunnels/create",
        cli.server_url.trim_end_matches('/')
    );
    let metadata: HashMap<&str, &str> = cli
        .metadata
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();

    let response = client
        .post(&endpoint)
        .header(cli.auth_header.as_str(), cli.api_key.as_str())
        .json(&json!({
            "name": cli.name,
            "local_port": cli.local_port,
            "metadata": metadata,
        }))
        .send()
        .await
        .with_context(|| format!("control plane unreachable at {endpoint}"))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        bail!("tunnel create failed: {status}: {body}");
    }

    let created: CreatedTunnel = response
        .json()
        .await
        .context("invalid create response from control plane")?;
    info!(tunnel_id = %created.tunnel_id, url = %created.url, "tunnel created");
    Ok(created)
}
