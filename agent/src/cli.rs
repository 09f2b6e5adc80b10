//! # Agent Configuration
//!
//! Every option is a flag with an environment fallback, so the agent works
//! the same from a shell, a unit file, or a container.

use clap::Parser;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "tunnel-agent",
    version,
    about = "Expose a local HTTP service through a tunnel server"
)]
pub struct Cli {
    /// Base URL of the tunnel server, e.g. http://tunnel.example.com:7070
    #[arg(long, env = "TUNNEL_SERVER_URL")]
    pub server_url: String,

    /// Operator credential for the control plane
    #[arg(long, env = "TUNNEL_API_KEY")]
    pub api_key: String,

    /// Header name carrying the credential
    #[arg(long, env = "TUNNEL_AUTH_HEADER", default_value = "x-api-key")]
    pub auth_header: String,

    /// Host of the local origin to expose
    #[arg(long, env = "TUNNEL_LOCAL_HOST", default_value = "127.0.0.1")]
    pub local_host: String,

    /// Port of the local origin to expose
    #[arg(long, env = "TUNNEL_LOCAL_PORT")]
    pub local_port: u16,

    /// Scheme used against the local origin
    #[arg(long, env = "TUNNEL_LOCAL_SCHEME", default_value = "http")]
    pub local_scheme: String,

    /// Human-readable tunnel name shown by the control plane
    #[arg(long, env = "TUNNEL_NAME")]
    pub name: Option<String>,

    /// Free-form metadata, repeatable: --metadata key=value
    #[arg(long = "metadata", value_name = "KEY=VALUE", value_parser = parse_key_value)]
    pub metadata: Vec<(String, String)>,

    /// Attach to a pre-issued tunnel instead of creating one
    #[arg(long, env = "TUNNEL_ID", requires = "auth_token")]
    pub tunnel_id: Option<String>,

    /// Attach token that goes with --tunnel-id
    #[arg(long, env = "TUNNEL_AUTH_TOKEN", requires = "tunnel_id")]
    pub auth_token: Option<String>,

    /// Timeout for each local origin call, in seconds. Kept a little
    /// under the server's request timeout so the agent answers before
    /// the server gives up.
    #[arg(long, env = "TUNNEL_LOCAL_TIMEOUT_SECS", default_value_t = 28)]
    pub local_timeout_secs: u64,

    /// Seconds between heartbeat pings on an otherwise idle connection
    #[arg(long, default_value_t = 10)]
    pub heartbeat_interval_secs: u64,

    /// Unanswered pings before the connection is considered dead
    #[arg(long, default_value_t = 3)]
    pub heartbeat_miss_threshold: u32,

    /// Grace window for draining in-flight local calls on shutdown, seconds
    #[arg(long, default_value_t = 5)]
    pub drain_grace_secs: u64,

    /// Largest frame accepted from the server
    #[arg(long, default_value_t = tunnel_protocol::DEFAULT_MAX_FRAME_BYTES)]
    pub max_frame_bytes: usize,
}

impl Cli {
    /// Base URL of the local origin, e.g. `http://127.0.0.1:3000`.
    pub fn local_origin(&self) -> String {
        format!(
            "{}://{}:{}",
            self.local_scheme, self.local_host, self.local_port
        )
    }

    /// WebSocket URL of the transport endpoint for a tunnel id.
    pub fn connect_url(&self, tunnel_id: &str) -> String {
        let base = self.server_url.trim_end_matches('/');
        let ws_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            base.to_string()
        };
        format!("{ws_base}/api/tunnel/connect/{tunnel_id}")
    }

    pub fn local_timeout(&self) -> Duration {
        Duration::from_secs(self.local_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn drain_grace(&self) -> Duration {
        Duration::from_secs(self.drain_grace_secs)
    }
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got `{s}`"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> Vec<&'static str> {
        vec![
            "tunnel-agent",
            "--server-url",
            "http://tunnel.example.com:7070",
            "--api-key",
            "secret",
            "--local-port",
            "3000",
        ]
    }

    #[test]
    fn minimal_invocation_parses_with_defaults() {
        let cli = Cli::try_parse_from(base_args()).unwrap();
        assert_eq!(cli.local_origin(), "http://127.0.0.1:3000");
        assert_eq!(cli.auth_header, "x-api-key");
        assert_eq!(cli.local_timeout_secs, 28);
        assert_eq!(cli.heartbeat_miss_threshold, 3);
    }

    #[test]
    fn connect_url_switches_to_websocket_schemes() {
        let cli = Cli::try_parse_from(base_args()).unwrap();
        assert_eq!(
            cli.connect_url("deadbeef00000000"),
            "ws://tunnel.example.com:7070/api/tunnel/connect/deadbeef00000000"
        );

        let mut https = base_args();
        https[2] = "https://tunnel.example.com/";
        let cli = Cli::try_parse_from(https).unwrap();
        assert_eq!(
            cli.connect_url("abc"),
            "wss://tunnel.example.com/api/tunnel/connect/abc"
        );
    }

    #[test]
    fn metadata_entries_parse_as_pairs() {
        let mut args = base_args();
        args.extend(["--metadata", "team=infra", "--metadata", "env=dev"]);
        let cli = Cli::try_parse_from(args).unwrap();
        assert_eq!(
            cli.metadata,
            vec![
                ("team".to_string(), "infra".to_string()),
                ("env".to_string(), "dev".to_string())
            ]
        );

        let mut bad = base_args();
        bad.extend(["--metadata", "no-equals-sign"]);
        assert!(Cli::try_parse_from(bad).is_err());
    }

    #[test]
    fn pre_issued_mode_requires_both_halves() {
        let mut args = base_args();
        args.extend(["--tunnel-id", "abc"]);
        assert!(Cli::try_parse_from(args).is_err(), "--tunnel-id needs --auth-token");
    }
}
