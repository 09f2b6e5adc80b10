//! # Server Configuration
//!
//! All tunables come from the environment, with the defaults given in the
//! protocol documentation. `Config::from_env` is called once at startup;
//! a parse failure is a startup failure (exit code 2), never a runtime one.

use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use tunnel_protocol::DEFAULT_MAX_FRAME_BYTES;

/// Default cap on a fully-buffered proxied request body.
pub const DEFAULT_MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Timestamp zone used by the log formatter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogTimezone {
    Utc,
    Local,
}

impl FromStr for LogTimezone {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "utc" => Ok(LogTimezone::Utc),
            "local" => Ok(LogTimezone::Local),
            other => Err(format!("expected `utc` or `local`, got `{other}`")),
        }
    }
}

/// Runtime configuration, resolved once from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port the public HTTP listener binds on.
    pub port: u16,

    /// Base URL advertised in create responses (`{base}/{tunnel_id}`).
    pub public_base_url: String,

    /// Operator credential for the control plane.
    pub api_key: String,

    /// Optional second credential with the same rights as the operator key.
    pub admin_key: Option<String>,

    /// Header carrying the operator credential.
    pub auth_header: String,

    /// How long a proxied request may wait for the agent's response.
    pub request_timeout: Duration,

    /// Maximum number of tunnel descriptors; create fails beyond this.
    pub max_tunnels: usize,

    /// Interval between heartbeat pings on an idle session.
    pub heartbeat_interval: Duration,

    /// Consecutive unanswered pings before the session is torn down.
    pub heartbeat_miss_threshold: u32,

    /// Period of the idle-tunnel sweeper.
    pub sweep_interval: Duration,

    /// Unattached descriptors idle longer than this are swept.
    pub idle_timeout: Duration,

    /// Upper bound on a single encoded frame.
    pub max_frame_bytes: usize,

    /// Upper bound on a buffered proxied request body (413 beyond).
    pub max_body_bytes: usize,

    /// In-flight request cap per session (TUNNEL_BUSY beyond).
    pub max_inflight_per_session: usize,

    /// Deployment environment label, reported by `/health`.
    pub environment: String,

    /// Default tracing filter when `RUST_LOG` is not set.
    pub log_level: String,

    /// Timestamp zone for log lines.
    pub log_timezone: LogTimezone,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("required environment variable `{0}` is not set")]
    Missing(&'static str),

    #[error("environment variable `{name}` has invalid value `{value}`: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

impl Config {
    /// Reads the full configuration from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let port: u16 = parsed_var("PORT", 7070)?;
        Ok(Config {
            public_base_url: string_var("PUBLIC_BASE_URL")
                .unwrap_or_else(|| format!("http://localhost:{port}")),
            port,
            api_key: string_var("API_KEY").ok_or(ConfigError::Missing("API_KEY"))?,
            admin_key: string_var("ADMIN_KEY"),
            auth_header: string_var("AUTH_HEADER").unwrap_or_else(|| "x-api-key".into()),
            request_timeout: Duration::from_secs(parsed_var("REQUEST_TIMEOUT_SECS", 30)?),
            max_tunnels: parsed_var("MAX_TUNNELS", 100)?,
            heartbeat_interval: Duration::from_secs(parsed_var("HEARTBEAT_INTERVAL_SECS", 10)?),
            heartbeat_miss_threshold: parsed_var("HEARTBEAT_MISS_THRESHOLD", 3)?,
            sweep_interval: Duration::from_secs(parsed_var("SWEEP_INTERVAL_SECS", 60)?),
            idle_timeout: Duration::from_secs(parsed_var("IDLE_TIMEOUT_SECS", 120)?),
            max_frame_bytes: parsed_var("MAX_FRAME_BYTES", DEFAULT_MAX_FRAME_BYTES)?,
            max_body_bytes: parsed_var("MAX_BODY_BYTES", DEFAULT_MAX_BODY_BYTES)?,
            max_inflight_per_session: parsed_var("MAX_INFLIGHT_PER_SESSION", 128)?,
            environment: string_var("ENVIRONMENT").unwrap_or_else(|| "development".into()),
            log_level: string_var("LOG_LEVEL").unwrap_or_else(|| "tunnel_server=info".into()),
            log_timezone: parsed_var("LOG_TIMEZONE", LogTimezone::Utc)?,
        })
    }
}

fn string_var(name: &'static str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.is_empty())
}

fn parsed_var<T>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match string_var(name) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
            name,
            value: raw,
            reason: e.to_string(),
        }),
    }
}

/// Test constructor with short timings and a known operator key, used by
/// the unit and integration suites.
impl Config {
    pub fn for_tests() -> Self {
        Config {
            port: 0,
            public_base_url: "http://localhost:0".into(),
            api_key: "operator-key".into(),
            admin_key: None,
            auth_header: "x-api-key".into(),
            request_timeout: Duration::from_secs(2),
            max_tunnels: 100,
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_miss_threshold: 3,
            sweep_interval: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(120),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            max_inflight_per_session: 128,
            environment: "test".into(),
            log_level: "tunnel_server=info".into(),
            log_timezone: LogTimezone::Utc,
        }
    }
}

/// Free-form tunnel metadata is bounded; these are the limits `create`
/// enforces.
pub const MAX_METADATA_ENTRIES: usize = 16;
pub const MAX_METADATA_BYTES: usize = 256;

/// Validates a metadata mapping against the bounds above.
pub fn metadata_within_bounds(metadata: &HashMap<String, String>) -> bool {
    metadata.len() <= MAX_METADATA_ENTRIES
        && metadata
            .iter()
            .all(|(k, v)| k.len() <= MAX_METADATA_BYTES && v.len() <= MAX_METADATA_BYTES)
}
