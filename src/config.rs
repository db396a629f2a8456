//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables**: `PORTRELAY_RELAY_URL`, `PORTRELAY_IDENTITY`,
//!    `PORTRELAY_LOCAL_PORT`
//! 2. **Config file**: path via `--config <path>`, or `portrelay.toml` in CWD
//! 3. **Compiled defaults**: see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [agent]
//! identity = "printer-7f3a"                 # opaque, sent in the handshake
//!
//! [relay]
//! url = "wss://relay.example.com/agent"
//! heartbeat_interval_secs = 30
//! backoff_floor_secs = 1
//! backoff_cap_secs = 180
//! primary_run_for_secs = 169200             # 47 h
//! secondary_run_for_secs = 900              # 15 min
//!
//! [local]
//! host = "127.0.0.1"
//! port = 80
//! proxy_port = 443                          # optional reverse proxy
//! proxy_scheme = "https"
//! webcam_fallback_port = 8080
//!
//! [logging]
//! level = "info"
//! ```

use serde::Deserialize;
use std::path::Path;

use crate::error::ConfigError;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub local: LocalConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Identity presented to the relay during the handshake.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Opaque agent identity (default `portrelay-unregistered`).
    #[serde(default = "default_identity")]
    pub identity: String,
    /// Version string reported to the relay (default: crate version).
    #[serde(default = "default_version")]
    pub version: String,
}

/// Relay endpoint, reconnect policy, and connection recycling.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// Primary relay WebSocket URL.
    #[serde(default = "default_relay_url")]
    pub url: String,
    /// Seconds between WebSocket pings on the relay socket (default 30).
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    /// Initial reconnect delay (default 1).
    #[serde(default = "default_backoff_floor")]
    pub backoff_floor_secs: u64,
    /// Reconnect delay ceiling (default 180).
    #[serde(default = "default_backoff_cap")]
    pub backoff_cap_secs: u64,
    /// Lower bound of the random jitter added to each reconnect delay (default 2).
    #[serde(default = "default_jitter_min")]
    pub jitter_min_secs: u64,
    /// Upper bound of the random jitter (default 10).
    #[serde(default = "default_jitter_max")]
    pub jitter_max_secs: u64,
    /// Lifetime of the primary connection before it is recycled (default 47 h).
    #[serde(default = "default_primary_run_for")]
    pub primary_run_for_secs: u64,
    /// Lifetime of a summoned connection (default 15 min).
    #[serde(default = "default_secondary_run_for")]
    pub secondary_run_for_secs: u64,
    /// Required idle time before an expired connection is recycled (default 10 min).
    #[serde(default = "default_min_quiet")]
    pub min_quiet_secs: u64,
    /// Past this overrun the connection is recycled even if busy (default 2 h).
    #[serde(default = "default_max_overrun")]
    pub max_overrun_secs: u64,
    /// How often a live connection checks its RunFor budget (default 120).
    #[serde(default = "default_run_for_check_interval")]
    pub run_for_check_interval_secs: u64,
}

/// Local services the tunnel proxies to.
#[derive(Debug, Clone, Deserialize)]
pub struct LocalConfig {
    /// Loopback address of the local web service (default `127.0.0.1`).
    #[serde(default = "default_local_host")]
    pub host: String,
    /// Port of the local web service (default 80).
    #[serde(default = "default_local_port")]
    pub port: u16,
    /// Port of a local reverse proxy in front of the service, if any.
    #[serde(default)]
    pub proxy_port: Option<u16>,
    /// Scheme spoken by the reverse proxy (default `http`).
    #[serde(default = "default_proxy_scheme")]
    pub proxy_scheme: String,
    /// Hardcoded webcam server port tried last for `/webcam...` paths (default 8080).
    #[serde(default = "default_webcam_port")]
    pub webcam_fallback_port: u16,
    /// LAN address override; detected from the routing table when unset.
    #[serde(default)]
    pub lan_ip: Option<String>,
    /// Local HTTP request timeout (default 1800).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// How long a WebSocket stream waits for its local socket to open (default 10).
    #[serde(default = "default_ws_open_timeout")]
    pub ws_open_timeout_secs: u64,
}

/// Logging settings.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter directive (default `info`). `RUST_LOG` takes precedence.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_identity() -> String {
    "portrelay-unregistered".to_string()
}
fn default_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}
fn default_relay_url() -> String {
    "wss://relay.portrelay.net/agent".to_string()
}
fn default_heartbeat_interval() -> u64 {
    30
}
fn default_backoff_floor() -> u64 {
    1
}
fn default_backoff_cap() -> u64 {
    180
}
fn default_jitter_min() -> u64 {
    2
}
fn default_jitter_max() -> u64 {
    10
}
fn default_primary_run_for() -> u64 {
    47 * 60 * 60
}
fn default_secondary_run_for() -> u64 {
    15 * 60
}
fn default_min_quiet() -> u64 {
    10 * 60
}
fn default_max_overrun() -> u64 {
    2 * 60 * 60
}
fn default_run_for_check_interval() -> u64 {
    120
}
fn default_local_host() -> String {
    "127.0.0.1".to_string()
}
fn default_local_port() -> u16 {
    80
}
fn default_proxy_scheme() -> String {
    "http".to_string()
}
fn default_webcam_port() -> u16 {
    8080
}
fn default_request_timeout() -> u64 {
    1800
}
fn default_ws_open_timeout() -> u64 {
    10
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            identity: default_identity(),
            version: default_version(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            url: default_relay_url(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            backoff_floor_secs: default_backoff_floor(),
            backoff_cap_secs: default_backoff_cap(),
            jitter_min_secs: default_jitter_min(),
            jitter_max_secs: default_jitter_max(),
            primary_run_for_secs: default_primary_run_for(),
            secondary_run_for_secs: default_secondary_run_for(),
            min_quiet_secs: default_min_quiet(),
            max_overrun_secs: default_max_overrun(),
            run_for_check_interval_secs: default_run_for_check_interval(),
        }
    }
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            host: default_local_host(),
            port: default_local_port(),
            proxy_port: None,
            proxy_scheme: default_proxy_scheme(),
            webcam_fallback_port: default_webcam_port(),
            lan_ip: None,
            request_timeout_secs: default_request_timeout(),
            ws_open_timeout_secs: default_ws_open_timeout(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl LocalConfig {
    /// True when the reverse proxy is configured to speak TLS.
    pub fn proxy_is_https(&self) -> bool {
        self.proxy_scheme.eq_ignore_ascii_case("https")
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, that file must exist. Otherwise looks for
    /// `portrelay.toml` in the current directory, falling back to compiled defaults.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = if let Some(p) = path {
            Self::from_file(p)?
        } else if Path::new("portrelay.toml").exists() {
            Self::from_file("portrelay.toml")?
        } else {
            Config::default()
        };

        // Env var overrides
        if let Ok(url) = std::env::var("PORTRELAY_RELAY_URL") {
            config.relay.url = url;
        }
        if let Ok(identity) = std::env::var("PORTRELAY_IDENTITY") {
            config.agent.identity = identity;
        }
        if let Ok(port) = std::env::var("PORTRELAY_LOCAL_PORT") {
            config.local.port = port.parse().map_err(|_| ConfigError::InvalidValue {
                key: "PORTRELAY_LOCAL_PORT",
                value: port,
            })?;
        }

        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Self::parse(&content).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }

    /// Parse a TOML document, filling omitted fields with defaults.
    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }
}
