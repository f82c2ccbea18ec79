//! Server configuration.
//!
//! Configuration is layered, later sources winning:
//! - Built-in defaults (`SWITCHBOARD_HOST`/`SWITCHBOARD_PORT` seed host and port)
//! - A TOML file: the `--config` path, or the first of [`DEFAULT_CONFIG_PATHS`] that exists
//! - Environment variables `SWITCHBOARD_<SECTION>__<KEY>`, e.g. `SWITCHBOARD_LIMITS__MAX_CONNECTIONS`

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use switchboard_core::InstanceConfig;

/// Files probed when no `--config` path is given.
pub const DEFAULT_CONFIG_PATHS: [&str; 3] = [
    "switchboard.toml",
    "/etc/switchboard/switchboard.toml",
    "~/.config/switchboard/switchboard.toml",
];

/// Prefix of configuration environment variables.
const ENV_PREFIX: &str = "SWITCHBOARD";

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Shared state backends.
    #[serde(default)]
    pub backend: BackendConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path of the WebSocket upgrade endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of concurrent connections on this instance.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Payloads that may queue for one connection's writer.
    #[serde(default = "default_outbound_queue_capacity")]
    pub outbound_queue_capacity: usize,
}

/// Which backends hold presence, mailboxes and the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// In-process; only one instance can run.
    Memory,
    /// Shared Redis server.
    Redis,
}

/// Backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Backend kind.
    #[serde(default = "default_backend_kind")]
    pub kind: BackendKind,

    /// Redis connection URL.
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Pub/sub channel carrying bus frames.
    #[serde(default = "default_bus_channel")]
    pub bus_channel: String,

    /// Suffix appended to a user ID to form its mailbox key.
    #[serde(default = "default_mailbox_suffix")]
    pub mailbox_suffix: String,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_host() -> String {
    std::env::var("SWITCHBOARD_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("SWITCHBOARD_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080)
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/read".to_string()
}

fn default_max_connections() -> usize {
    100_000
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_outbound_queue_capacity() -> usize {
    switchboard_core::instance::DEFAULT_OUTBOUND_QUEUE_CAPACITY
}

fn default_backend_kind() -> BackendKind {
    BackendKind::Memory
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379/".to_string()
}

fn default_bus_channel() -> String {
    switchboard_backend::DEFAULT_BUS_CHANNEL.to_string()
}

fn default_mailbox_suffix() -> String {
    switchboard_backend::DEFAULT_MAILBOX_SUFFIX.to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            limits: LimitsConfig::default(),
            backend: BackendConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_message_size: default_max_message_size(),
            outbound_queue_capacity: default_outbound_queue_capacity(),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: default_backend_kind(),
            redis_url: default_redis_url(),
            bus_channel: default_bus_channel(),
            mailbox_suffix: default_mailbox_suffix(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from `path`, or the first default path that exists,
    /// with environment overrides on top.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file cannot be read or parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => Some(path.to_path_buf()),
            None => Self::find_default_file(),
        };
        Self::build(file.as_deref(), true)
    }

    /// Load configuration from a specific file, without environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::build(Some(path.as_ref()), false)
    }

    fn find_default_file() -> Option<PathBuf> {
        DEFAULT_CONFIG_PATHS.iter().find_map(|path| {
            let expanded = PathBuf::from(shellexpand::tilde(path).into_owned());
            expanded.exists().then_some(expanded)
        })
    }

    fn build(file: Option<&Path>, with_env: bool) -> Result<Self> {
        let mut builder = ::config::Config::builder();

        if let Some(file) = file {
            if !file.exists() {
                anyhow::bail!("Config file not found: {}", file.display());
            }
            builder = builder.add_source(
                ::config::File::from(file).format(::config::FileFormat::Toml),
            );
        }

        if with_env {
            builder = builder.add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );
        }

        let source = match file {
            Some(file) => file.display().to_string(),
            None => "environment".to_string(),
        };

        builder
            .build()
            .and_then(|built| built.try_deserialize::<Self>())
            .with_context(|| format!("Failed to load config from {source}"))
    }

    /// Render the configuration as TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    /// Per-instance settings derived from the limits.
    #[must_use]
    pub fn instance_config(&self) -> InstanceConfig {
        InstanceConfig {
            outbound_queue_capacity: self.limits.outbound_queue_capacity.max(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.transport.websocket_path, "/read");
        assert_eq!(config.backend.kind, BackendKind::Memory);
        assert_eq!(config.backend.bus_channel, "switchboard:bus");
        assert_eq!(config.backend.mailbox_suffix, ":mailbox");
        assert_eq!(config.limits.outbound_queue_capacity, 256);
    }

    #[test]
    fn test_config_bind_addr() {
        let mut config = Config::default();
        config.host = "127.0.0.1".into();
        config.port = 8080;
        assert_eq!(config.bind_addr().unwrap().port(), 8080);

        config.host = "not a host".into();
        assert!(config.bind_addr().is_err());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            host = "0.0.0.0"
            port = 9000

            [limits]
            max_connections = 50000

            [backend]
            kind = "redis"
            redis_url = "redis://cache:6379/2"
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.limits.max_connections, 50000);
        assert_eq!(config.limits.max_message_size, 64 * 1024);
        assert_eq!(config.backend.kind, BackendKind::Redis);
        assert_eq!(config.backend.redis_url, "redis://cache:6379/2");
        assert_eq!(config.backend.bus_channel, "switchboard:bus");
    }

    #[test]
    fn test_config_from_file() {
        let path = std::env::temp_dir().join(format!(
            "switchboard-config-test-{}.toml",
            std::process::id()
        ));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "port = 7000\n[transport]\nwebsocket_path = \"/ws\"").unwrap();

        let config = Config::from_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.port, 7000);
        assert_eq!(config.transport.websocket_path, "/ws");
    }

    #[test]
    fn test_missing_config_file_is_an_error() {
        assert!(Config::from_file("/nonexistent/switchboard.toml").is_err());
    }

    #[test]
    fn test_config_renders_as_toml() {
        let rendered = Config::default().to_toml().unwrap();
        let parsed: Config = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed.transport.websocket_path, "/read");
    }

    #[test]
    fn test_zero_queue_capacity_is_clamped() {
        let mut config = Config::default();
        config.limits.outbound_queue_capacity = 0;
        assert_eq!(config.instance_config().outbound_queue_capacity, 1);
    }
}
