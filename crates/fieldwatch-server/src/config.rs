//! Server configuration.
//!
//! Configuration is layered, later sources overriding earlier ones:
//! - Built-in defaults (`PORT` / `HOST` are honoured for the listen address)
//! - TOML configuration file
//! - Environment variables (`FIELDWATCH_*`, `__` between nested keys)

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

/// Files searched, in order, when no explicit path is given.
const CONFIG_PATHS: [&str; 3] = [
    "fieldwatch.toml",
    "/etc/fieldwatch/fieldwatch.toml",
    "~/.config/fieldwatch/fieldwatch.toml",
];

/// Environment variable naming an explicit config file.
const CONFIG_PATH_ENV: &str = "FIELDWATCH_CONFIG";

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

    /// Heartbeat configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for the WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum number of projects with live members.
    #[serde(default = "default_max_projects")]
    pub max_projects: usize,

    /// Maximum inbound message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Outbound queue capacity per connection. Events beyond it are dropped
    /// for that connection only.
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Ping interval in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,

    /// Close connections silent for longer than this, in milliseconds.
    #[serde(default = "default_heartbeat_timeout")]
    pub timeout_ms: u64,
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
    std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string())
}

fn default_port() -> u16 {
    std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(3001)
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_max_connections() -> usize {
    100_000
}

fn default_max_projects() -> usize {
    10_000
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_outbound_buffer() -> usize {
    256
}

fn default_heartbeat_interval() -> u64 {
    25_000 // 25 seconds
}

fn default_heartbeat_timeout() -> u64 {
    60_000 // 60 seconds
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
            heartbeat: HeartbeatConfig::default(),
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
            max_projects: default_max_projects(),
            max_message_size: default_max_message_size(),
            outbound_buffer: default_outbound_buffer(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval(),
            timeout_ms: default_heartbeat_timeout(),
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
    /// Load configuration from the first config file found, then the
    /// environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or an
    /// environment override has the wrong type.
    pub fn load() -> Result<Self> {
        let explicit = std::env::var(CONFIG_PATH_ENV).ok();
        let candidates = explicit
            .iter()
            .map(String::as_str)
            .chain(CONFIG_PATHS.iter().copied());

        let mut builder = ::config::Config::builder();

        for path in candidates {
            let expanded = shellexpand::tilde(path);
            let path = Path::new(expanded.as_ref());
            if path.exists() {
                tracing::info!("Loading configuration from {}", path.display());
                builder = builder
                    .add_source(::config::File::from(path).format(::config::FileFormat::Toml));
                break;
            }
        }

        builder
            .add_source(
                ::config::Environment::with_prefix("FIELDWATCH")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to load configuration")?
            .try_deserialize()
            .context("Invalid configuration")
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if `host:port` is not a valid socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid listen address {}:{}", self.host, self.port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Mutex;

    // Tests that touch process-wide FIELDWATCH_* variables run one at a time.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn clear_env(keys: &[&str]) {
        for key in keys {
            std::env::remove_var(key);
        }
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.transport.websocket_path, "/ws");
        assert_eq!(config.limits.outbound_buffer, 256);
        assert!(config.heartbeat.timeout_ms > config.heartbeat.interval_ms);
    }

    #[test]
    fn test_config_bind_addr() {
        let config = Config {
            host: "127.0.0.1".to_string(),
            port: 3001,
            ..Config::default()
        };
        let addr = config.bind_addr().unwrap();
        assert_eq!(addr.port(), 3001);

        let bad = Config {
            host: "not a host".to_string(),
            ..Config::default()
        };
        assert!(bad.bind_addr().is_err());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            host = "127.0.0.1"
            port = 9000

            [limits]
            max_connections = 50000
            outbound_buffer = 32

            [heartbeat]
            interval_ms = 1000
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 9000);
        assert_eq!(config.limits.max_connections, 50000);
        assert_eq!(config.limits.outbound_buffer, 32);
        assert_eq!(config.limits.max_projects, 10_000);
        assert_eq!(config.heartbeat.interval_ms, 1000);
        assert_eq!(config.heartbeat.timeout_ms, 60_000);
    }

    #[test]
    fn test_from_file_reports_path() {
        let err = Config::from_file("/nonexistent/fieldwatch.toml").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/fieldwatch.toml"));
    }

    #[test]
    fn test_load_env_overrides_defaults() {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let keys = [
            CONFIG_PATH_ENV,
            "FIELDWATCH_LIMITS__OUTBOUND_BUFFER",
            "FIELDWATCH_TRANSPORT__WEBSOCKET_PATH",
        ];
        clear_env(&keys);

        std::env::set_var("FIELDWATCH_LIMITS__OUTBOUND_BUFFER", "7");
        std::env::set_var("FIELDWATCH_TRANSPORT__WEBSOCKET_PATH", "/field");
        let config = Config::load();
        clear_env(&keys);

        let config = config.unwrap();
        assert_eq!(config.limits.outbound_buffer, 7);
        assert_eq!(config.transport.websocket_path, "/field");
        assert_eq!(config.limits.max_connections, 100_000);
        assert_eq!(config.heartbeat.interval_ms, 25_000);
    }

    #[test]
    fn test_load_file_then_env() {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let keys = [CONFIG_PATH_ENV, "FIELDWATCH_LIMITS__MAX_PROJECTS"];
        clear_env(&keys);

        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
            [limits]
            max_projects = 12
            outbound_buffer = 16

            [heartbeat]
            timeout_ms = 90000
            "#
        )
        .unwrap();

        std::env::set_var(CONFIG_PATH_ENV, file.path());
        std::env::set_var("FIELDWATCH_LIMITS__MAX_PROJECTS", "34");
        let config = Config::load();
        clear_env(&keys);

        let config = config.unwrap();
        // From the file
        assert_eq!(config.limits.outbound_buffer, 16);
        assert_eq!(config.heartbeat.timeout_ms, 90_000);
        // Env wins over the file
        assert_eq!(config.limits.max_projects, 34);
        // Untouched keys keep their defaults
        assert_eq!(config.transport.websocket_path, "/ws");
    }
}
