//! Server configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (COURIER_*)
//! - TOML configuration file
//!
//! The `[[users]]` and `[[groups]]` sections seed the bundled in-memory
//! identity/persistence store; a deployment with a real backend ignores
//! them.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Path for the WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub ws_path: String,

    /// Engine tuning.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Heartbeat configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Seed accounts for the in-memory store.
    #[serde(default)]
    pub users: Vec<SeedUser>,

    /// Seed groups for the in-memory store, members by username.
    #[serde(default)]
    pub groups: Vec<SeedGroup>,
}

/// Engine tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Outbound buffer per connection.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Per-channel send timeout in milliseconds.
    #[serde(default = "default_send_timeout")]
    pub send_timeout_ms: u64,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Recommended client keepalive interval in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable Prometheus export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

/// A seeded account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedUser {
    pub username: String,
    pub token: String,
}

/// A seeded group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedGroup {
    pub name: String,
    #[serde(default)]
    pub members: Vec<String>,
}

// Default value functions
fn default_host() -> String {
    std::env::var("COURIER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("COURIER_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(7700)
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_true() -> bool {
    true
}

fn default_channel_capacity() -> usize {
    256
}

fn default_send_timeout() -> u64 {
    5_000
}

fn default_heartbeat_interval() -> u64 {
    30_000
}

fn default_metrics_port() -> u16 {
    9290
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            ws_path: default_ws_path(),
            engine: EngineConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            metrics: MetricsConfig::default(),
            users: Vec::new(),
            groups: Vec::new(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
            send_timeout_ms: default_send_timeout(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval(),
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
    /// Load configuration from the first config file found, or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        let config_paths = [
            "courier.toml",
            "/etc/courier/courier.toml",
            "~/.config/courier/courier.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        Ok(Self::default())
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

    /// The socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host/port do not form a valid address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.ws_path, "/ws");
        assert!(config.metrics.enabled);
        assert!(config.users.is_empty());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            host = "0.0.0.0"
            port = 9000

            [engine]
            channel_capacity = 64

            [[users]]
            username = "alice"
            token = "alice-token"

            [[groups]]
            name = "team"
            members = ["alice"]
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.engine.channel_capacity, 64);
        assert_eq!(config.users.len(), 1);
        assert_eq!(config.groups[0].members, vec!["alice"]);
    }

    #[test]
    fn test_bind_addr() {
        let config = Config {
            host: "127.0.0.1".into(),
            port: 7700,
            ..Config::default()
        };
        assert_eq!(config.bind_addr().unwrap().port(), 7700);
    }
}
