//! Server configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (RELAY_HOST, RELAY_PORT, RELAY_MASTER_KEY)
//! - TOML configuration file

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tenvis_relay_core::{HubConfig, MqttSettings, DEFAULT_INBOUND_CAPACITY};

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Admin master key. Empty disables admin routes.
    #[serde(default = "default_master_key")]
    pub master_key: String,

    /// Durable file locations.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Broker session settings.
    #[serde(default)]
    pub broker: BrokerSettings,

    /// Socket fan-out settings.
    #[serde(default)]
    pub hub: HubSettings,

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

/// Durable file locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Broker config document.
    #[serde(default = "default_broker_configs")]
    pub broker_configs: PathBuf,

    /// Tenant key file, one key per line.
    #[serde(default = "default_key_file")]
    pub key_file: PathBuf,
}

/// Broker session settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerSettings {
    /// Upper bound on a broker connect in milliseconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// MQTT keep-alive in seconds.
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,

    /// MQTT client request channel capacity.
    #[serde(default = "default_request_capacity")]
    pub request_capacity: usize,

    /// Prefix for MQTT client IDs.
    #[serde(default = "default_client_id_prefix")]
    pub client_id_prefix: String,

    /// Capacity of the queue between broker links and the router.
    #[serde(default = "default_inbound_capacity")]
    pub inbound_capacity: usize,
}

/// Socket fan-out settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubSettings {
    /// Upper bound on one socket send in milliseconds.
    #[serde(default = "default_send_timeout")]
    pub send_timeout_ms: u64,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum request body size in bytes.
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Server ping interval in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,

    /// Close a socket whose peer has sent nothing, not even a pong, for this
    /// many milliseconds.
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
    std::env::var("RELAY_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("RELAY_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080)
}

fn default_master_key() -> String {
    std::env::var("RELAY_MASTER_KEY").unwrap_or_default()
}

fn default_true() -> bool {
    true
}

fn default_broker_configs() -> PathBuf {
    PathBuf::from("mqtt_configs.json")
}

fn default_key_file() -> PathBuf {
    PathBuf::from("api_keys.txt")
}

fn default_connect_timeout() -> u64 {
    10_000 // 10 seconds
}

fn default_keep_alive() -> u64 {
    60
}

fn default_request_capacity() -> usize {
    64
}

fn default_client_id_prefix() -> String {
    "relay".to_string()
}

fn default_inbound_capacity() -> usize {
    DEFAULT_INBOUND_CAPACITY
}

fn default_send_timeout() -> u64 {
    5_000
}

fn default_max_body_size() -> usize {
    1024 * 1024 // 1 MB
}

fn default_heartbeat_interval() -> u64 {
    30_000 // 30 seconds
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
            master_key: default_master_key(),
            storage: StorageConfig::default(),
            broker: BrokerSettings::default(),
            hub: HubSettings::default(),
            limits: LimitsConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            broker_configs: default_broker_configs(),
            key_file: default_key_file(),
        }
    }
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout(),
            keep_alive_secs: default_keep_alive(),
            request_capacity: default_request_capacity(),
            client_id_prefix: default_client_id_prefix(),
            inbound_capacity: default_inbound_capacity(),
        }
    }
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            send_timeout_ms: default_send_timeout(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_body_size: default_max_body_size(),
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

impl BrokerSettings {
    /// MQTT session settings for the link factory.
    #[must_use]
    pub fn mqtt_settings(&self) -> MqttSettings {
        MqttSettings {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            keep_alive: Duration::from_secs(self.keep_alive_secs),
            request_capacity: self.request_capacity,
            client_id_prefix: self.client_id_prefix.clone(),
            ..MqttSettings::default()
        }
    }
}

impl HubSettings {
    /// Hub configuration.
    #[must_use]
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            send_timeout: Duration::from_millis(self.send_timeout_ms),
        }
    }
}

impl Config {
    /// Load configuration from file or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        let config_paths = [
            "relay.toml",
            "/etc/relay/relay.toml",
            "~/.config/relay/relay.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        // Fall back to defaults with environment overrides
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

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address: {}:{}", self.host, self.port))
    }

    /// Server ping interval.
    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat.interval_ms.max(1))
    }

    /// Longest a peer may stay silent before its socket is closed.
    #[must_use]
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat.timeout_ms)
    }
}
