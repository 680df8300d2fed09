//! # Sync Configuration
//!
//! Configuration management for the edge client and the central node.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     TELESYNC_BROKER_URL=mqtts://broker.example:8883                    │
//! │     TELESYNC_DEVICE_ID=greenhouse-3                                    │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/telesync/telesync.toml (Linux)                           │
//! │     ~/Library/Application Support/io.telesync.telesync/ (macOS)        │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │     mqtt://localhost:1883, auto-generated device id                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! [device]
//! id = "greenhouse-3"
//! name = "Greenhouse sensor"
//!
//! [broker]
//! url = "mqtts://broker.example:8883"
//! username = "edge"
//! password = "secret"
//! ca_cert_path = "/etc/telesync/ca.pem"
//! topic_prefix = "site-a"
//!
//! [backoff]
//! initial_ms = 500
//! max_ms = 60000
//!
//! [publish]
//! max_in_flight = 32
//! ack_timeout_ms = 10000
//!
//! [buffer]
//! capacity = 100000
//!
//! [bridge]
//! port = 8787
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Device Configuration
// =============================================================================

/// Configuration for this device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device identifier. Used as `device_id` of captured events and as
    /// `source_id` on `system/status`. Auto-generated if not provided.
    pub id: String,

    /// Human-readable device name.
    #[serde(default = "default_device_name")]
    pub name: String,
}

fn default_device_name() -> String {
    "Telemetry Device".to_string()
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            id: Uuid::new_v4().to_string(),
            name: default_device_name(),
        }
    }
}

// =============================================================================
// Broker Settings
// =============================================================================

/// How to reach and authenticate against the MQTT broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerSettings {
    /// `mqtt://host:port` or `mqtts://host:port`.
    #[serde(default = "default_broker_url")]
    pub url: String,

    /// MQTT client id. Defaults to `telesync-{device.id}`.
    #[serde(default)]
    pub client_id: Option<String>,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// CA bundle (PEM) used to verify the broker. Required for `mqtts://`.
    #[serde(default)]
    pub ca_cert_path: Option<PathBuf>,

    /// Client certificate (PEM) for mutual TLS.
    #[serde(default)]
    pub client_cert_path: Option<PathBuf>,

    /// Client private key (PEM) for mutual TLS.
    #[serde(default)]
    pub client_key_path: Option<PathBuf>,

    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Prepended to every topic (`{prefix}/telemetry/data`). Empty = none.
    #[serde(default)]
    pub topic_prefix: String,
}

fn default_broker_url() -> String {
    "mqtt://localhost:1883".to_string()
}
fn default_keep_alive() -> u64 {
    30
}
fn default_connect_timeout() -> u64 {
    10
}

impl Default for BrokerSettings {
    fn default() -> Self {
        BrokerSettings {
            url: default_broker_url(),
            client_id: None,
            username: None,
            password: None,
            ca_cert_path: None,
            client_cert_path: None,
            client_key_path: None,
            keep_alive_secs: default_keep_alive(),
            connect_timeout_secs: default_connect_timeout(),
            topic_prefix: String::new(),
        }
    }
}

impl BrokerSettings {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

// =============================================================================
// Backoff Settings
// =============================================================================

/// Reconnect pacing for the broker link.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffSettings {
    /// Base delay of the first retry (milliseconds).
    #[serde(default = "default_initial_backoff")]
    pub initial_ms: u64,

    /// Cap on any single delay (milliseconds).
    #[serde(default = "default_max_backoff")]
    pub max_ms: u64,

    /// Consecutive failed reconnects before reporting degraded health.
    /// Set to 0 to never report.
    #[serde(default = "default_degraded_after")]
    pub degraded_after_attempts: u32,
}

fn default_initial_backoff() -> u64 {
    500
}
fn default_max_backoff() -> u64 {
    60_000
}
fn default_degraded_after() -> u32 {
    20
}

impl Default for BackoffSettings {
    fn default() -> Self {
        BackoffSettings {
            initial_ms: default_initial_backoff(),
            max_ms: default_max_backoff(),
            degraded_after_attempts: default_degraded_after(),
        }
    }
}

impl BackoffSettings {
    pub fn initial(&self) -> Duration {
        Duration::from_millis(self.initial_ms)
    }

    pub fn max(&self) -> Duration {
        Duration::from_millis(self.max_ms)
    }
}

// =============================================================================
// Publish Settings
// =============================================================================

/// Publish pipeline pacing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishSettings {
    /// In-flight window: at most this many unacknowledged publishes.
    /// Also the batch size taken from the buffer.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: u32,

    /// How long to wait for a broker PubAck (milliseconds).
    #[serde(default = "default_ack_timeout")]
    pub ack_timeout_ms: u64,

    /// Idle poll interval when no capture wake-up arrives (milliseconds).
    /// Also the status tick of the edge agent.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// How long shutdown waits for outstanding acks (milliseconds).
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_ms: u64,
}

fn default_max_in_flight() -> u32 {
    32
}
fn default_ack_timeout() -> u64 {
    10_000
}
fn default_poll_interval() -> u64 {
    1_000
}
fn default_shutdown_grace() -> u64 {
    5_000
}

impl Default for PublishSettings {
    fn default() -> Self {
        PublishSettings {
            max_in_flight: default_max_in_flight(),
            ack_timeout_ms: default_ack_timeout(),
            poll_interval_ms: default_poll_interval(),
            shutdown_grace_ms: default_shutdown_grace(),
        }
    }
}

impl PublishSettings {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

// =============================================================================
// Buffer Settings
// =============================================================================

/// Durable buffer store location and capacity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferSettings {
    /// SQLite file. Defaults to `buffer.db` in the platform data directory.
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Maximum retained records (PENDING + IN_FLIGHT).
    #[serde(default = "default_capacity")]
    pub capacity: u64,

    /// Consecutive status ticks with new evictions before reporting
    /// degraded health. Set to 0 to never report.
    #[serde(default = "default_eviction_ticks")]
    pub degraded_after_eviction_ticks: u32,
}

fn default_capacity() -> u64 {
    100_000
}
fn default_eviction_ticks() -> u32 {
    3
}

impl Default for BufferSettings {
    fn default() -> Self {
        BufferSettings {
            path: None,
            capacity: default_capacity(),
            degraded_after_eviction_ticks: default_eviction_ticks(),
        }
    }
}

// =============================================================================
// Bridge Settings
// =============================================================================

/// Delivery bridge settings (central node only).
///
/// ## Bridge Tuning
/// ```text
/// ┌─────────────────────────────────────────────────────────────────────────┐
/// │                       Bridge Settings                                   │
/// │                                                                         │
/// │  dedup_window     How many recent event ids are remembered. A broker   │
/// │                   redelivery older than this is forwarded again.        │
/// │                                                                         │
/// │  subscriber_queue Per-subscriber outbound queue. On overflow the        │
/// │                   oldest queued event is dropped and counted.           │
/// │                                                                         │
/// │  reorder_hold_ms  How long an out-of-order event waits for the gap      │
/// │                   before it is released anyway. 0 disables reordering.  │
/// └─────────────────────────────────────────────────────────────────────────┘
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeSettings {
    /// Bind address (default: 0.0.0.0 for all interfaces).
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Port for the WebSocket endpoint.
    #[serde(default = "default_bridge_port")]
    pub port: u16,

    #[serde(default = "default_dedup_window")]
    pub dedup_window: usize,

    #[serde(default = "default_subscriber_queue")]
    pub subscriber_queue: usize,

    #[serde(default = "default_reorder_hold")]
    pub reorder_hold_ms: u64,
}

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}
fn default_bridge_port() -> u16 {
    8787
}
fn default_dedup_window() -> usize {
    10_000
}
fn default_subscriber_queue() -> usize {
    256
}
fn default_reorder_hold() -> u64 {
    200
}

impl Default for BridgeSettings {
    fn default() -> Self {
        BridgeSettings {
            bind_addr: default_bind_addr(),
            port: default_bridge_port(),
            dedup_window: default_dedup_window(),
            subscriber_queue: default_subscriber_queue(),
            reorder_hold_ms: default_reorder_hold(),
        }
    }
}

impl BridgeSettings {
    /// Returns the full bind address.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }

    pub fn reorder_hold(&self) -> Duration {
        Duration::from_millis(self.reorder_hold_ms)
    }
}

// =============================================================================
// Main Sync Configuration
// =============================================================================

/// Complete sync configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub device: DeviceConfig,

    #[serde(default)]
    pub broker: BrokerSettings,

    #[serde(default)]
    pub backoff: BackoffSettings,

    #[serde(default)]
    pub publish: PublishSettings,

    #[serde(default)]
    pub buffer: BufferSettings,

    #[serde(default)]
    pub bridge: BridgeSettings,
}

impl SyncConfig {
    /// Creates a new config with defaults and a generated device ID.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (telesync.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_path) {
            if path.exists() {
                info!(?path, "Loading sync config from file");
                let contents = std::fs::read_to_string(&path)
                    .map_err(|e| SyncError::ConfigLoadFailed(e.to_string()))?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load sync config: {}. Using defaults.", e);
            Self::default()
        })
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        let path = config_path
            .or_else(Self::default_path)
            .ok_or_else(|| SyncError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SyncError::ConfigSaveFailed(e.to_string()))?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents).map_err(|e| SyncError::ConfigSaveFailed(e.to_string()))?;

        info!(?path, "Sync config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        if self.device.id.is_empty() {
            return Err(SyncError::MissingDeviceId);
        }
        telesync_core::validation::validate_device_id(&self.device.id)
            .map_err(|e| SyncError::InvalidConfig(e.to_string()))?;

        let url = url::Url::parse(&self.broker.url)?;
        match url.scheme() {
            "mqtt" => {}
            "mqtts" => {
                if self.broker.ca_cert_path.is_none() {
                    return Err(SyncError::InvalidConfig(
                        "mqtts:// requires broker.ca_cert_path".into(),
                    ));
                }
            }
            other => {
                return Err(SyncError::InvalidUrl(format!(
                    "Broker URL must start with mqtt:// or mqtts://, got: {}://",
                    other
                )))
            }
        }
        if url.host_str().is_none() {
            return Err(SyncError::InvalidUrl(format!(
                "Broker URL has no host: {}",
                self.broker.url
            )));
        }

        if self.broker.client_cert_path.is_some() != self.broker.client_key_path.is_some() {
            return Err(SyncError::InvalidConfig(
                "client_cert_path and client_key_path must be set together".into(),
            ));
        }

        if self.broker.topic_prefix.contains(['+', '#']) {
            return Err(SyncError::InvalidConfig(
                "topic_prefix must not contain MQTT wildcards".into(),
            ));
        }

        if self.backoff.initial_ms == 0 || self.backoff.initial_ms > self.backoff.max_ms {
            return Err(SyncError::InvalidConfig(
                "backoff requires 0 < initial_ms <= max_ms".into(),
            ));
        }

        if self.publish.max_in_flight == 0 {
            return Err(SyncError::InvalidConfig(
                "max_in_flight must be greater than 0".into(),
            ));
        }

        if self.publish.ack_timeout_ms == 0 {
            return Err(SyncError::InvalidConfig(
                "ack_timeout_ms must be greater than 0".into(),
            ));
        }

        if self.buffer.capacity == 0 {
            return Err(SyncError::InvalidConfig(
                "buffer capacity must be greater than 0".into(),
            ));
        }

        if self.bridge.dedup_window == 0 || self.bridge.subscriber_queue == 0 {
            return Err(SyncError::InvalidConfig(
                "dedup_window and subscriber_queue must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(id) = var("TELESYNC_DEVICE_ID") {
            debug!(device_id = %id, "Overriding device ID from environment");
            self.device.id = id;
        }

        if let Some(url) = var("TELESYNC_BROKER_URL") {
            debug!(url = %url, "Overriding broker URL from environment");
            self.broker.url = url;
        }

        if let Some(username) = var("TELESYNC_BROKER_USERNAME") {
            self.broker.username = Some(username);
        }

        if let Some(password) = var("TELESYNC_BROKER_PASSWORD") {
            self.broker.password = Some(password);
        }

        if let Some(prefix) = var("TELESYNC_TOPIC_PREFIX") {
            self.broker.topic_prefix = prefix;
        }

        if let Some(path) = var("TELESYNC_BUFFER_PATH") {
            self.buffer.path = Some(PathBuf::from(path));
        }

        if let Some(port) = var("TELESYNC_BRIDGE_PORT") {
            match port.parse::<u16>() {
                Ok(p) => {
                    debug!(port = p, "Overriding bridge port from environment");
                    self.bridge.port = p;
                }
                Err(_) => warn!(port = %port, "Ignoring invalid TELESYNC_BRIDGE_PORT"),
            }
        }
    }

    /// Returns the default config file path.
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("io", "telesync", "telesync")
            .map(|dirs| dirs.config_dir().join("telesync.toml"))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    /// Returns the device ID.
    pub fn device_id(&self) -> &str {
        &self.device.id
    }

    /// MQTT client id: configured, or derived from the device id.
    pub fn client_id(&self) -> String {
        self.broker
            .client_id
            .clone()
            .unwrap_or_else(|| format!("telesync-{}", self.device.id))
    }

    /// Resolved buffer file path.
    pub fn buffer_path(&self) -> SyncResult<PathBuf> {
        if let Some(path) = &self.buffer.path {
            return Ok(path.clone());
        }
        directories::ProjectDirs::from("io", "telesync", "telesync")
            .map(|dirs| dirs.data_dir().join("buffer.db"))
            .ok_or_else(|| SyncError::InvalidConfig("No data directory for buffer.path".into()))
    }
}
