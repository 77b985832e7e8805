//! Chain Configuration
//!
//! A [`ChainConfig`] describes one chain instance: a name, a security
//! mode, and one optional block per layer. The presence of a block
//! declares that the layer participates; its `critical` flag declares
//! whether the chain can be considered up without it.
//!
//! # File Format
//!
//! ```toml
//! name = "home"
//! security_mode = "hardened"
//!
//! [relay]
//! critical = true
//! server_host = "edge.example.net"
//! server_port = 443
//! sni = "www.example.com"
//!
//! [core]
//! critical = true
//! config_path = "/data/core.json"
//! outbound = "relay"
//! ```

use crate::layer::LayerKind;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Security posture applied during validation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityMode {
    /// Normal checks
    #[default]
    Standard,
    /// Refuses any configuration that skips peer verification
    Hardened,
    /// Accepts everything, with warnings
    Permissive,
}

/// QUIC congestion control algorithm
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CongestionControl {
    Reno,
    Cubic,
    Bbr,
    #[default]
    Bbr2,
}

/// Shaper scheduling mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShaperMode {
    /// Allow bursts up to the burst budget
    #[default]
    Burst,
    /// Spread sends evenly
    Smooth,
}

/// Where the core engine sends routed traffic
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outbound {
    #[default]
    Direct,
    Relay,
    Quic,
}

/// TLS-mimicking relay layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Chain cannot be up without this layer
    pub critical: bool,
    /// Relay server host
    pub server_host: String,
    /// Relay server port
    pub server_port: u16,
    /// Server name presented in the mimicked handshake
    pub sni: String,
    /// Client fingerprint to mimic
    #[serde(default = "default_fingerprint")]
    pub fingerprint: String,
    /// Local port the relay listens on
    #[serde(default = "default_relay_port")]
    pub local_port: u16,
    /// Skip server certificate verification
    #[serde(default)]
    pub allow_insecure: bool,
}

/// QUIC acceleration layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuicConfig {
    /// Chain cannot be up without this layer
    pub critical: bool,
    /// QUIC server host
    pub server_host: String,
    /// QUIC server port
    #[serde(default = "default_quic_port")]
    pub server_port: u16,
    /// Congestion control algorithm
    #[serde(default)]
    pub congestion_control: CongestionControl,
    /// Maximum UDP payload size
    #[serde(default = "default_udp_payload")]
    pub max_udp_payload_size: u16,
    /// Idle timeout (milliseconds)
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// Carry QUIC over the relay's local address instead of dialing directly
    #[serde(default)]
    pub via_relay: bool,
    /// Verify the server certificate
    #[serde(default = "default_true")]
    pub verify_peer: bool,
}

/// Traffic shaping layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShaperConfig {
    /// Chain cannot be up without this layer
    pub critical: bool,
    /// Target rate in bits per second (0 = unlimited)
    #[serde(default)]
    pub target_rate_bps: u64,
    /// Maximum burst size in bytes
    #[serde(default = "default_burst")]
    pub max_burst_bytes: u64,
    /// Back off when loss is detected
    #[serde(default = "default_true")]
    pub loss_aware_backoff: bool,
    /// Enable pacing
    #[serde(default = "default_true")]
    pub enable_pacing: bool,
    /// Scheduling mode
    #[serde(default)]
    pub mode: ShaperMode,
}

/// Core routing engine layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Chain cannot be up without this layer
    pub critical: bool,
    /// Engine configuration file (format owned by the engine)
    pub config_path: PathBuf,
    /// Local SOCKS listen port
    #[serde(default = "default_socks_port")]
    pub socks_port: u16,
    /// Where routed traffic leaves the engine
    #[serde(default)]
    pub outbound: Outbound,
}

fn default_fingerprint() -> String {
    "chrome".to_string()
}

fn default_relay_port() -> u16 {
    10809
}

fn default_quic_port() -> u16 {
    443
}

fn default_udp_payload() -> u16 {
    1350
}

fn default_idle_timeout_ms() -> u64 {
    300_000
}

fn default_burst() -> u64 {
    64 * 1024
}

fn default_socks_port() -> u16 {
    1080
}

fn default_true() -> bool {
    true
}

/// One layer's configuration block, as handed to its [`LayerHandle`](crate::layer::LayerHandle)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayerConfig {
    Relay(RelayConfig),
    Quic(QuicConfig),
    Shaper(ShaperConfig),
    Core(CoreConfig),
}

impl LayerConfig {
    /// Layer this block configures
    pub fn kind(&self) -> LayerKind {
        match self {
            LayerConfig::Relay(_) => LayerKind::Relay,
            LayerConfig::Quic(_) => LayerKind::Quic,
            LayerConfig::Shaper(_) => LayerKind::Shaper,
            LayerConfig::Core(_) => LayerKind::Core,
        }
    }

    /// Declared criticality
    pub fn is_critical(&self) -> bool {
        match self {
            LayerConfig::Relay(c) => c.critical,
            LayerConfig::Quic(c) => c.critical,
            LayerConfig::Shaper(c) => c.critical,
            LayerConfig::Core(c) => c.critical,
        }
    }

    /// Local port the layer listens on, if it listens at all
    pub fn local_port(&self) -> Option<u16> {
        match self {
            LayerConfig::Relay(c) => Some(c.local_port),
            LayerConfig::Core(c) => Some(c.socks_port),
            LayerConfig::Quic(_) | LayerConfig::Shaper(_) => None,
        }
    }
}

/// Complete chain configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainConfig {
    /// Chain name
    pub name: String,
    /// Security mode
    #[serde(default)]
    pub security_mode: SecurityMode,
    /// Relay block
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relay: Option<RelayConfig>,
    /// QUIC block
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quic: Option<QuicConfig>,
    /// Shaper block
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shaper: Option<ShaperConfig>,
    /// Core engine block
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub core: Option<CoreConfig>,
}

impl ChainConfig {
    /// Create a configuration with no layer declared
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            security_mode: SecurityMode::default(),
            relay: None,
            quic: None,
            shaper: None,
            core: None,
        }
    }

    /// Load from TOML string
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Load from JSON string
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Load from string in the given format
    pub fn from_str_with(content: &str, format: ConfigFormat) -> Result<Self, ConfigError> {
        match format {
            ConfigFormat::Toml => Self::from_toml(content),
            ConfigFormat::Json => Self::from_json(content),
        }
    }

    /// Load from file, picking the format from the extension
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let format = ConfigFormat::from_path(path)?;
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::from_str_with(&content, format)
    }

    /// Export as TOML
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))
    }

    /// Export as JSON
    pub fn to_json(&self) -> Result<String, ConfigError> {
        serde_json::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))
    }

    /// Block for one layer, if declared
    pub fn layer(&self, kind: LayerKind) -> Option<LayerConfig> {
        match kind {
            LayerKind::Relay => self.relay.clone().map(LayerConfig::Relay),
            LayerKind::Quic => self.quic.clone().map(LayerConfig::Quic),
            LayerKind::Shaper => self.shaper.clone().map(LayerConfig::Shaper),
            LayerKind::Core => self.core.clone().map(LayerConfig::Core),
        }
    }

    /// Check if a layer is declared
    pub fn declares(&self, kind: LayerKind) -> bool {
        match kind {
            LayerKind::Relay => self.relay.is_some(),
            LayerKind::Quic => self.quic.is_some(),
            LayerKind::Shaper => self.shaper.is_some(),
            LayerKind::Core => self.core.is_some(),
        }
    }

    /// Declared layers with their blocks, in start order
    pub fn declared_layers(&self) -> Vec<LayerConfig> {
        LayerKind::START_ORDER
            .iter()
            .filter_map(|kind| self.layer(*kind))
            .collect()
    }

    /// Declared critical layers, in start order
    pub fn critical_layers(&self) -> Vec<LayerKind> {
        self.declared_layers()
            .iter()
            .filter(|l| l.is_critical())
            .map(|l| l.kind())
            .collect()
    }
}

/// Supported configuration file formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Toml,
    Json,
}

impl ConfigFormat {
    /// Detect format from file extension
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Ok(ConfigFormat::Toml),
            Some("json") => Ok(ConfigFormat::Json),
            _ => Err(ConfigError::UnsupportedFormat),
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Serialize error: {0}")]
    Serialize(String),

    #[error("Unsupported config format")]
    UnsupportedFormat,
}

/// Monitoring loop tunables
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// First polling interval
    pub initial_interval: Duration,
    /// Shortest interval
    pub min_interval: Duration,
    /// Longest interval
    pub max_interval: Duration,
    /// Multiplier applied after a clean tick
    pub decay: f64,
    /// Multiplier applied after a failed tick
    pub growth: f64,
    /// Bound on each per-layer poll
    pub poll_timeout: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(1000),
            min_interval: Duration::from_millis(1000),
            max_interval: Duration::from_millis(10_000),
            decay: 0.95,
            growth: 1.5,
            poll_timeout: Duration::from_secs(5),
        }
    }
}

/// Supervisor tunables
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Bound on each layer's start call
    pub start_timeout: Duration,
    /// Bound on each layer's stop call
    pub stop_timeout: Duration,
    /// Bound on each layer's attach call
    pub attach_timeout: Duration,
    /// Monitoring loop tunables
    pub monitor: MonitorConfig,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            start_timeout: Duration::from_secs(30),
            stop_timeout: Duration::from_secs(10),
            attach_timeout: Duration::from_secs(10),
            monitor: MonitorConfig::default(),
        }
    }
}
