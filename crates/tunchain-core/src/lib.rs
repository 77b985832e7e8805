//! tunchain - Tunnel Chain Supervisor
//!
//! Starts, health-monitors, degrades and tears down a chain of
//! independently implemented tunnel layers that together form one
//! proxy/VPN data path.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     ChainSupervisor                       │
//! │                                                           │
//! │  ConfigValidator ──▶ start/stop/restart/attach/shutdown   │
//! │                              │                            │
//! │                              ▼                            │
//! │   ┌───────┐   ┌──────┐   ┌────────┐   ┌──────┐            │
//! │   │ Relay │──▶│ QUIC │──▶│ Shaper │──▶│ Core │  LayerSet  │
//! │   └───────┘   └──────┘   └────────┘   └──────┘            │
//! │        ▲           ▲          ▲           ▲               │
//! │        └───────────┴──────────┴───────────┘               │
//! │                 MonitoringLoop (1 task)                   │
//! │                              │                            │
//! │                              ▼                            │
//! │               StatusStore ──▶ watch::Receiver             │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Failure Policy
//!
//! - Each layer block declares itself critical or optional
//! - All critical layers up: `RUNNING`, even if optional layers failed
//! - Any critical layer down: `DEGRADED`
//! - `DEGRADED` is only cleared by an explicit restart

mod config;
mod error;
mod layer;
mod monitor;
mod status;
mod supervisor;
mod validate;

pub mod logging;

pub use config::{
    ChainConfig, ConfigError, ConfigFormat, CongestionControl, CoreConfig, LayerConfig,
    MonitorConfig, Outbound, QuicConfig, RelayConfig, SecurityMode, ShaperConfig, ShaperMode,
    SupervisorConfig,
};
pub use error::{ChainError, LayerError};
pub use layer::{
    AttachParams, AttachmentId, LayerHandle, LayerKind, LayerMetrics, LayerSet, ResourceHandle,
};
pub use monitor::{AdaptiveInterval, CounterClamp, MonitorHandle, MonitoredLayer, MonitoringLoop};
pub use status::{ChainState, ChainStatus, LayerStatus, StatusStore};
pub use supervisor::{ChainOutcome, ChainSupervisor};
pub use validate::{ConfigValidator, ValidationReport};
