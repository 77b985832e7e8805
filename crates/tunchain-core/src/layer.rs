//! Layer contract
//!
//! Every tunnel layer participating in a chain is driven through the
//! [`LayerHandle`] trait. The supervisor iterates a homogeneous set of
//! handles and never branches on what a layer is internally.
//!
//! # Start Order
//!
//! ```text
//! Relay ──▶ Quic ──▶ Shaper ──▶ Core
//!   ▲                             │
//!   └──────── teardown ◀──────────┘
//! ```
//!
//! The order is fixed and independent of configuration, so a partially
//! started chain is always a prefix of [`LayerKind::START_ORDER`].

use crate::config::LayerConfig;
use crate::error::LayerError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Identity of a layer within a chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayerKind {
    /// TLS-mimicking relay
    Relay,
    /// QUIC acceleration layer
    Quic,
    /// Traffic shaper
    Shaper,
    /// Core routing/dispatch engine
    Core,
}

impl LayerKind {
    /// Fixed dependency order used to start layers
    pub const START_ORDER: [LayerKind; 4] = [
        LayerKind::Relay,
        LayerKind::Quic,
        LayerKind::Shaper,
        LayerKind::Core,
    ];

    /// Stable name, used as key in the status map
    pub fn name(&self) -> &'static str {
        match self {
            LayerKind::Relay => "relay",
            LayerKind::Quic => "quic",
            LayerKind::Shaper => "shaper",
            LayerKind::Core => "core",
        }
    }

    /// Iterate in teardown order
    pub fn stop_order() -> impl Iterator<Item = LayerKind> {
        Self::START_ORDER.into_iter().rev()
    }
}

impl std::fmt::Display for LayerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for LayerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "relay" => Ok(LayerKind::Relay),
            "quic" => Ok(LayerKind::Quic),
            "shaper" => Ok(LayerKind::Shaper),
            "core" => Ok(LayerKind::Core),
            _ => Err(format!("unknown layer: {}", s)),
        }
    }
}

/// Raw counters reported by a layer
///
/// Counters are signed because native engines report them as such;
/// the monitor clamps negative and regressed values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LayerMetrics {
    /// Bytes sent upstream
    pub bytes_up: i64,
    /// Bytes received downstream
    pub bytes_down: i64,
    /// Current RTT estimate (microseconds), if the layer measures one
    pub rtt_us: Option<u64>,
}

impl LayerMetrics {
    /// Create metrics with byte counters only
    pub fn bytes(bytes_up: i64, bytes_down: i64) -> Self {
        Self {
            bytes_up,
            bytes_down,
            rtt_us: None,
        }
    }
}

/// Late-bound OS resource (e.g. a TUN file descriptor)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceHandle(pub i64);

impl ResourceHandle {
    /// Check if the handle can refer to a live resource
    pub fn is_valid(&self) -> bool {
        self.0 >= 0
    }

    /// Raw value
    pub fn raw(&self) -> i64 {
        self.0
    }
}

/// Parameters passed along with a late-bound resource
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttachParams {
    /// MTU of the attached device
    pub mtu: Option<u16>,
    /// Separate write-side handle, when reads and writes use different descriptors
    pub write_handle: Option<ResourceHandle>,
}

/// Handle returned by a successful attach
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttachmentId(pub u64);

/// Contract every layer implementation satisfies
///
/// Methods take `&self`: implementations keep their own interior state so
/// the supervisor and the monitoring task can share one handle.
#[async_trait]
pub trait LayerHandle: Send + Sync {
    /// Which layer this handle drives
    fn kind(&self) -> LayerKind;

    /// Bring the layer up with its configuration block
    async fn start(&self, config: &LayerConfig) -> Result<(), LayerError>;

    /// Tear the layer down, releasing every owned resource
    ///
    /// Must be safe to call on a layer that never started.
    async fn stop(&self) -> Result<(), LayerError>;

    /// Check if the layer is currently up
    async fn is_running(&self) -> bool;

    /// Current counters
    async fn metrics(&self) -> Result<LayerMetrics, LayerError>;

    /// Whether this layer accepts a late-bound resource
    fn supports_attach(&self) -> bool {
        false
    }

    /// Bind a resource that only exists once the data path is up
    async fn attach(
        &self,
        _resource: ResourceHandle,
        _params: &AttachParams,
    ) -> Result<AttachmentId, LayerError> {
        Err(LayerError::Unsupported)
    }
}

/// Set of layer handles owned by one supervisor
#[derive(Clone, Default)]
pub struct LayerSet {
    handles: BTreeMap<LayerKind, Arc<dyn LayerHandle>>,
}

impl LayerSet {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handle, replacing any previous handle of the same kind
    pub fn with<L: LayerHandle + 'static>(mut self, layer: L) -> Self {
        self.insert(Arc::new(layer));
        self
    }

    /// Insert a shared handle
    pub fn insert(&mut self, layer: Arc<dyn LayerHandle>) {
        self.handles.insert(layer.kind(), layer);
    }

    /// Get the handle for a layer
    pub fn get(&self, kind: LayerKind) -> Option<&Arc<dyn LayerHandle>> {
        self.handles.get(&kind)
    }

    /// Check if a handle is registered
    pub fn contains(&self, kind: LayerKind) -> bool {
        self.handles.contains_key(&kind)
    }

    /// Registered kinds, in start order
    pub fn kinds(&self) -> Vec<LayerKind> {
        self.handles.keys().copied().collect()
    }

    /// Number of registered handles
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Check if no handle is registered
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Drop every handle
    pub fn clear(&mut self) {
        self.handles.clear();
    }
}

impl std::fmt::Debug for LayerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayerSet")
            .field("layers", &self.kinds())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Inert(LayerKind);

    #[async_trait]
    impl LayerHandle for Inert {
        fn kind(&self) -> LayerKind {
            self.0
        }

        async fn start(&self, _config: &LayerConfig) -> Result<(), LayerError> {
            Ok(())
        }

        async fn stop(&self) -> Result<(), LayerError> {
            Ok(())
        }

        async fn is_running(&self) -> bool {
            false
        }

        async fn metrics(&self) -> Result<LayerMetrics, LayerError> {
            Ok(LayerMetrics::default())
        }
    }

    #[test]
    fn test_start_order() {
        let stop: Vec<_> = LayerKind::stop_order().collect();
        assert_eq!(
            stop,
            vec![LayerKind::Core, LayerKind::Shaper, LayerKind::Quic, LayerKind::Relay]
        );

        let mut sorted = LayerKind::START_ORDER.to_vec();
        sorted.sort();
        assert_eq!(sorted, LayerKind::START_ORDER.to_vec());
    }

    #[test]
    fn test_layer_kind_parse() {
        let quic: LayerKind = "QUIC".parse().unwrap();
        assert_eq!(quic, LayerKind::Quic);
        assert_eq!(LayerKind::Shaper.to_string(), "shaper");
        assert!("tun".parse::<LayerKind>().is_err());
    }

    #[test]
    fn test_resource_handle() {
        assert!(ResourceHandle(0).is_valid());
        assert!(!ResourceHandle(-1).is_valid());
    }

    #[test]
    fn test_layer_set_ordering() {
        let set = LayerSet::new()
            .with(Inert(LayerKind::Core))
            .with(Inert(LayerKind::Relay))
            .with(Inert(LayerKind::Shaper));

        assert_eq!(set.len(), 3);
        assert_eq!(
            set.kinds(),
            vec![LayerKind::Relay, LayerKind::Shaper, LayerKind::Core]
        );
        assert!(!set.contains(LayerKind::Quic));
    }

    #[tokio::test]
    async fn test_attach_unsupported_by_default() {
        let layer = Inert(LayerKind::Relay);
        assert!(!layer.supports_attach());

        let result = layer.attach(ResourceHandle(3), &AttachParams::default()).await;
        assert!(matches!(result, Err(LayerError::Unsupported)));
    }
}
