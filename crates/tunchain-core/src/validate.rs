//! Pre-flight validation of chain configurations.
//!
//! Validation runs once before any layer is touched. Errors block the
//! start entirely; warnings are reported but never block.

use crate::config::{ChainConfig, LayerConfig, Outbound, SecurityMode};
use crate::layer::LayerKind;
use std::collections::HashMap;

/// Accepted QUIC UDP payload sizes
const UDP_PAYLOAD_RANGE: std::ops::RangeInclusive<u16> = 1200..=1500;

/// Ports below this need elevated privileges on most systems
const PRIVILEGED_PORT_LIMIT: u16 = 1024;

/// Result of validating one configuration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    /// No blocking error found
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    fn error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    fn warn(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }
}

/// Structural and semantic checks over a [`ChainConfig`]
#[derive(Debug, Clone, Default)]
pub struct ConfigValidator {
    /// Layers that have an implementation available, if known
    available: Option<Vec<LayerKind>>,
}

impl ConfigValidator {
    /// Validator that checks the configuration alone
    pub fn new() -> Self {
        Self::default()
    }

    /// Also require every declared layer to be among `available`
    pub fn with_available(available: Vec<LayerKind>) -> Self {
        Self {
            available: Some(available),
        }
    }

    /// Validate a configuration
    pub fn validate(&self, config: &ChainConfig) -> ValidationReport {
        let mut report = ValidationReport::default();

        if config.name.trim().is_empty() {
            report.error("chain name is empty");
        }

        let layers = config.declared_layers();
        if layers.is_empty() {
            report.error("no layer declared");
            return report;
        }

        if !layers.iter().any(|l| l.is_critical()) {
            report.warn("no layer is declared critical; chain will report RUNNING even if every layer fails");
        }

        if let Some(available) = &self.available {
            for layer in &layers {
                if !available.contains(&layer.kind()) {
                    report.error(format!("no handle registered for layer {}", layer.kind()));
                }
            }
        }

        for layer in &layers {
            Self::check_layer(layer, &mut report);
        }

        Self::check_dependencies(config, &mut report);
        Self::check_port_conflicts(&layers, &mut report);
        Self::check_security(config, &mut report);

        report
    }

    fn check_layer(layer: &LayerConfig, report: &mut ValidationReport) {
        match layer {
            LayerConfig::Relay(relay) => {
                if relay.server_host.trim().is_empty() {
                    report.error("relay: server_host is required");
                }
                if relay.sni.trim().is_empty() {
                    report.error("relay: sni is required");
                }
                if relay.server_port == 0 {
                    report.error("relay: server_port must be in 1..=65535");
                }
            }
            LayerConfig::Quic(quic) => {
                if quic.server_host.trim().is_empty() {
                    report.error("quic: server_host is required");
                }
                if quic.server_port == 0 {
                    report.error("quic: server_port must be in 1..=65535");
                }
                if !UDP_PAYLOAD_RANGE.contains(&quic.max_udp_payload_size) {
                    report.error(format!(
                        "quic: max_udp_payload_size {} outside {}..={}",
                        quic.max_udp_payload_size,
                        UDP_PAYLOAD_RANGE.start(),
                        UDP_PAYLOAD_RANGE.end()
                    ));
                }
                if quic.idle_timeout_ms == 0 {
                    report.error("quic: idle_timeout_ms must be positive");
                }
            }
            LayerConfig::Shaper(shaper) => {
                if shaper.max_burst_bytes == 0 {
                    report.error("shaper: max_burst_bytes must be positive");
                }
                if shaper.target_rate_bps == 0 && shaper.enable_pacing {
                    report.warn("shaper: pacing enabled with unlimited target rate has no effect");
                }
            }
            LayerConfig::Core(core) => {
                if core.config_path.as_os_str().is_empty() {
                    report.error("core: config_path is required");
                }
            }
        }

        if let Some(port) = layer.local_port() {
            if port == 0 {
                report.error(format!("{}: local port must be in 1..=65535", layer.kind()));
            } else if port < PRIVILEGED_PORT_LIMIT {
                report.warn(format!(
                    "{}: local port {} is privileged",
                    layer.kind(),
                    port
                ));
            }
        }
    }

    /// Layers consuming another layer's output address need that layer
    fn check_dependencies(config: &ChainConfig, report: &mut ValidationReport) {
        if let Some(quic) = &config.quic {
            if quic.via_relay && config.relay.is_none() {
                report.error("quic: via_relay requires a relay layer");
            }
        }

        if let Some(core) = &config.core {
            match core.outbound {
                Outbound::Relay if config.relay.is_none() => {
                    report.error("core: outbound 'relay' requires a relay layer");
                }
                Outbound::Quic if config.quic.is_none() => {
                    report.error("core: outbound 'quic' requires a quic layer");
                }
                _ => {}
            }
        }
    }

    fn check_port_conflicts(layers: &[LayerConfig], report: &mut ValidationReport) {
        let mut seen: HashMap<u16, LayerKind> = HashMap::new();

        for layer in layers {
            let Some(port) = layer.local_port() else {
                continue;
            };
            if port == 0 {
                continue;
            }
            if let Some(other) = seen.insert(port, layer.kind()) {
                report.error(format!(
                    "{} and {} both listen on port {}",
                    other,
                    layer.kind(),
                    port
                ));
            }
        }
    }

    fn check_security(config: &ChainConfig, report: &mut ValidationReport) {
        match config.security_mode {
            SecurityMode::Standard => {}
            SecurityMode::Hardened => {
                if config.relay.as_ref().is_some_and(|r| r.allow_insecure) {
                    report.error("hardened mode forbids relay.allow_insecure");
                }
                if config.quic.as_ref().is_some_and(|q| !q.verify_peer) {
                    report.error("hardened mode requires quic.verify_peer");
                }
            }
            SecurityMode::Permissive => {
                report.warn("permissive security mode: peer verification may be disabled");
            }
        }
    }
}
