//! Error taxonomy
//!
//! Two levels of errors:
//! - [`LayerError`] is what an individual layer implementation reports.
//! - [`ChainError`] is what the supervisor reports, always tagged with
//!   the layer it concerns when one is involved.

use crate::layer::LayerKind;
use crate::status::ChainState;

/// Errors returned by a [`LayerHandle`](crate::layer::LayerHandle) implementation
#[derive(Debug, Clone, thiserror::Error)]
pub enum LayerError {
    #[error("Start failed: {0}")]
    Start(String),

    #[error("Stop failed: {0}")]
    Stop(String),

    #[error("Metrics unavailable: {0}")]
    Metrics(String),

    #[error("Attach failed: {0}")]
    Attach(String),

    #[error("Operation not supported by this layer")]
    Unsupported,

    #[error("Layer not running")]
    NotRunning,

    #[error("Invalid layer config: {0}")]
    Config(String),

    #[error("Invalid resource handle: {0}")]
    InvalidResource(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for LayerError {
    fn from(e: std::io::Error) -> Self {
        LayerError::Io(e.to_string())
    }
}

/// Supervisor errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChainError {
    #[error("Invalid chain configuration: {}", errors.join("; "))]
    ConfigInvalid { errors: Vec<String> },

    #[error("Layer {layer} failed to start: {cause}")]
    LayerStartFailed { layer: LayerKind, cause: String },

    #[error("Layer {layer} failed to stop: {cause}")]
    LayerStopFailed { layer: LayerKind, cause: String },

    #[error("Chain already running")]
    AlreadyRunning,

    #[error("Layer {layer} timed out")]
    Timeout { layer: LayerKind },

    #[error("Resource unavailable: {0}")]
    ResourceUnavailable(String),

    #[error("Chain not running")]
    NotRunning,

    #[error("Supervisor has been shut down")]
    ShutDown,

    #[error("Illegal state transition {from:?} -> {to:?}")]
    InvalidTransition { from: ChainState, to: ChainState },
}

impl ChainError {
    /// Layer this error concerns, if any
    pub fn layer(&self) -> Option<LayerKind> {
        match self {
            ChainError::LayerStartFailed { layer, .. }
            | ChainError::LayerStopFailed { layer, .. }
            | ChainError::Timeout { layer } => Some(*layer),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_invalid_message() {
        let err = ChainError::ConfigInvalid {
            errors: vec!["chain name is empty".into(), "no layer declared".into()],
        };
        assert_eq!(
            err.to_string(),
            "Invalid chain configuration: chain name is empty; no layer declared"
        );
    }

    #[test]
    fn test_error_layer() {
        let err = ChainError::Timeout { layer: LayerKind::Quic };
        assert_eq!(err.layer(), Some(LayerKind::Quic));
        assert_eq!(ChainError::AlreadyRunning.layer(), None);
    }
}
