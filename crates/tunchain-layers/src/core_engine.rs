//! Routing core engine
//!
//! The core reads its own routing configuration file and exposes a SOCKS
//! listener on loopback; the chain only tells it where that file is.

use crate::process::{CommandSpec, ProcessCommand};
use std::path::PathBuf;
use tracing::debug;
use tunchain_core::{CoreConfig, LayerConfig, LayerError, LayerKind};

/// Command builder for the core engine binary
#[derive(Debug, Clone)]
pub struct CoreCommand {
    binary: PathBuf,
}

impl CoreCommand {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn command(&self, config: &CoreConfig) -> ProcessCommand {
        debug!("Core outbound: {:?}", config.outbound);
        ProcessCommand::new(&self.binary)
            .arg("run")
            .flag("-c", config.config_path.to_string_lossy())
            .ready_on_loopback(config.socks_port)
    }
}

impl CommandSpec for CoreCommand {
    fn kind(&self) -> LayerKind {
        LayerKind::Core
    }

    fn build(&self, config: &LayerConfig) -> Result<ProcessCommand, LayerError> {
        match config {
            LayerConfig::Core(core) => Ok(self.command(core)),
            other => Err(LayerError::Start(format!(
                "core engine given a {} block",
                other.kind()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tunchain_core::Outbound;

    #[test]
    fn test_core_args() {
        let config = LayerConfig::Core(CoreConfig {
            critical: true,
            config_path: "/data/engine/config.json".into(),
            socks_port: 10808,
            outbound: Outbound::Relay,
        });

        let cmd = CoreCommand::new("/opt/core").build(&config).unwrap();
        assert_eq!(cmd.args, vec!["run", "-c", "/data/engine/config.json"]);
        assert_eq!(cmd.ready_addr.map(|a| a.port()), Some(10808));
        assert!(cmd.envs.is_empty());
    }
}
