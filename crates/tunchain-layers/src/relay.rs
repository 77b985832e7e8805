//! TLS-mimicking relay engine
//!
//! The relay runs as an external binary that listens on a loopback port
//! and forwards to the remote server, presenting a browser-like TLS
//! handshake.

use crate::process::{CommandSpec, ProcessCommand};
use std::path::PathBuf;
use tunchain_core::{LayerConfig, LayerError, LayerKind, RelayConfig};

/// Command builder for the relay binary
#[derive(Debug, Clone)]
pub struct RelayCommand {
    binary: PathBuf,
}

impl RelayCommand {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn command(&self, config: &RelayConfig) -> ProcessCommand {
        let mut cmd = ProcessCommand::new(&self.binary)
            .flag("--listen", format!("127.0.0.1:{}", config.local_port))
            .flag(
                "--server",
                format!("{}:{}", config.server_host, config.server_port),
            )
            .flag("--sni", &config.sni)
            .flag("--fingerprint", &config.fingerprint);

        if config.allow_insecure {
            cmd = cmd.arg("--insecure");
        }
        cmd.ready_on_loopback(config.local_port)
    }
}

impl CommandSpec for RelayCommand {
    fn kind(&self) -> LayerKind {
        LayerKind::Relay
    }

    fn build(&self, config: &LayerConfig) -> Result<ProcessCommand, LayerError> {
        match config {
            LayerConfig::Relay(relay) => Ok(self.command(relay)),
            other => Err(LayerError::Start(format!(
                "relay engine given a {} block",
                other.kind()
            ))),
        }
    }
}
