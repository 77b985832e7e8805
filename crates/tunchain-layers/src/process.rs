//! External-process layers
//!
//! A [`ProcessLayer`] runs one engine binary as a child process. What to
//! run is decided by a [`CommandSpec`], which turns the layer's config
//! block into a [`ProcessCommand`].
//!
//! # Readiness
//!
//! When the command names a local listen address, `start` only returns
//! once a TCP connect to that address succeeds. The child exiting first,
//! or the probe running past its deadline, fails the start and kills the
//! child.

use async_trait::async_trait;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use tunchain_core::{LayerConfig, LayerError, LayerHandle, LayerKind, LayerMetrics};

/// Fully resolved command line for one engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub envs: Vec<(String, String)>,
    /// Address that accepts connections once the engine is ready
    pub ready_addr: Option<SocketAddr>,
}

impl ProcessCommand {
    /// Create a command for `program`
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            ready_addr: None,
        }
    }

    /// Append one argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append a flag followed by its value
    pub fn flag(self, name: &str, value: impl Into<String>) -> Self {
        self.arg(name).arg(value)
    }

    /// Set an environment variable for the child
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Wait for a loopback listener on `port` before reporting ready
    pub fn ready_on_loopback(mut self, port: u16) -> Self {
        self.ready_addr = Some(SocketAddr::from((Ipv4Addr::LOCALHOST, port)));
        self
    }

    fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        cmd
    }
}

/// Builds the command line for one kind of engine
pub trait CommandSpec: Send + Sync {
    /// Layer the engine implements
    fn kind(&self) -> LayerKind;

    /// Resolve the command for `config`
    fn build(&self, config: &LayerConfig) -> Result<ProcessCommand, LayerError>;
}

/// Readiness probe tunables
#[derive(Debug, Clone)]
pub struct ReadinessProbe {
    /// Give up after this long
    pub deadline: Duration,
    /// Delay between connect attempts
    pub retry: Duration,
}

impl Default for ReadinessProbe {
    fn default() -> Self {
        Self {
            deadline: Duration::from_secs(15),
            retry: Duration::from_millis(200),
        }
    }
}

/// Layer backed by a child process
pub struct ProcessLayer<S> {
    spec: S,
    probe: ReadinessProbe,
    child: Mutex<Option<Child>>,
}

impl<S: CommandSpec> ProcessLayer<S> {
    /// Create a layer that runs commands built by `spec`
    pub fn new(spec: S) -> Self {
        Self::with_probe(spec, ReadinessProbe::default())
    }

    /// Create with explicit readiness tunables
    pub fn with_probe(spec: S, probe: ReadinessProbe) -> Self {
        Self {
            spec,
            probe,
            child: Mutex::new(None),
        }
    }

    /// Command builder
    pub fn spec(&self) -> &S {
        &self.spec
    }

    /// OS process id of the running child
    pub async fn pid(&self) -> Option<u32> {
        self.child.lock().await.as_ref().and_then(|c| c.id())
    }

    async fn wait_ready(&self, child: &mut Child, addr: SocketAddr) -> Result<(), LayerError> {
        let deadline = tokio::time::Instant::now() + self.probe.deadline;

        loop {
            if let Some(status) = child.try_wait()? {
                return Err(LayerError::Start(format!(
                    "process exited before listening on {}: {}",
                    addr, status
                )));
            }

            match TcpStream::connect(addr).await {
                Ok(_) => return Ok(()),
                Err(e) => debug!("{} not ready on {}: {}", self.spec.kind(), addr, e),
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(LayerError::Start(format!(
                    "no listener on {} after {:?}",
                    addr, self.probe.deadline
                )));
            }
            tokio::time::sleep(self.probe.retry).await;
        }
    }
}

/// Kill `child` and reap it
async fn terminate(kind: LayerKind, mut child: Child) -> Result<(), LayerError> {
    if child.try_wait()?.is_some() {
        debug!("{} process already exited", kind);
        return Ok(());
    }

    child
        .kill()
        .await
        .map_err(|e| LayerError::Stop(format!("kill failed: {}", e)))
}

#[async_trait]
impl<S: CommandSpec> LayerHandle for ProcessLayer<S> {
    fn kind(&self) -> LayerKind {
        self.spec.kind()
    }

    async fn start(&self, config: &LayerConfig) -> Result<(), LayerError> {
        let kind = self.spec.kind();
        let command = self.spec.build(config)?;

        let mut slot = self.child.lock().await;
        if slot.is_some() {
            return Err(LayerError::Start(format!("{} process already running", kind)));
        }

        let mut child = command.to_command().spawn().map_err(|e| {
            LayerError::Start(format!("failed to spawn {}: {}", command.program.display(), e))
        })?;
        info!("Spawned {} process (pid {:?})", kind, child.id());

        if let Some(addr) = command.ready_addr {
            if let Err(e) = self.wait_ready(&mut child, addr).await {
                warn!("{} process never became ready: {}", kind, e);
                if let Err(kill_err) = terminate(kind, child).await {
                    warn!("{}", kill_err);
                }
                return Err(e);
            }
            debug!("{} listening on {}", kind, addr);
        }

        *slot = Some(child);
        Ok(())
    }

    async fn stop(&self) -> Result<(), LayerError> {
        let child = self.child.lock().await.take();

        match child {
            Some(child) => terminate(self.spec.kind(), child).await,
            None => Ok(()),
        }
    }

    async fn is_running(&self) -> bool {
        match self.child.lock().await.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// External engines do not expose counters; readings stay at zero.
    async fn metrics(&self) -> Result<LayerMetrics, LayerError> {
        if self.is_running().await {
            Ok(LayerMetrics::default())
        } else {
            Err(LayerError::Metrics(format!("{} process not running", self.spec.kind())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    struct Shell {
        script: &'static str,
        ready_port: Option<u16>,
    }

    impl CommandSpec for Shell {
        fn kind(&self) -> LayerKind {
            LayerKind::Core
        }

        fn build(&self, _config: &LayerConfig) -> Result<ProcessCommand, LayerError> {
            let cmd = ProcessCommand::new("/bin/sh").flag("-c", self.script);
            Ok(match self.ready_port {
                Some(port) => cmd.ready_on_loopback(port),
                None => cmd,
            })
        }
    }

    fn core_config() -> LayerConfig {
        LayerConfig::Core(tunchain_core::CoreConfig {
            critical: true,
            config_path: "/tmp/core.json".into(),
            socks_port: 1080,
            outbound: tunchain_core::Outbound::Direct,
        })
    }

    fn quick_probe() -> ReadinessProbe {
        ReadinessProbe {
            deadline: Duration::from_millis(500),
            retry: Duration::from_millis(20),
        }
    }

    #[test]
    fn test_command_builder() {
        let cmd = ProcessCommand::new("/usr/bin/engine")
            .arg("run")
            .flag("-c", "/etc/engine.json")
            .env("ENGINE_LOG", "warn")
            .ready_on_loopback(1080);

        assert_eq!(cmd.args, vec!["run", "-c", "/etc/engine.json"]);
        assert_eq!(cmd.envs, vec![("ENGINE_LOG".to_string(), "warn".to_string())]);
        assert_eq!(cmd.ready_addr, Some("127.0.0.1:1080".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_start_and_stop_child() {
        let layer = ProcessLayer::new(Shell {
            script: "sleep 30",
            ready_port: None,
        });

        layer.start(&core_config()).await.unwrap();
        assert!(layer.is_running().await);
        assert!(layer.pid().await.is_some());

        layer.stop().await.unwrap();
        assert!(!layer.is_running().await);
        assert!(layer.pid().await.is_none());

        // Second stop has nothing to release
        layer.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_readiness_probe() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let layer = ProcessLayer::with_probe(
            Shell {
                script: "sleep 30",
                ready_port: Some(port),
            },
            quick_probe(),
        );

        layer.start(&core_config()).await.unwrap();
        assert!(layer.is_running().await);
        layer.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_early_exit_fails_start() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let layer = ProcessLayer::with_probe(
            Shell {
                script: "exit 3",
                ready_port: Some(port),
            },
            quick_probe(),
        );

        let err = layer.start(&core_config()).await.unwrap_err();
        assert!(matches!(err, LayerError::Start(_)));
        assert!(!layer.is_running().await);
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        struct Missing;
        impl CommandSpec for Missing {
            fn kind(&self) -> LayerKind {
                LayerKind::Relay
            }
            fn build(&self, _config: &LayerConfig) -> Result<ProcessCommand, LayerError> {
                Ok(ProcessCommand::new("/nonexistent/engine-binary"))
            }
        }

        let layer = ProcessLayer::new(Missing);
        let err = layer.start(&core_config()).await.unwrap_err();
        assert!(err.to_string().contains("failed to spawn"));
    }

    #[tokio::test]
    async fn test_crashed_child_reports_not_running() {
        let layer = ProcessLayer::new(Shell {
            script: "exit 0",
            ready_port: None,
        });

        layer.start(&core_config()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(!layer.is_running().await);
        assert!(layer.metrics().await.is_err());
        layer.stop().await.unwrap();
    }
}
