//! Scripted layer doubles shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tunchain_core::{
    AttachParams, AttachmentId, ChainConfig, CoreConfig, LayerConfig, LayerError, LayerHandle,
    LayerKind, LayerMetrics, Outbound, QuicConfig, RelayConfig, ResourceHandle, ShaperConfig,
};

/// How a scripted layer answers `start`
#[derive(Debug, Clone)]
pub enum StartBehavior {
    Succeed,
    Fail(&'static str),
    Hang,
    Panic(&'static str),
}

/// Shared, ordered record of layer calls
pub type EventLog = Arc<Mutex<Vec<String>>>;

pub fn event_log() -> EventLog {
    Arc::new(Mutex::new(Vec::new()))
}

/// Layer double with scripted behavior and call accounting
pub struct ScriptedLayer {
    kind: LayerKind,
    behavior: StartBehavior,
    stop_error: Option<&'static str>,
    attachable: bool,
    running: AtomicBool,
    resource: Mutex<Option<u64>>,
    starts: AtomicU32,
    releases: AtomicU32,
    attaches: AtomicU32,
    metrics: Mutex<VecDeque<Result<LayerMetrics, LayerError>>>,
    last_metrics: Mutex<LayerMetrics>,
    log: Option<EventLog>,
}

impl ScriptedLayer {
    pub fn new(kind: LayerKind, behavior: StartBehavior) -> Self {
        Self {
            kind,
            behavior,
            stop_error: None,
            attachable: false,
            running: AtomicBool::new(false),
            resource: Mutex::new(None),
            starts: AtomicU32::new(0),
            releases: AtomicU32::new(0),
            attaches: AtomicU32::new(0),
            metrics: Mutex::new(VecDeque::new()),
            last_metrics: Mutex::new(LayerMetrics::default()),
            log: None,
        }
    }

    pub fn ok(kind: LayerKind) -> Arc<Self> {
        Arc::new(Self::new(kind, StartBehavior::Succeed))
    }

    pub fn failing(kind: LayerKind) -> Arc<Self> {
        Arc::new(Self::new(kind, StartBehavior::Fail("engine refused")))
    }

    pub fn hanging(kind: LayerKind) -> Arc<Self> {
        Arc::new(Self::new(kind, StartBehavior::Hang))
    }

    pub fn with_log(mut self, log: &EventLog) -> Self {
        self.log = Some(log.clone());
        self
    }

    pub fn with_stop_error(mut self, cause: &'static str) -> Self {
        self.stop_error = Some(cause);
        self
    }

    pub fn attachable(mut self) -> Self {
        self.attachable = true;
        self
    }

    /// Queue metric readings returned by successive polls
    pub fn with_metrics(self, readings: Vec<Result<LayerMetrics, LayerError>>) -> Self {
        *self.metrics.lock().unwrap() = readings.into();
        self
    }

    /// Simulate the engine dying underneath the supervisor
    pub fn crash(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Simulate the engine coming back on its own
    pub fn recover(&self) {
        self.running.store(true, Ordering::SeqCst);
    }

    pub fn starts(&self) -> u32 {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> u32 {
        self.releases.load(Ordering::SeqCst)
    }

    pub fn attaches(&self) -> u32 {
        self.attaches.load(Ordering::SeqCst)
    }

    pub fn holds_resource(&self) -> bool {
        self.resource.lock().unwrap().is_some()
    }

    fn record(&self, event: &str) {
        if let Some(log) = &self.log {
            log.lock().unwrap().push(format!("{}:{}", event, self.kind));
        }
    }
}

#[async_trait]
impl LayerHandle for ScriptedLayer {
    fn kind(&self) -> LayerKind {
        self.kind
    }

    async fn start(&self, config: &LayerConfig) -> Result<(), LayerError> {
        assert_eq!(config.kind(), self.kind);
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.record("start");

        match self.behavior {
            StartBehavior::Succeed => {
                *self.resource.lock().unwrap() = Some(u64::from(self.starts()));
                self.running.store(true, Ordering::SeqCst);
                Ok(())
            }
            StartBehavior::Fail(cause) => Err(LayerError::Start(cause.to_string())),
            StartBehavior::Hang => {
                std::future::pending::<()>().await;
                Ok(())
            }
            StartBehavior::Panic(msg) => panic!("{}", msg),
        }
    }

    async fn stop(&self) -> Result<(), LayerError> {
        self.record("stop");
        self.running.store(false, Ordering::SeqCst);

        if self.resource.lock().unwrap().take().is_some() {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }

        match self.stop_error {
            Some(cause) => Err(LayerError::Stop(cause.to_string())),
            None => Ok(()),
        }
    }

    async fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn metrics(&self) -> Result<LayerMetrics, LayerError> {
        let next = self.metrics.lock().unwrap().pop_front();
        match next {
            Some(Ok(m)) => {
                *self.last_metrics.lock().unwrap() = m;
                Ok(m)
            }
            Some(Err(e)) => Err(e),
            None => Ok(*self.last_metrics.lock().unwrap()),
        }
    }

    fn supports_attach(&self) -> bool {
        self.attachable
    }

    async fn attach(
        &self,
        resource: ResourceHandle,
        _params: &AttachParams,
    ) -> Result<AttachmentId, LayerError> {
        if !self.attachable {
            return Err(LayerError::Unsupported);
        }
        let n = self.attaches.fetch_add(1, Ordering::SeqCst) + 1;
        self.record("attach");
        Ok(AttachmentId(resource.raw() as u64 * 100 + u64::from(n)))
    }
}

pub fn relay_block(critical: bool) -> RelayConfig {
    RelayConfig {
        critical,
        server_host: "edge.example.net".into(),
        server_port: 443,
        sni: "www.example.com".into(),
        fingerprint: "chrome".into(),
        local_port: 10809,
        allow_insecure: false,
    }
}

pub fn quic_block(critical: bool) -> QuicConfig {
    QuicConfig {
        critical,
        server_host: "quic.example.net".into(),
        server_port: 443,
        congestion_control: Default::default(),
        max_udp_payload_size: 1350,
        idle_timeout_ms: 30_000,
        via_relay: false,
        verify_peer: true,
    }
}

pub fn shaper_block(critical: bool) -> ShaperConfig {
    ShaperConfig {
        critical,
        target_rate_bps: 50_000_000,
        max_burst_bytes: 64 * 1024,
        loss_aware_backoff: true,
        enable_pacing: true,
        mode: Default::default(),
    }
}

pub fn core_block(critical: bool) -> CoreConfig {
    CoreConfig {
        critical,
        config_path: "/data/core.json".into(),
        socks_port: 1080,
        outbound: Outbound::Direct,
    }
}

/// Config declaring every layer, with the given criticality per layer
pub fn full_chain(relay: bool, quic: bool, shaper: bool, core: bool) -> ChainConfig {
    let mut config = ChainConfig::new("full");
    config.relay = Some(relay_block(relay));
    config.quic = Some(quic_block(quic));
    config.shaper = Some(shaper_block(shaper));
    config.core = Some(core_block(core));
    config
}
