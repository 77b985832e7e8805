//! Chain Supervisor
//!
//! Starts, monitors, degrades and tears down a composed set of tunnel
//! layers.
//!
//! # Usage
//!
//! ```rust,ignore
//! let layers = LayerSet::new()
//!     .with(relay_layer)
//!     .with(core_layer);
//! let supervisor = ChainSupervisor::new(layers);
//!
//! let outcome = supervisor.start(&ChainConfig::from_path(path)?).await?;
//! if !outcome.is_success() {
//!     eprintln!("chain degraded: {:?}", outcome.failures);
//! }
//!
//! let mut status = supervisor.subscribe();
//! while status.changed().await.is_ok() {
//!     println!("{}", status.borrow().summary());
//! }
//!
//! supervisor.shutdown().await;
//! ```
//!
//! # Lifecycle Guarantees
//!
//! - `start`, `stop`, `restart`, `attach_dynamic_layer` and `shutdown`
//!   are serialized by one lock; a second caller waits and then sees the
//!   state the first one left behind.
//! - Each operation runs to completion on its own task, even if the
//!   caller stops awaiting it.
//! - Every layer call runs on its own task and is bounded by a timeout;
//!   a timeout or a panic counts as a layer failure.
//! - `stop` always ends in `STOPPED`, and the monitoring task is joined
//!   before that state is published.

use crate::config::{ChainConfig, LayerConfig, SupervisorConfig};
use crate::error::ChainError;
use crate::layer::{AttachParams, AttachmentId, LayerHandle, LayerKind, LayerSet, ResourceHandle};
use crate::monitor::{MonitorHandle, MonitoredLayer, MonitoringLoop};
use crate::status::{ChainState, ChainStatus, LayerStatus, StatusStore};
use crate::validate::ConfigValidator;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn};

/// Result of a lifecycle operation that was carried out
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainOutcome {
    /// State the chain ended in
    pub state: ChainState,
    /// Per-layer failures, in the order they happened
    pub failures: Vec<ChainError>,
    /// Validation warnings (start only)
    pub warnings: Vec<String>,
}

impl ChainOutcome {
    fn new(state: ChainState, failures: Vec<ChainError>) -> Self {
        Self {
            state,
            failures,
            warnings: Vec::new(),
        }
    }

    /// `RUNNING` after a start, `STOPPED` after a stop
    ///
    /// Failed optional layers do not make a start unsuccessful.
    pub fn is_success(&self) -> bool {
        matches!(self.state, ChainState::Running | ChainState::Stopped)
    }

    /// Layers that reported a failure
    pub fn failed_layers(&self) -> Vec<LayerKind> {
        self.failures.iter().filter_map(|f| f.layer()).collect()
    }
}

/// State owned by the lifecycle lock
struct Lifecycle {
    layers: LayerSet,
    run: Option<ActiveRun>,
    shut_down: bool,
}

/// One chain run, from start to stop
#[derive(Default)]
struct ActiveRun {
    /// Layers whose start was attempted, in start order
    attempted: Vec<LayerKind>,
    /// Layers that came up
    started: Vec<LayerKind>,
    monitor: Option<MonitorHandle>,
    /// Memoised attach outcome
    attach: Option<bool>,
    attachments: Vec<(LayerKind, AttachmentId)>,
}

struct SupervisorInner {
    config: SupervisorConfig,
    store: Arc<StatusStore>,
    lifecycle: Mutex<Lifecycle>,
}

/// Orchestrator for one chain of tunnel layers
///
/// Cloning yields another handle to the same supervisor.
#[derive(Clone)]
pub struct ChainSupervisor {
    inner: Arc<SupervisorInner>,
}

impl ChainSupervisor {
    /// Create a supervisor owning `layers`, with default tunables
    pub fn new(layers: LayerSet) -> Self {
        Self::with_config(layers, SupervisorConfig::default())
    }

    /// Create a supervisor with explicit tunables
    pub fn with_config(layers: LayerSet, config: SupervisorConfig) -> Self {
        Self {
            inner: Arc::new(SupervisorInner {
                config,
                store: Arc::new(StatusStore::new()),
                lifecycle: Mutex::new(Lifecycle {
                    layers,
                    run: None,
                    shut_down: false,
                }),
            }),
        }
    }

    /// Current status snapshot
    pub fn status(&self) -> ChainStatus {
        self.inner.store.snapshot()
    }

    /// Current state
    pub fn state(&self) -> ChainState {
        self.inner.store.state()
    }

    /// Observe status snapshots as they are published
    pub fn subscribe(&self) -> watch::Receiver<ChainStatus> {
        self.inner.store.subscribe()
    }

    /// Supervisor tunables
    pub fn config(&self) -> &SupervisorConfig {
        &self.inner.config
    }

    /// Validate `config` and bring its layers up
    ///
    /// Returns `Err` only when nothing was attempted: an invalid
    /// configuration, a chain that is not stopped, or a shut-down
    /// supervisor. Layer failures are reported in the outcome and in
    /// the status snapshot.
    pub async fn start(&self, config: &ChainConfig) -> Result<ChainOutcome, ChainError> {
        let inner = self.inner.clone();
        let config = config.clone();

        detached(async move { inner.start(config).await })
            .await
            .unwrap_or(Err(ChainError::ShutDown))
    }

    /// Tear the chain down
    ///
    /// Idempotent: stopping a stopped chain succeeds without doing
    /// anything. Individual layer stop failures are logged and listed
    /// in the outcome; the chain still ends `STOPPED`.
    pub async fn stop(&self) -> ChainOutcome {
        let inner = self.inner.clone();

        match detached(async move { inner.stop().await }).await {
            Some(outcome) => outcome,
            None => ChainOutcome::new(self.state(), Vec::new()),
        }
    }

    /// `stop` followed by `start`
    ///
    /// Observers may see `STOPPED` between the two.
    pub async fn restart(&self, config: &ChainConfig) -> Result<ChainOutcome, ChainError> {
        info!("Restarting chain '{}'", config.name);
        let stopped = self.stop().await;
        if !stopped.failures.is_empty() {
            warn!("{} layer(s) failed to stop cleanly before restart", stopped.failures.len());
        }
        self.start(config).await
    }

    /// Hand a late-bound resource to the layers that accept one
    ///
    /// Only the first call in a run attaches; later calls return the
    /// first call's outcome.
    pub async fn attach_dynamic_layer(
        &self,
        resource: ResourceHandle,
        params: AttachParams,
    ) -> Result<bool, ChainError> {
        let inner = self.inner.clone();

        detached(async move { inner.attach(resource, params).await })
            .await
            .unwrap_or(Err(ChainError::ShutDown))
    }

    /// Stop the chain and release the supervisor
    ///
    /// Every later lifecycle call fails with [`ChainError::ShutDown`].
    pub async fn shutdown(&self) {
        let inner = self.inner.clone();
        detached(async move { inner.shutdown().await }).await;
    }
}

/// Why a guarded layer call produced no result
enum CallFailure {
    TimedOut,
    Panicked(String),
}

/// Await a spawned layer call for at most `limit`, aborting it on timeout
async fn guarded<T>(limit: Duration, mut task: JoinHandle<T>) -> Result<T, CallFailure> {
    match tokio::time::timeout(limit, &mut task).await {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(e)) => Err(CallFailure::Panicked(panic_message(e))),
        Err(_) => {
            task.abort();
            Err(CallFailure::TimedOut)
        }
    }
}

fn panic_message(e: JoinError) -> String {
    match e.try_into_panic() {
        Ok(payload) => payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string()),
        Err(e) => e.to_string(),
    }
}

/// Run a lifecycle operation on its own task so it cannot be abandoned half-way
///
/// Returns `None` if the runtime cancelled the task.
async fn detached<F>(op: F) -> Option<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    match tokio::spawn(op).await {
        Ok(output) => Some(output),
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(e) => {
            error!("Lifecycle task cancelled: {}", e);
            None
        }
    }
}

impl SupervisorInner {
    async fn start(&self, config: ChainConfig) -> Result<ChainOutcome, ChainError> {
        let mut guard = self.lifecycle.lock().await;
        let lifecycle = &mut *guard;

        if lifecycle.shut_down {
            return Err(ChainError::ShutDown);
        }

        let state = self.store.state();
        if state != ChainState::Stopped {
            warn!("Start of '{}' refused: chain is {}", config.name, state);
            return Err(ChainError::AlreadyRunning);
        }

        let report = ConfigValidator::with_available(lifecycle.layers.kinds()).validate(&config);
        for warning in &report.warnings {
            warn!("Chain '{}': {}", config.name, warning);
        }
        if !report.is_valid() {
            error!(
                "Chain '{}' rejected: {}",
                config.name,
                report.errors.join("; ")
            );
            return Err(ChainError::ConfigInvalid {
                errors: report.errors,
            });
        }

        let declared = config.declared_layers();
        info!("Starting chain '{}' ({} layers)", config.name, declared.len());

        self.store.transition(ChainState::Starting, |status| {
            for layer in &declared {
                let entry = LayerStatus::pending(layer.kind(), layer.is_critical());
                status.layers.insert(entry.name.clone(), entry);
            }
        })?;

        // Recorded before any layer call so a later stop sees every attempt
        let run = lifecycle.run.insert(ActiveRun::default());
        let mut failures = Vec::new();

        for layer_config in &declared {
            let kind = layer_config.kind();
            let Some(handle) = lifecycle.layers.get(kind).cloned() else {
                continue;
            };

            run.attempted.push(kind);
            match self.start_layer(handle, layer_config).await {
                Ok(()) => {
                    info!("Layer {} started", kind);
                    run.started.push(kind);
                    self.store.update(|status| {
                        if let Some(layer) = status.layer_mut(kind) {
                            layer.mark_running();
                        }
                    });
                }
                Err(e) => {
                    if layer_config.is_critical() {
                        error!("Critical layer {} failed: {}", kind, e);
                    } else {
                        warn!("Optional layer {} failed: {}", kind, e);
                    }
                    let cause = e.to_string();
                    self.store.update(|status| {
                        if let Some(layer) = status.layer_mut(kind) {
                            layer.mark_failed(cause);
                        }
                    });
                    failures.push(e);
                }
            }
        }

        let critical_down: Vec<LayerKind> = declared
            .iter()
            .filter(|l| l.is_critical() && !run.started.contains(&l.kind()))
            .map(|l| l.kind())
            .collect();

        let final_state = if critical_down.is_empty() {
            ChainState::Running
        } else {
            ChainState::Degraded
        };

        self.store.transition(final_state, |_| {})?;

        match final_state {
            ChainState::Running if failures.is_empty() => {
                info!("Chain '{}' running", config.name);
            }
            ChainState::Running => {
                info!(
                    "Chain '{}' running without {} optional layer(s)",
                    config.name,
                    failures.len()
                );
            }
            _ => {
                let names: Vec<&str> = critical_down.iter().map(|k| k.name()).collect();
                error!("Chain '{}' degraded: critical layers down: {}", config.name, names.join(", "));
            }
        }

        let run_id = self.store.snapshot().run_id;
        let monitored = run
            .started
            .iter()
            .filter_map(|kind| {
                lifecycle.layers.get(*kind).map(|handle| MonitoredLayer {
                    kind: *kind,
                    handle: handle.clone(),
                })
            })
            .collect();

        run.monitor = Some(
            MonitoringLoop::new(self.store.clone(), run_id, monitored, &self.config.monitor)
                .spawn(),
        );

        Ok(ChainOutcome {
            state: final_state,
            failures,
            warnings: report.warnings,
        })
    }

    async fn start_layer(
        &self,
        handle: Arc<dyn LayerHandle>,
        config: &LayerConfig,
    ) -> Result<(), ChainError> {
        let layer = config.kind();
        debug!("Starting layer {}", layer);

        let config = config.clone();
        let task = tokio::spawn(async move { handle.start(&config).await });

        match guarded(self.config.start_timeout, task).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ChainError::LayerStartFailed {
                layer,
                cause: e.to_string(),
            }),
            Err(CallFailure::Panicked(msg)) => Err(ChainError::LayerStartFailed {
                layer,
                cause: format!("layer panicked: {}", msg),
            }),
            Err(CallFailure::TimedOut) => Err(ChainError::Timeout { layer }),
        }
    }

    async fn stop(&self) -> ChainOutcome {
        let mut guard = self.lifecycle.lock().await;
        self.stop_locked(&mut guard).await
    }

    async fn stop_locked(&self, lifecycle: &mut Lifecycle) -> ChainOutcome {
        let state = self.store.state();
        if state == ChainState::Stopped {
            debug!("Stop requested on a stopped chain");
            return ChainOutcome::new(ChainState::Stopped, Vec::new());
        }

        // Only reachable when a start was torn down mid-way
        if state == ChainState::Starting {
            warn!("Stopping a chain whose start never finished");
            if let Err(e) = self.store.transition(ChainState::Degraded, |_| {}) {
                error!("Failed to leave STARTING: {}", e);
            }
        }

        info!("Stopping chain");
        if let Err(e) = self.store.transition(ChainState::Stopping, |_| {}) {
            error!("Stopping from an unexpected state: {}", e);
        }

        let run = lifecycle.run.take().unwrap_or_default();

        if let Some(monitor) = run.monitor {
            monitor.shutdown().await;
        }

        let mut failures = Vec::new();
        for kind in run.attempted.iter().rev() {
            let Some(handle) = lifecycle.layers.get(*kind).cloned() else {
                continue;
            };

            let task = tokio::spawn(async move { handle.stop().await });
            let cause = match guarded(self.config.stop_timeout, task).await {
                Ok(Ok(())) => {
                    debug!("Layer {} stopped", kind);
                    continue;
                }
                Ok(Err(e)) => e.to_string(),
                Err(CallFailure::Panicked(msg)) => format!("layer panicked: {}", msg),
                Err(CallFailure::TimedOut) => {
                    warn!("Layer {} timed out while stopping", kind);
                    failures.push(ChainError::Timeout { layer: *kind });
                    continue;
                }
            };

            warn!("Layer {} failed to stop: {}", kind, cause);
            failures.push(ChainError::LayerStopFailed {
                layer: *kind,
                cause,
            });
        }

        if let Err(e) = self.store.transition(ChainState::Stopped, |_| {}) {
            error!("Failed to publish stopped state: {}", e);
        }

        let state = self.store.state();
        info!("Chain {} ({} stop failure(s))", state, failures.len());
        ChainOutcome::new(state, failures)
    }

    async fn attach(
        &self,
        resource: ResourceHandle,
        params: AttachParams,
    ) -> Result<bool, ChainError> {
        let mut guard = self.lifecycle.lock().await;
        let lifecycle = &mut *guard;

        if lifecycle.shut_down {
            return Err(ChainError::ShutDown);
        }
        if !self.store.state().is_active() {
            return Err(ChainError::NotRunning);
        }
        if !resource.is_valid() {
            return Err(ChainError::ResourceUnavailable(format!(
                "invalid resource handle {}",
                resource.raw()
            )));
        }

        let Some(run) = lifecycle.run.as_mut() else {
            return Err(ChainError::NotRunning);
        };
        if let Some(previous) = run.attach {
            debug!("Dynamic layer already attached this run");
            return Ok(previous);
        }

        let targets: Vec<(LayerKind, Arc<dyn LayerHandle>)> = run
            .started
            .iter()
            .filter_map(|kind| lifecycle.layers.get(*kind).map(|h| (*kind, h.clone())))
            .filter(|(_, handle)| handle.supports_attach())
            .collect();

        if targets.is_empty() {
            warn!("No running layer accepts a late-bound resource");
        }

        let mut failed = false;
        for (kind, handle) in targets {
            let call_params = params.clone();
            let task = tokio::spawn(async move { handle.attach(resource, &call_params).await });

            let cause = match guarded(self.config.attach_timeout, task).await {
                Ok(Ok(id)) => {
                    info!("Attached resource {} to layer {}", resource.raw(), kind);
                    run.attachments.push((kind, id));
                    continue;
                }
                Ok(Err(e)) => format!("attach failed: {}", e),
                Err(CallFailure::Panicked(msg)) => format!("attach panicked: {}", msg),
                Err(CallFailure::TimedOut) => "attach timed out".to_string(),
            };

            warn!("Layer {}: {}", kind, cause);
            failed = true;
            self.store.update(|status| {
                if let Some(layer) = status.layer_mut(kind) {
                    layer.error = Some(cause);
                }
            });
        }

        let outcome = !failed && !run.attachments.is_empty();
        run.attach = Some(outcome);
        Ok(outcome)
    }

    async fn shutdown(&self) {
        let mut guard = self.lifecycle.lock().await;
        if guard.shut_down {
            return;
        }

        self.stop_locked(&mut guard).await;
        guard.layers.clear();
        guard.shut_down = true;
        info!("Supervisor shut down");
    }
}
