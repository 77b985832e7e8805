//! Monitoring Loop
//!
//! A single background task that polls every live layer while the chain
//! is `RUNNING` or `DEGRADED` and publishes one new status snapshot per
//! tick.
//!
//! # Polling Interval
//!
//! - Starts at 1000 ms
//! - Clean tick: interval × 0.95, floor 1000 ms
//! - Failed tick: interval × 1.5, ceiling 10000 ms
//!
//! # Cancellation
//!
//! The loop checks its liveness flag at the top of every iteration and
//! is woken early by [`MonitorHandle::shutdown`], which also joins the
//! task. A tick in flight when shutdown begins is abandoned before it
//! writes anything.

use crate::config::MonitorConfig;
use crate::layer::{LayerHandle, LayerKind};
use crate::status::{ChainState, StatusStore};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Multiplicatively adapting poll interval
#[derive(Debug, Clone)]
pub struct AdaptiveInterval {
    current: Duration,
    min: Duration,
    max: Duration,
    decay: f64,
    growth: f64,
}

impl AdaptiveInterval {
    /// Create from monitor configuration
    pub fn new(config: &MonitorConfig) -> Self {
        let min = config.min_interval;
        let max = config.max_interval.max(min);
        Self {
            current: config.initial_interval.clamp(min, max),
            min,
            max,
            decay: config.decay,
            growth: config.growth,
        }
    }

    /// Current interval
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Shrink after a clean tick
    pub fn on_success(&mut self) -> Duration {
        self.scale(self.decay)
    }

    /// Grow after a failed tick
    pub fn on_error(&mut self) -> Duration {
        self.scale(self.growth)
    }

    fn scale(&mut self, factor: f64) -> Duration {
        let next = Duration::from_secs_f64(self.current.as_secs_f64() * factor);
        self.current = next.clamp(self.min, self.max);
        self.current
    }
}

/// Monotonic view over a counter that may reset or go negative
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterClamp {
    last: u64,
}

impl CounterClamp {
    /// Feed a raw reading, get the clamped value
    pub fn observe(&mut self, raw: i64) -> u64 {
        let raw = u64::try_from(raw).unwrap_or(0);
        self.last = self.last.max(raw);
        self.last
    }

    /// Last clamped value
    pub fn value(&self) -> u64 {
        self.last
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct LayerCounters {
    up: CounterClamp,
    down: CounterClamp,
}

/// A layer the monitor polls
#[derive(Clone)]
pub struct MonitoredLayer {
    pub kind: LayerKind,
    pub handle: Arc<dyn LayerHandle>,
}

/// Result of polling one layer
enum Poll {
    Live { up: i64, down: i64 },
    Lost,
    Failed(String),
}

/// Background poller for one chain run
pub struct MonitoringLoop {
    store: Arc<StatusStore>,
    run_id: u64,
    layers: Vec<MonitoredLayer>,
    counters: BTreeMap<LayerKind, LayerCounters>,
    lost: Vec<LayerKind>,
    interval: AdaptiveInterval,
    poll_timeout: Duration,
    alive: Arc<AtomicBool>,
    wake: Arc<Notify>,
}

/// Handle to a spawned [`MonitoringLoop`]
pub struct MonitorHandle {
    alive: Arc<AtomicBool>,
    wake: Arc<Notify>,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    /// Check if the task has exited
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Signal the loop to exit and wait for it
    pub async fn shutdown(mut self) {
        self.signal();

        if let Err(e) = (&mut self.task).await {
            warn!("Monitoring task ended abnormally: {}", e);
        }
    }

    fn signal(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.wake.notify_one();
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        if !self.task.is_finished() {
            self.signal();
        }
    }
}

impl MonitoringLoop {
    /// Create a loop for run `run_id` over the layers that came up
    pub fn new(
        store: Arc<StatusStore>,
        run_id: u64,
        layers: Vec<MonitoredLayer>,
        config: &MonitorConfig,
    ) -> Self {
        let counters = layers
            .iter()
            .map(|l| (l.kind, LayerCounters::default()))
            .collect();

        Self {
            store,
            run_id,
            layers,
            counters,
            lost: Vec::new(),
            interval: AdaptiveInterval::new(config),
            poll_timeout: config.poll_timeout,
            alive: Arc::new(AtomicBool::new(true)),
            wake: Arc::new(Notify::new()),
        }
    }

    /// Spawn onto the tokio runtime
    pub fn spawn(self) -> MonitorHandle {
        let alive = self.alive.clone();
        let wake = self.wake.clone();
        let task = tokio::spawn(self.run());

        MonitorHandle { alive, wake, task }
    }

    async fn run(mut self) {
        let wake = self.wake.clone();
        debug!("Monitoring started for run {}", self.run_id);

        loop {
            if !self.alive.load(Ordering::SeqCst) {
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.interval.current()) => {}
                _ = wake.notified() => continue,
            }

            if !self.alive.load(Ordering::SeqCst) {
                break;
            }

            let published = tokio::select! {
                published = self.tick() => published,
                _ = wake.notified() => continue,
            };

            if !published {
                debug!("Run {} no longer active, monitor exiting", self.run_id);
                break;
            }
        }

        info!("Monitoring stopped for run {}", self.run_id);
    }

    /// Poll every live layer and publish one snapshot
    ///
    /// Returns whether the snapshot was accepted by the store.
    async fn tick(&mut self) -> bool {
        let mut errors = Vec::new();
        let mut newly_lost = Vec::new();

        for layer in &self.layers {
            if self.lost.contains(&layer.kind) {
                continue;
            }

            match Self::poll(layer, self.poll_timeout).await {
                Poll::Live { up, down } => {
                    let counters = self.counters.entry(layer.kind).or_default();
                    counters.up.observe(up);
                    counters.down.observe(down);
                }
                Poll::Lost => newly_lost.push(layer.kind),
                Poll::Failed(e) => errors.push(format!("{}: {}", layer.kind, e)),
            }
        }

        for kind in &newly_lost {
            warn!("Layer {} stopped unexpectedly", kind);
        }
        self.lost.extend(newly_lost.iter().copied());

        let counters = self.counters.clone();
        let published = self.store.update_if_active(self.run_id, |status| {
            let (mut total_up, mut total_down) = (0u64, 0u64);

            for (kind, c) in &counters {
                total_up = total_up.saturating_add(c.up.value());
                total_down = total_down.saturating_add(c.down.value());

                if let Some(layer) = status.layer_mut(*kind) {
                    layer.bytes_up = c.up.value();
                    layer.bytes_down = c.down.value();
                }
            }

            for kind in &newly_lost {
                if let Some(layer) = status.layer_mut(*kind) {
                    layer.mark_failed("layer stopped unexpectedly");
                }
            }
            if !newly_lost.is_empty() && status.state == ChainState::Running {
                status.state = ChainState::Degraded;
            }

            status.bytes_up = status.bytes_up.max(total_up);
            status.bytes_down = status.bytes_down.max(total_down);
        });

        if errors.is_empty() {
            let prev = self.interval.current();
            let next = self.interval.on_success();
            if next != prev {
                debug!("Monitor interval decreased to {:?}", next);
            }
        } else {
            let next = self.interval.on_error();
            warn!("Monitor tick failed ({}), interval now {:?}", errors.join(", "), next);
        }

        published
    }

    async fn poll(layer: &MonitoredLayer, timeout: Duration) -> Poll {
        match tokio::time::timeout(timeout, layer.handle.is_running()).await {
            Ok(true) => {}
            Ok(false) => return Poll::Lost,
            Err(_) => return Poll::Failed("status poll timed out".into()),
        }

        match tokio::time::timeout(timeout, layer.handle.metrics()).await {
            Ok(Ok(m)) => Poll::Live {
                up: m.bytes_up,
                down: m.bytes_down,
            },
            Ok(Err(e)) => Poll::Failed(e.to_string()),
            Err(_) => Poll::Failed("metrics poll timed out".into()),
        }
    }
}
