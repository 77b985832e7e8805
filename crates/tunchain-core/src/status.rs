//! Chain Status
//!
//! [`StatusStore`] is the single source of truth for the aggregate chain
//! state. Every write builds a complete [`ChainStatus`] and swaps it in
//! while holding the channel's write lock, so subscribers only ever see
//! whole snapshots.
//!
//! # State Machine
//!
//! ```text
//!   STOPPED ──start──▶ STARTING ──┬──▶ RUNNING ──layer lost──▶ DEGRADED
//!      ▲                          └──────────────────────────▶ DEGRADED
//!      │                                 │                        │
//!      └──────── STOPPING ◀────stop──────┴────────────────────────┘
//! ```
//!
//! `DEGRADED` never returns to `RUNNING` on its own; only a restart
//! clears it.

use crate::error::ChainError;
use crate::layer::LayerKind;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error};

/// Smallest uptime reported while a run is in progress
const MIN_UPTIME: Duration = Duration::from_millis(1);

/// Aggregate chain state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChainState {
    /// No layer is up
    Stopped,
    /// Layers are being started
    Starting,
    /// Every critical layer is up
    Running,
    /// At least one layer is down that should be up
    Degraded,
    /// Layers are being stopped
    Stopping,
}

impl ChainState {
    /// Check the transition table
    pub fn can_transition_to(&self, to: ChainState) -> bool {
        use ChainState::*;
        matches!(
            (self, to),
            (Stopped, Starting)
                | (Starting, Running)
                | (Starting, Degraded)
                | (Running, Stopping)
                | (Degraded, Stopping)
                | (Stopping, Stopped)
                | (Running, Degraded)
        )
    }

    /// Layers are up (fully or partially) and being monitored
    pub fn is_active(&self) -> bool {
        matches!(self, ChainState::Running | ChainState::Degraded)
    }

    /// Upper-case label
    pub fn label(&self) -> &'static str {
        match self {
            ChainState::Stopped => "STOPPED",
            ChainState::Starting => "STARTING",
            ChainState::Running => "RUNNING",
            ChainState::Degraded => "DEGRADED",
            ChainState::Stopping => "STOPPING",
        }
    }
}

impl std::fmt::Display for ChainState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Status of one layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerStatus {
    /// Layer name (key in [`ChainStatus::layers`])
    pub name: String,
    /// Layer identity
    pub kind: LayerKind,
    /// Declared criticality
    pub critical: bool,
    /// Is the layer up?
    pub running: bool,
    /// Last error, if any
    pub error: Option<String>,
    /// Last time this record changed
    pub updated_at: Instant,
    /// Clamped bytes sent upstream
    pub bytes_up: u64,
    /// Clamped bytes received
    pub bytes_down: u64,
}

impl LayerStatus {
    /// Record for a layer that has not started yet
    pub fn pending(kind: LayerKind, critical: bool) -> Self {
        Self {
            name: kind.name().to_string(),
            kind,
            critical,
            running: false,
            error: None,
            updated_at: Instant::now(),
            bytes_up: 0,
            bytes_down: 0,
        }
    }

    /// Mark as up
    pub fn mark_running(&mut self) {
        self.running = true;
        self.error = None;
        self.updated_at = Instant::now();
    }

    /// Mark as down with a cause
    pub fn mark_failed(&mut self, cause: impl Into<String>) {
        self.running = false;
        self.error = Some(cause.into());
        self.updated_at = Instant::now();
    }
}

/// Aggregate chain status snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainStatus {
    /// Current state
    pub state: ChainState,
    /// Per-layer status, keyed by layer name
    pub layers: BTreeMap<String, LayerStatus>,
    /// Time since the current run began; zero iff stopped
    pub uptime: Duration,
    /// Cumulative bytes sent across layers
    pub bytes_up: u64,
    /// Cumulative bytes received across layers
    pub bytes_down: u64,
    /// Incremented on every start
    pub run_id: u64,
    /// When the current run began
    pub started_at: Option<Instant>,
}

impl ChainStatus {
    /// Initial status
    pub fn stopped() -> Self {
        Self {
            state: ChainState::Stopped,
            layers: BTreeMap::new(),
            uptime: Duration::ZERO,
            bytes_up: 0,
            bytes_down: 0,
            run_id: 0,
            started_at: None,
        }
    }

    /// Status of one layer
    pub fn layer(&self, kind: LayerKind) -> Option<&LayerStatus> {
        self.layers.get(kind.name())
    }

    /// Mutable status of one layer
    pub fn layer_mut(&mut self, kind: LayerKind) -> Option<&mut LayerStatus> {
        self.layers.get_mut(kind.name())
    }

    /// Layers currently up, in start order
    pub fn running_layers(&self) -> Vec<LayerKind> {
        let mut kinds: Vec<_> = self
            .layers
            .values()
            .filter(|l| l.running)
            .map(|l| l.kind)
            .collect();
        kinds.sort();
        kinds
    }

    /// Check the invariants a reader relies on
    pub fn is_consistent(&self) -> bool {
        match self.state {
            ChainState::Stopped => {
                self.layers.is_empty()
                    && self.uptime.is_zero()
                    && self.started_at.is_none()
                    && self.bytes_up == 0
                    && self.bytes_down == 0
            }
            _ => self.started_at.is_some() && !self.uptime.is_zero(),
        }
    }

    /// One-line human-readable summary
    pub fn summary(&self) -> String {
        let layers: Vec<String> = LayerKind::START_ORDER
            .iter()
            .filter_map(|k| self.layer(*k))
            .map(|l| format!("{}:{}", l.name, if l.running { "up" } else { "down" }))
            .collect();

        format!(
            "Chain: {} | Layers: [{}] | Uptime: {}s | TX: {:.2}MB, RX: {:.2}MB",
            self.state,
            layers.join(" "),
            self.uptime.as_secs(),
            self.bytes_up as f64 / (1024.0 * 1024.0),
            self.bytes_down as f64 / (1024.0 * 1024.0),
        )
    }

    /// Normalise the fields derived from `state`
    fn settle(&mut self) {
        if self.state == ChainState::Stopped {
            self.layers.clear();
            self.uptime = Duration::ZERO;
            self.bytes_up = 0;
            self.bytes_down = 0;
            self.started_at = None;
        } else {
            let since = *self.started_at.get_or_insert_with(Instant::now);
            self.uptime = since.elapsed().max(MIN_UPTIME);
        }
    }
}

impl Default for ChainStatus {
    fn default() -> Self {
        Self::stopped()
    }
}

/// Holder of the current [`ChainStatus`]
///
/// Writers go through [`transition`](Self::transition),
/// [`update`](Self::update) or [`update_if_active`](Self::update_if_active);
/// each call replaces the whole snapshot under one exclusive lock.
pub struct StatusStore {
    tx: watch::Sender<ChainStatus>,
}

impl StatusStore {
    /// Create a store in the stopped state
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ChainStatus::stopped());
        Self { tx }
    }

    /// Current snapshot
    pub fn snapshot(&self) -> ChainStatus {
        self.tx.borrow().clone()
    }

    /// Current state
    pub fn state(&self) -> ChainState {
        self.tx.borrow().state
    }

    /// Subscribe to snapshot updates
    pub fn subscribe(&self) -> watch::Receiver<ChainStatus> {
        self.tx.subscribe()
    }

    /// Move to `to`, applying `update` to the new snapshot
    ///
    /// Returns the previous state.
    pub fn transition<F>(&self, to: ChainState, update: F) -> Result<ChainState, ChainError>
    where
        F: FnOnce(&mut ChainStatus),
    {
        let mut result = Err(ChainError::InvalidTransition {
            from: ChainState::Stopped,
            to,
        });

        self.tx.send_if_modified(|current| {
            let from = current.state;
            if !from.can_transition_to(to) {
                result = Err(ChainError::InvalidTransition { from, to });
                return false;
            }

            let mut next = current.clone();
            next.state = to;
            if from == ChainState::Stopped {
                next.run_id = current.run_id + 1;
                next.started_at = Some(Instant::now());
            }
            update(&mut next);
            next.state = to;
            next.settle();

            *current = next;
            result = Ok(from);
            true
        });

        match &result {
            Ok(from) => debug!("Chain state {} -> {}", from, to),
            Err(e) => error!("Rejected state change: {}", e),
        }
        result
    }

    /// Replace the snapshot without changing state
    pub fn update<F>(&self, update: F)
    where
        F: FnOnce(&mut ChainStatus),
    {
        self.tx.send_modify(|current| {
            let mut next = current.clone();
            update(&mut next);
            next.state = current.state;
            next.run_id = current.run_id;
            next.settle();
            *current = next;
        });
    }

    /// Replace the snapshot only while run `run_id` is active
    ///
    /// `update` may move the state from `RUNNING` to `DEGRADED`; any other
    /// state change is discarded along with the rest of the update.
    /// Returns whether the snapshot was written.
    pub fn update_if_active<F>(&self, run_id: u64, update: F) -> bool
    where
        F: FnOnce(&mut ChainStatus),
    {
        self.tx.send_if_modified(|current| {
            if current.run_id != run_id || !current.state.is_active() {
                return false;
            }

            let mut next = current.clone();
            update(&mut next);
            next.run_id = run_id;
            if next.state != current.state && !current.state.can_transition_to(next.state) {
                return false;
            }
            if next.state != current.state {
                debug!("Chain state {} -> {}", current.state, next.state);
            }
            next.settle();

            *current = next;
            true
        })
    }
}

impl Default for StatusStore {
    fn default() -> Self {
        Self::new()
    }
}
