//! Heartbeat liveness monitoring.
//!
//! One probe task per connection. Each tick runs [`Transport::probe`] under
//! the probe timeout; an answer resets the missed count and pushes the
//! registry deadline forward, silence counts as a miss. Reaching the miss
//! threshold reports one `HEARTBEAT_TIMEOUT`, expires the registry deadline
//! so the next cleanup tick evicts the connection, and ends the task.
//!
//! [`Transport::probe`]: crate::transport::Transport::probe

use std::ops::ControlFlow;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::FutureExt;
use lifeline_core::{ConnectionId, EngineError, ErrorClassification, Result};
use lifeline_settings::HeartbeatSettings;
use lifeline_telemetry::{MetricsCollector, Tags, names};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::classifier::{ErrorClassifier, panic_message};
use crate::registry::{ConnectionInfo, ConnectionRegistry};

/// Liveness state of one monitored connection.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatState {
    /// Consecutive unanswered probes.
    pub missed_count: u32,
    /// When the last probe was sent.
    pub last_probe_at: Option<DateTime<Utc>>,
    /// When the last answer arrived.
    pub last_success_at: Option<DateTime<Utc>>,
    /// Set once the miss threshold was reached. Never cleared.
    pub timed_out: bool,
}

/// Effect of one recorded probe result.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Answer recorded; missed count is zero.
    Alive,
    /// Miss recorded below the threshold, or after the timeout already fired.
    Missed {
        /// Missed count after this miss.
        missed_count: u32,
    },
    /// This miss reached the threshold and fired the timeout.
    TimedOut {
        /// Missed count after this miss.
        missed_count: u32,
    },
}

/// Why a probe task ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeartbeatResult {
    /// Miss threshold reached.
    TimedOut,
    /// Stopped through [`HeartbeatMonitor::stop`] or shutdown.
    Cancelled,
    /// The transport reported an error during a probe.
    ProbeFailed,
    /// The connection left the registry.
    Removed,
}

/// Counters across all monitored connections.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatStats {
    /// Connections with heartbeat state.
    pub monitored: usize,
    /// Probes sent.
    pub probes: u64,
    /// Answers recorded.
    pub successes: u64,
    /// Misses recorded.
    pub failures: u64,
    /// Timeouts fired.
    pub timeouts: u64,
}

struct Monitored {
    state: Mutex<HeartbeatState>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<HeartbeatResult>>>,
}

/// Per-connection probe tasks and their state.
pub struct HeartbeatMonitor {
    settings: HeartbeatSettings,
    registry: Arc<ConnectionRegistry>,
    classifier: Arc<ErrorClassifier>,
    metrics: Arc<MetricsCollector>,
    root: CancellationToken,
    monitored: DashMap<ConnectionId, Arc<Monitored>>,
    probes: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    timeouts: AtomicU64,
}

impl HeartbeatMonitor {
    /// Create a monitor whose tasks are children of `root`.
    pub fn new(
        settings: HeartbeatSettings,
        registry: Arc<ConnectionRegistry>,
        classifier: Arc<ErrorClassifier>,
        metrics: Arc<MetricsCollector>,
        root: CancellationToken,
    ) -> Self {
        Self {
            settings,
            registry,
            classifier,
            metrics,
            root,
            monitored: DashMap::new(),
            probes: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
        }
    }

    /// Settings in effect.
    pub fn settings(&self) -> &HeartbeatSettings {
        &self.settings
    }

    /// Start probing a registered connection.
    ///
    /// A connection that already has a running task keeps it.
    pub fn start(self: &Arc<Self>, id: &ConnectionId) -> Result<()> {
        if !self.registry.contains(id) {
            return Err(EngineError::NotFound(id.clone()));
        }
        if let Some(existing) = self.monitored.get(id) {
            let running = existing
                .task
                .lock()
                .as_ref()
                .is_some_and(|t| !t.is_finished());
            if running {
                return Ok(());
            }
        }

        let entry = Arc::new(Monitored {
            state: Mutex::new(HeartbeatState::default()),
            cancel: self.root.child_token(),
            task: Mutex::new(None),
        });
        if let Some(previous) = self.monitored.insert(id.clone(), entry.clone()) {
            previous.cancel.cancel();
        }

        let handle = tokio::spawn(self.clone().probe_loop(id.clone(), entry.clone()));
        *entry.task.lock() = Some(handle);
        debug!(conn_id = %id, "heartbeat started");
        Ok(())
    }

    /// Stop probing `id` and drop its state. Returns false when not monitored.
    pub fn stop(&self, id: &ConnectionId) -> bool {
        match self.monitored.remove(id) {
            Some((_, entry)) => {
                entry.cancel.cancel();
                debug!(conn_id = %id, "heartbeat stopped");
                true
            }
            None => false,
        }
    }

    /// Stop every probe task and wait for them to end.
    pub async fn shutdown(&self) {
        let ids: Vec<ConnectionId> = self.monitored.iter().map(|e| e.key().clone()).collect();
        let mut handles = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some((_, entry)) = self.monitored.remove(&id) {
                entry.cancel.cancel();
                if let Some(handle) = entry.task.lock().take() {
                    handles.push(handle);
                }
            }
        }
        let _ = futures::future::join_all(handles).await;
    }

    /// Wait for the probe task of `id` to end.
    ///
    /// Returns `None` when `id` is not monitored or was already waited on.
    pub async fn wait(&self, id: &ConnectionId) -> Option<HeartbeatResult> {
        let entry = self.monitored.get(id).map(|e| e.value().clone())?;
        let handle = entry.task.lock().take()?;
        handle.await.ok()
    }

    /// Drop state for connections that left the registry.
    pub fn purge_stale(&self) -> usize {
        let stale: Vec<ConnectionId> = self
            .monitored
            .iter()
            .filter(|e| !self.registry.contains(e.key()))
            .map(|e| e.key().clone())
            .collect();
        stale.iter().filter(|id| self.stop(id)).count()
    }

    /// Snapshot of the state of `id`.
    pub fn state(&self, id: &ConnectionId) -> Option<HeartbeatState> {
        self.monitored.get(id).map(|e| e.state.lock().clone())
    }

    /// Whether `id` has heartbeat state.
    pub fn is_monitored(&self, id: &ConnectionId) -> bool {
        self.monitored.contains_key(id)
    }

    /// Counters across all connections.
    pub fn stats(&self) -> HeartbeatStats {
        HeartbeatStats {
            monitored: self.monitored.len(),
            probes: self.probes.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
        }
    }

    // ── State transitions ───────────────────────────────────────────

    /// Record an answer from `id`, e.g. a pong seen outside the probe task.
    pub fn record_success(&self, id: &ConnectionId) -> Result<ProbeOutcome> {
        let entry = self.entry(id)?;
        Ok(self.apply_success(id, &entry))
    }

    /// Record a missed probe for `id`.
    pub fn record_failure(&self, id: &ConnectionId) -> Result<ProbeOutcome> {
        let entry = self.entry(id)?;
        Ok(self.apply_failure(id, &entry))
    }

    fn entry(&self, id: &ConnectionId) -> Result<Arc<Monitored>> {
        self.monitored
            .get(id)
            .map(|e| e.value().clone())
            .ok_or_else(|| EngineError::NotFound(id.clone()))
    }

    fn apply_success(&self, id: &ConnectionId, entry: &Monitored) -> ProbeOutcome {
        {
            let mut state = entry.state.lock();
            state.missed_count = 0;
            state.last_success_at = Some(Utc::now());
            // registry updates stay under the state lock so a concurrent
            // timeout cannot be overwritten by a late extension
            if !state.timed_out {
                let _ = self
                    .registry
                    .extend_timeout(id, Instant::now() + self.settings.connection_timeout());
            }
            let _ = self.registry.touch(id);
        }
        let _ = self.successes.fetch_add(1, Ordering::Relaxed);
        ProbeOutcome::Alive
    }

    fn apply_failure(&self, id: &ConnectionId, entry: &Monitored) -> ProbeOutcome {
        let outcome = {
            let mut state = entry.state.lock();
            state.missed_count = state.missed_count.saturating_add(1);
            let missed_count = state.missed_count;
            if !state.timed_out && missed_count >= self.settings.miss_threshold {
                state.timed_out = true;
                let _ = self.registry.expire_now(id);
                ProbeOutcome::TimedOut { missed_count }
            } else {
                ProbeOutcome::Missed { missed_count }
            }
        };

        let _ = self.failures.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .record_counter(names::HEARTBEAT_MISSES_TOTAL, 1.0, Tags::new());

        if let ProbeOutcome::TimedOut { missed_count } = outcome {
            let _ = self.timeouts.fetch_add(1, Ordering::Relaxed);
            self.metrics
                .record_counter(names::HEARTBEAT_TIMEOUTS_TOTAL, 1.0, Tags::new());
            let _ = self.classifier.classify_connection(
                id,
                ErrorClassification::HeartbeatTimeout,
                format!("{missed_count} consecutive heartbeat probes missed"),
            );
        }
        outcome
    }

    // ── Probe task ──────────────────────────────────────────────────

    #[instrument(skip_all, fields(conn_id = %id))]
    async fn probe_loop(self: Arc<Self>, id: ConnectionId, entry: Arc<Monitored>) -> HeartbeatResult {
        let period = self.settings.interval();
        let mut ticker = time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let result = loop {
            tokio::select! {
                biased;
                () = entry.cancel.cancelled() => break HeartbeatResult::Cancelled,
                _ = ticker.tick() => {}
            }
            if entry.cancel.is_cancelled() {
                break HeartbeatResult::Cancelled;
            }
            let Ok(info) = self.registry.lookup(&id) else {
                break HeartbeatResult::Removed;
            };
            if let ControlFlow::Break(result) = self.probe_once(&id, &info, &entry).await {
                break result;
            }
        };

        debug!(?result, "heartbeat task ended");
        result
    }

    async fn probe_once(
        &self,
        id: &ConnectionId,
        info: &ConnectionInfo,
        entry: &Monitored,
    ) -> ControlFlow<HeartbeatResult> {
        entry.state.lock().last_probe_at = Some(Utc::now());
        let _ = self.probes.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .record_counter(names::HEARTBEAT_PROBES_TOTAL, 1.0, Tags::new());

        let started = Instant::now();
        let probe = AssertUnwindSafe(info.transport().probe()).catch_unwind();
        let outcome = tokio::select! {
            biased;
            () = entry.cancel.cancelled() => return ControlFlow::Break(HeartbeatResult::Cancelled),
            r = time::timeout(self.settings.probe_timeout(), probe) => r,
        };

        match outcome {
            Ok(Ok(Ok(()))) => {
                #[allow(clippy::cast_precision_loss)]
                let latency_ms = started.elapsed().as_millis() as f64;
                self.metrics
                    .record_timer(names::HEARTBEAT_PROBE_LATENCY_MS, latency_ms, Tags::new());
                let _ = self.apply_success(id, entry);
                ControlFlow::Continue(())
            }
            Ok(Ok(Err(e))) => {
                let _ = self.classifier.classify_connection(
                    id,
                    ErrorClassification::HeartbeatError,
                    format!("heartbeat probe failed: {e}"),
                );
                let _ = self.apply_failure(id, entry);
                ControlFlow::Break(HeartbeatResult::ProbeFailed)
            }
            Ok(Err(panic)) => {
                let _ = self.classifier.classify_connection(
                    id,
                    ErrorClassification::HeartbeatLoopError,
                    format!("heartbeat probe panicked: {}", panic_message(panic.as_ref())),
                );
                ControlFlow::Continue(())
            }
            Err(_elapsed) => match self.apply_failure(id, entry) {
                ProbeOutcome::TimedOut { missed_count } => {
                    info!(conn_id = %id, missed_count, "heartbeat timed out");
                    ControlFlow::Break(HeartbeatResult::TimedOut)
                }
                ProbeOutcome::Missed { missed_count } => {
                    debug!(conn_id = %id, missed_count, "heartbeat probe missed");
                    if entry.state.lock().timed_out {
                        ControlFlow::Break(HeartbeatResult::TimedOut)
                    } else {
                        ControlFlow::Continue(())
                    }
                }
                ProbeOutcome::Alive => ControlFlow::Continue(()),
            },
        }
    }
}
