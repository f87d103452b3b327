//! Background eviction of timed-out connections.
//!
//! A single loop wakes every cleanup interval and runs one [`tick`]:
//! evict every connection whose registry deadline has passed, purge
//! heartbeat state for connections that are gone, prune old error records
//! and forget settled reconnection records. A failed tick is classified `CLEANUP_TICK_ERROR` and followed
//! by the error backoff; the loop only ends on cancellation.
//!
//! [`tick`]: CleanupMonitor::tick

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use lifeline_core::{ConnectionId, ErrorClassification, IdentityKey, Result, UserId};
use lifeline_settings::CleanupSettings;
use lifeline_telemetry::{MetricsCollector, Tags, names};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::batching::BatchingEngine;
use crate::classifier::{ErrorClassifier, ErrorReport, panic_message};
use crate::heartbeat::HeartbeatMonitor;
use crate::reconnect::{ReconnectionOrchestrator, Reconnector};
use crate::registry::ConnectionRegistry;
use crate::shutdown::ShutdownCoordinator;

/// Evicts one connection. Must be idempotent.
#[async_trait]
pub trait RemovalCallback: Send + Sync {
    /// Remove `id` and release everything attached to it.
    async fn remove(&self, id: &ConnectionId) -> Result<()>;
}

/// Default eviction: heartbeat task, registry entry, pending batch,
/// transport, then a disconnect notice to the reconnection orchestrator once
/// no other connection serves the same identity. With a [`Reconnector`]
/// attached, the notice also spawns a tracked task driving the attempts.
pub struct RegistryRemoval {
    registry: Arc<ConnectionRegistry>,
    heartbeat: Arc<HeartbeatMonitor>,
    reconnection: Option<Arc<ReconnectionOrchestrator>>,
    batching: Option<Arc<BatchingEngine<Bytes>>>,
    driver: Option<(Arc<dyn Reconnector>, Arc<ShutdownCoordinator>)>,
}

impl RegistryRemoval {
    /// Create the callback. Without an orchestrator no disconnect is signalled.
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        heartbeat: Arc<HeartbeatMonitor>,
        reconnection: Option<Arc<ReconnectionOrchestrator>>,
    ) -> Self {
        Self {
            registry,
            heartbeat,
            reconnection,
            batching: None,
            driver: None,
        }
    }

    /// Discard the evicted connection's pending messages from `batching`.
    #[must_use]
    pub fn with_batching(mut self, batching: Arc<BatchingEngine<Bytes>>) -> Self {
        self.batching = Some(batching);
        self
    }

    /// Drive reconnection attempts with `reconnector` on tasks tracked by
    /// `shutdown`.
    #[must_use]
    pub fn with_reconnector(
        mut self,
        reconnector: Arc<dyn Reconnector>,
        shutdown: Arc<ShutdownCoordinator>,
    ) -> Self {
        self.driver = Some((reconnector, shutdown));
        self
    }

    fn drive(&self, reconnection: &Arc<ReconnectionOrchestrator>, identity: &IdentityKey) {
        let Some((reconnector, shutdown)) = &self.driver else {
            return;
        };
        if shutdown.is_shutting_down() {
            return;
        }
        let reconnection = reconnection.clone();
        let reconnector = reconnector.clone();
        let identity = identity.clone();
        shutdown.track(
            "reconnect",
            tokio::spawn(async move {
                match reconnection
                    .run_reconnect(&identity, reconnector.as_ref())
                    .await
                {
                    Ok(state) => debug!(identity = %identity, ?state, "reconnection driver finished"),
                    Err(e) => debug!(identity = %identity, error = %e, "reconnection driver stopped"),
                }
            }),
        );
    }
}

#[async_trait]
impl RemovalCallback for RegistryRemoval {
    async fn remove(&self, id: &ConnectionId) -> Result<()> {
        let _ = self.heartbeat.stop(id);
        let Some(info) = self.registry.remove(id) else {
            return Ok(());
        };
        if let Some(batching) = &self.batching {
            let _ = batching.discard_key(id.as_str());
        }

        if let Err(e) = info.transport().close().await {
            debug!(conn_id = %id, error = %e, "transport close failed during removal");
        }

        if let Some(reconnection) = &self.reconnection {
            if !self.registry.serves_identity(&info.identity) {
                match reconnection.on_disconnect(&info.identity) {
                    Ok(_) => self.drive(reconnection, &info.identity),
                    Err(e) => {
                        debug!(identity = %info.identity, error = %e, "reconnection not started");
                    }
                }
            }
        }
        Ok(())
    }
}

/// Result of one cleanup tick.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Connections past their deadline when the tick started.
    pub expired: usize,
    /// Connections actually removed.
    pub removed: usize,
    /// Stale heartbeat entries dropped.
    pub purged: usize,
    /// Error records pruned.
    pub pruned: usize,
    /// Settled reconnection records forgotten.
    pub forgotten: usize,
    /// Whether cancellation cut the tick short.
    pub cancelled: bool,
}

/// Point-in-time view of the cleanup loop and registry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupHealth {
    /// Ticks completed.
    pub cleanup_runs: u64,
    /// Connections evicted for timing out.
    pub timeouts: u64,
    /// End of the last completed tick.
    pub last_cleanup_at: Option<DateTime<Utc>>,
    /// Registered connections.
    pub active_connections: usize,
    /// Registered connections per owning user.
    pub per_user_connections: BTreeMap<UserId, usize>,
}

/// Periodic eviction loop.
pub struct CleanupMonitor {
    settings: CleanupSettings,
    registry: Arc<ConnectionRegistry>,
    heartbeat: Arc<HeartbeatMonitor>,
    classifier: Arc<ErrorClassifier>,
    removal: Arc<dyn RemovalCallback>,
    reconnection: Option<Arc<ReconnectionOrchestrator>>,
    metrics: Arc<MetricsCollector>,
    cleanup_runs: AtomicU64,
    timeouts: AtomicU64,
    last_cleanup_ms: AtomicI64,
}

impl CleanupMonitor {
    /// Create a monitor evicting through `removal`.
    pub fn new(
        settings: CleanupSettings,
        registry: Arc<ConnectionRegistry>,
        heartbeat: Arc<HeartbeatMonitor>,
        classifier: Arc<ErrorClassifier>,
        removal: Arc<dyn RemovalCallback>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            settings,
            registry,
            heartbeat,
            classifier,
            removal,
            reconnection: None,
            metrics,
            cleanup_runs: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            last_cleanup_ms: AtomicI64::new(i64::MIN),
        }
    }

    /// Also forget reconnection records that settled longer ago than the
    /// orchestrator's retention window.
    #[must_use]
    pub fn with_reconnection(mut self, reconnection: Arc<ReconnectionOrchestrator>) -> Self {
        self.reconnection = Some(reconnection);
        self
    }

    /// Run one tick.
    ///
    /// A failed removal does not stop the others; the first error is
    /// returned after housekeeping finishes. `cancel` is checked between
    /// connections, never during one.
    pub async fn tick(&self, cancel: &CancellationToken) -> Result<TickReport> {
        let started = Instant::now();
        let expired = self.registry.expired(started);
        let mut report = TickReport {
            expired: expired.len(),
            ..TickReport::default()
        };
        let mut first_error = None;

        for id in &expired {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            match self.removal.remove(id).await {
                Ok(()) => {
                    report.removed += 1;
                    let _ = self.timeouts.fetch_add(1, Ordering::Relaxed);
                    info!(conn_id = %id, "timed-out connection removed");
                }
                Err(e) => {
                    warn!(conn_id = %id, error = %e, "failed to remove timed-out connection");
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        report.purged = self.heartbeat.purge_stale();
        report.pruned = self
            .classifier
            .prune_older_than(self.settings.error_retention());
        if let Some(reconnection) = &self.reconnection {
            report.forgotten = reconnection.prune_settled(
                reconnection.config().retention(),
                |identity| self.registry.serves_identity(identity),
            );
        }

        let _ = self.cleanup_runs.fetch_add(1, Ordering::Relaxed);
        self.last_cleanup_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
        self.record_tick(&report, started);

        if report.removed > 0 || report.purged > 0 || report.pruned > 0 || report.forgotten > 0 {
            debug!(
                removed = report.removed,
                purged = report.purged,
                pruned = report.pruned,
                forgotten = report.forgotten,
                "cleanup tick finished"
            );
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn record_tick(&self, report: &TickReport, started: Instant) {
        self.metrics
            .record_counter(names::CLEANUP_RUNS_TOTAL, 1.0, Tags::new());
        if report.removed > 0 {
            self.metrics.record_counter(
                names::CLEANUP_EVICTIONS_TOTAL,
                report.removed as f64,
                Tags::new(),
            );
        }
        self.metrics.record_timer(
            names::CLEANUP_TICK_DURATION_MS,
            started.elapsed().as_millis() as f64,
            Tags::new(),
        );
    }

    /// Run the loop until `cancel` fires.
    #[instrument(skip_all, name = "cleanup_loop")]
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(interval_ms = self.settings.interval_ms, "cleanup loop started");
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                () = time::sleep(self.settings.interval()) => {}
            }
            if cancel.is_cancelled() {
                break;
            }

            let failure = match AssertUnwindSafe(self.tick(&cancel)).catch_unwind().await {
                Ok(Ok(_)) => None,
                Ok(Err(e)) => Some(format!("cleanup tick failed: {e}")),
                Err(panic) => Some(format!(
                    "cleanup tick panicked: {}",
                    panic_message(panic.as_ref())
                )),
            };

            if let Some(message) = failure {
                let _ = self.classifier.classify(ErrorReport::new(
                    ErrorClassification::CleanupTickError,
                    message,
                ));
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    () = time::sleep(self.settings.error_backoff()) => {}
                }
            }
        }
        info!("cleanup loop stopped");
    }

    /// Run the loop on its own task.
    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.clone().run(cancel))
    }

    /// Snapshot without waiting on the loop.
    pub fn health(&self) -> CleanupHealth {
        let last_ms = self.last_cleanup_ms.load(Ordering::Relaxed);
        let last_cleanup_at = if last_ms == i64::MIN {
            None
        } else {
            DateTime::from_timestamp_millis(last_ms)
        };
        CleanupHealth {
            cleanup_runs: self.cleanup_runs.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            last_cleanup_at,
            active_connections: self.registry.len(),
            per_user_connections: self.registry.per_user_counts().into_iter().collect(),
        }
    }

    /// Stop every heartbeat, close every transport best-effort, and empty
    /// the registry.
    pub async fn shutdown(&self) {
        self.heartbeat.shutdown().await;

        let connections = self.registry.drain();
        let closes = connections.iter().map(|info| async move {
            if let Err(e) = info.transport().close().await {
                debug!(conn_id = %info.connection_id, error = %e, "transport close failed during shutdown");
            }
        });
        let _ = futures::future::join_all(closes).await;
        info!(closed = connections.len(), "cleanup shutdown complete");
    }
}
