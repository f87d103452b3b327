//! Composition root.
//!
//! [`ConnectionEngine`] builds every component from one [`EngineSettings`]
//! value plus the injected collaborators and wires them together. Nothing
//! is global: two engines in one process share no state.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use lifeline_core::{ConnectionId, EngineError, Result};
use lifeline_settings::{EngineSettings, SettingsError};
use lifeline_telemetry::MetricsCollector;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::batching::{BatchSink, BatchStats, BatchingEngine, RegistrySink};
use crate::classifier::{ErrorClassifier, ErrorReporter, TracingReporter};
use crate::cleanup::{CleanupHealth, CleanupMonitor, RegistryRemoval, RemovalCallback};
use crate::heartbeat::{HeartbeatMonitor, HeartbeatStats, ProbeOutcome};
use crate::reconnect::{ReconnectionOrchestrator, ReconnectionSummary, Reconnector};
use crate::registry::{ConnectionInfo, ConnectionRegistry};
use crate::shutdown::{ShutdownCoordinator, ShutdownReport};

/// Whole-engine health snapshot.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineHealth {
    /// Registry and cleanup loop.
    pub cleanup: CleanupHealth,
    /// Heartbeat counters.
    pub heartbeat: HeartbeatStats,
    /// Reconnection states.
    pub reconnection: ReconnectionSummary,
    /// Batching counters.
    pub batching: BatchStats,
    /// Classified errors per classification.
    pub errors: BTreeMap<String, u64>,
    /// Whether shutdown has begun.
    pub shutting_down: bool,
}

/// Builder for [`ConnectionEngine`].
#[derive(Default)]
pub struct ConnectionEngineBuilder {
    settings: EngineSettings,
    reporter: Option<Arc<dyn ErrorReporter>>,
    removal: Option<Arc<dyn RemovalCallback>>,
    sink: Option<Arc<dyn BatchSink<Bytes>>>,
    reconnector: Option<Arc<dyn Reconnector>>,
    metrics: Option<Arc<MetricsCollector>>,
}

impl ConnectionEngineBuilder {
    /// Use `settings` instead of the defaults.
    #[must_use]
    pub fn settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Where classified errors go. Defaults to [`TracingReporter`].
    #[must_use]
    pub fn reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// How the cleanup loop evicts. Defaults to [`RegistryRemoval`].
    #[must_use]
    pub fn removal(mut self, removal: Arc<dyn RemovalCallback>) -> Self {
        self.removal = Some(removal);
        self
    }

    /// Where batches go. Defaults to [`RegistrySink`].
    #[must_use]
    pub fn sink(mut self, sink: Arc<dyn BatchSink<Bytes>>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Re-establish evicted identities with `reconnector`. Without one,
    /// eviction only moves the identity to `Reconnecting` and attempts are
    /// left to the caller. Ignored when a custom removal is supplied.
    #[must_use]
    pub fn reconnector(mut self, reconnector: Arc<dyn Reconnector>) -> Self {
        self.reconnector = Some(reconnector);
        self
    }

    /// Share an existing metrics collector.
    #[must_use]
    pub fn metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Validate the settings and wire every component.
    pub fn build(self) -> std::result::Result<ConnectionEngine, SettingsError> {
        self.settings.validate()?;
        let settings = self.settings;

        let shutdown = Arc::new(ShutdownCoordinator::new());
        let metrics = self
            .metrics
            .unwrap_or_else(|| Arc::new(MetricsCollector::from_settings(&settings.metrics)));
        let registry = Arc::new(ConnectionRegistry::new(
            settings.registry.max_connections,
            metrics.clone(),
        ));
        let classifier = Arc::new(ErrorClassifier::new(
            self.reporter.unwrap_or_else(|| Arc::new(TracingReporter)),
            settings.cleanup.max_error_records,
            metrics.clone(),
        ));
        let heartbeat = Arc::new(HeartbeatMonitor::new(
            settings.heartbeat.clone(),
            registry.clone(),
            classifier.clone(),
            metrics.clone(),
            shutdown.token(),
        ));
        let reconnection = Arc::new(ReconnectionOrchestrator::new(
            settings.reconnection.clone(),
            classifier.clone(),
            metrics.clone(),
            shutdown.token(),
        ));
        let batching = Arc::new(BatchingEngine::new(
            settings.batching.clone(),
            metrics.clone(),
        ));
        let removal = self.removal.unwrap_or_else(|| {
            let removal = RegistryRemoval::new(
                registry.clone(),
                heartbeat.clone(),
                Some(reconnection.clone()),
            )
            .with_batching(batching.clone());
            let removal = match self.reconnector {
                Some(reconnector) => removal.with_reconnector(reconnector, shutdown.clone()),
                None => removal,
            };
            Arc::new(removal)
        });
        let cleanup = Arc::new(
            CleanupMonitor::new(
                settings.cleanup.clone(),
                registry.clone(),
                heartbeat.clone(),
                classifier.clone(),
                removal,
                metrics.clone(),
            )
            .with_reconnection(reconnection.clone()),
        );
        let sink = self
            .sink
            .unwrap_or_else(|| Arc::new(RegistrySink::new(registry.clone())));

        Ok(ConnectionEngine {
            settings,
            shutdown,
            metrics,
            registry,
            classifier,
            heartbeat,
            reconnection,
            cleanup,
            batching,
            sink,
            started: AtomicBool::new(false),
        })
    }
}

/// Owns the registry and every monitor built around it.
pub struct ConnectionEngine {
    settings: EngineSettings,
    shutdown: Arc<ShutdownCoordinator>,
    metrics: Arc<MetricsCollector>,
    registry: Arc<ConnectionRegistry>,
    classifier: Arc<ErrorClassifier>,
    heartbeat: Arc<HeartbeatMonitor>,
    reconnection: Arc<ReconnectionOrchestrator>,
    cleanup: Arc<CleanupMonitor>,
    batching: Arc<BatchingEngine<Bytes>>,
    sink: Arc<dyn BatchSink<Bytes>>,
    started: AtomicBool,
}

impl ConnectionEngine {
    /// Start building an engine.
    pub fn builder() -> ConnectionEngineBuilder {
        ConnectionEngineBuilder::default()
    }

    /// Spawn the cleanup loop and the batch flusher. Idempotent.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.track(
            "cleanup",
            self.cleanup.spawn(self.shutdown.child_token()),
        );
        self.shutdown.track(
            "batch-flusher",
            self.batching
                .spawn_flusher(self.sink.clone(), self.shutdown.child_token()),
        );
        info!(
            max_connections = self.settings.registry.max_connections,
            heartbeat_interval_ms = self.settings.heartbeat.interval_ms,
            cleanup_interval_ms = self.settings.cleanup.interval_ms,
            "connection engine started"
        );
    }

    /// Admit a connection: register it with a fresh deadline, start its
    /// heartbeat and mark its identity connected.
    pub fn admit(&self, info: ConnectionInfo) -> Result<ConnectionId> {
        if self.shutdown.is_shutting_down() {
            return Err(EngineError::Cancelled);
        }
        let identity = info.identity.clone();
        let user_id = info.user_id.clone();
        let deadline = Instant::now() + self.settings.heartbeat.connection_timeout();
        let id = self.registry.register_with_timeout(info, deadline)?;
        if let Err(e) = self.heartbeat.start(&id) {
            let _ = self.registry.remove(&id);
            return Err(e);
        }
        self.reconnection.on_connected(&identity);
        info!(conn_id = %id, user_id = %user_id, identity = %identity, "connection admitted");
        Ok(id)
    }

    /// Close a connection on request. Pending messages are delivered first;
    /// anything queued by a racing send after that is discarded. Does not
    /// start reconnection.
    pub async fn disconnect(&self, id: &ConnectionId) -> Result<()> {
        if let Some(batch) = self.batching.remove_key(id.as_str()) {
            self.batching.deliver(self.sink.as_ref(), batch).await;
        }
        let _ = self.heartbeat.stop(id);
        let info = self
            .registry
            .remove(id)
            .ok_or_else(|| EngineError::NotFound(id.clone()))?;
        let _ = self.batching.discard_key(id.as_str());
        if let Err(e) = info.transport().close().await {
            debug!(conn_id = %id, error = %e, "transport close failed during disconnect");
        }
        info!(conn_id = %id, "connection closed");
        Ok(())
    }

    /// Queue `payload` for `id`, delivering the batch if this fills it.
    ///
    /// A connection removed while the message was being queued takes the
    /// message with it and the call returns `NotFound`.
    pub async fn send(&self, id: &ConnectionId, payload: Bytes, priority: i32) -> Result<()> {
        if !self.registry.touch(id) {
            return Err(EngineError::NotFound(id.clone()));
        }
        let batch = self.batching.enqueue(id.as_str(), payload, priority);
        if !self.registry.contains(id) {
            if let Some(batch) = batch {
                self.batching.discard(batch);
            }
            let _ = self.batching.discard_key(id.as_str());
            return Err(EngineError::NotFound(id.clone()));
        }
        match batch {
            Some(batch) => self.sink.deliver(batch).await,
            None => Ok(()),
        }
    }

    /// Deliver whatever is pending for `id` now.
    pub async fn flush(&self, id: &ConnectionId) -> Result<()> {
        match self.batching.flush_key(id.as_str()) {
            Some(batch) => self.sink.deliver(batch).await,
            None => Ok(()),
        }
    }

    /// Record a pong seen by the transport reader.
    pub fn record_pong(&self, id: &ConnectionId) -> Result<ProbeOutcome> {
        self.heartbeat.record_success(id)
    }

    /// Update the load reading used by adaptive batching.
    pub fn set_load(&self, load: f64) {
        self.batching.set_load(load);
    }

    /// Stop background work, drain pending batches, close every transport
    /// and empty the registry.
    pub async fn shutdown(&self, timeout: Option<Duration>) -> ShutdownReport {
        info!("connection engine shutting down");
        let report = self.shutdown.graceful_shutdown(timeout).await;
        self.cleanup.shutdown().await;
        info!(
            completed = report.completed,
            aborted = report.aborted.len(),
            "connection engine stopped"
        );
        report
    }

    /// Snapshot of every component.
    pub fn health(&self) -> EngineHealth {
        EngineHealth {
            cleanup: self.cleanup.health(),
            heartbeat: self.heartbeat.stats(),
            reconnection: self.reconnection.summary(),
            batching: self.batching.stats(),
            errors: self.classifier.counts(),
            shutting_down: self.shutdown.is_shutting_down(),
        }
    }

    // ── Accessors ───────────────────────────────────────────────────

    /// Settings in effect.
    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Connection registry.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Error classifier.
    pub fn classifier(&self) -> &Arc<ErrorClassifier> {
        &self.classifier
    }

    /// Heartbeat monitor.
    pub fn heartbeat(&self) -> &Arc<HeartbeatMonitor> {
        &self.heartbeat
    }

    /// Reconnection orchestrator.
    pub fn reconnection(&self) -> &Arc<ReconnectionOrchestrator> {
        &self.reconnection
    }

    /// Cleanup monitor.
    pub fn cleanup(&self) -> &Arc<CleanupMonitor> {
        &self.cleanup
    }

    /// Batching engine.
    pub fn batching(&self) -> &Arc<BatchingEngine<Bytes>> {
        &self.batching
    }

    /// Metrics collector.
    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }
}
