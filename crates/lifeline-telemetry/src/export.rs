//! Prometheus recorder and metric name constants.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use thiserror::Error;
use tracing::info;

/// Telemetry setup failures.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// A global recorder is already installed, or the exporter failed to build.
    #[error("failed to install metrics recorder: {0}")]
    RecorderInstall(String),
}

/// Install the Prometheus recorder as the global `metrics` recorder.
///
/// Returns the handle used to render the text exposition format.
pub fn install_prometheus_recorder() -> Result<PrometheusHandle, TelemetryError> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| TelemetryError::RecorderInstall(e.to_string()))?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Metric name constants shared by every engine component.
pub mod names {
    /// Currently registered connections (gauge).
    pub const CONNECTIONS_ACTIVE: &str = "lifeline_connections_active";
    /// Connections admitted (counter).
    pub const CONNECTIONS_REGISTERED_TOTAL: &str = "lifeline_connections_registered_total";
    /// Connections removed for any reason (counter).
    pub const CONNECTIONS_REMOVED_TOTAL: &str = "lifeline_connections_removed_total";
    /// Admissions refused at capacity (counter).
    pub const CONNECTIONS_REJECTED_TOTAL: &str = "lifeline_connections_rejected_total";
    /// Liveness probes sent (counter).
    pub const HEARTBEAT_PROBES_TOTAL: &str = "lifeline_heartbeat_probes_total";
    /// Probes that missed (counter).
    pub const HEARTBEAT_MISSES_TOTAL: &str = "lifeline_heartbeat_misses_total";
    /// Probe round-trip in milliseconds (timer).
    pub const HEARTBEAT_PROBE_LATENCY_MS: &str = "lifeline_heartbeat_probe_latency_ms";
    /// Connections declared dead by missed probes (counter).
    pub const HEARTBEAT_TIMEOUTS_TOTAL: &str = "lifeline_heartbeat_timeouts_total";
    /// Classified errors, labelled by classification (counter).
    pub const ERRORS_CLASSIFIED_TOTAL: &str = "lifeline_errors_classified_total";
    /// Completed cleanup ticks (counter).
    pub const CLEANUP_RUNS_TOTAL: &str = "lifeline_cleanup_runs_total";
    /// Connections evicted past their deadline (counter).
    pub const CLEANUP_EVICTIONS_TOTAL: &str = "lifeline_cleanup_evictions_total";
    /// Cleanup tick duration in milliseconds (timer).
    pub const CLEANUP_TICK_DURATION_MS: &str = "lifeline_cleanup_tick_duration_ms";
    /// Reconnection attempts, labelled by outcome (counter).
    pub const RECONNECT_ATTEMPTS_TOTAL: &str = "lifeline_reconnect_attempts_total";
    /// Backoff delay before an attempt in milliseconds (histogram).
    pub const RECONNECT_DELAY_MS: &str = "lifeline_reconnect_delay_ms";
    /// Identities latched in permanent failure (counter).
    pub const RECONNECT_PERMANENT_FAILURES_TOTAL: &str =
        "lifeline_reconnect_permanent_failures_total";
    /// Batches flushed, labelled by strategy (counter).
    pub const BATCH_FLUSHES_TOTAL: &str = "lifeline_batch_flushes_total";
    /// Messages per flushed batch (histogram).
    pub const BATCH_SIZE: &str = "lifeline_batch_size";
    /// Batches whose delivery failed (counter).
    pub const BATCH_DELIVERY_FAILURES_TOTAL: &str = "lifeline_batch_delivery_failures_total";
    /// Messages dropped because their connection went away (counter).
    pub const BATCH_DISCARDED_TOTAL: &str = "lifeline_batch_discarded_total";

    /// Every constant above, for exhaustive checks.
    pub const ALL: &[&str] = &[
        CONNECTIONS_ACTIVE,
        CONNECTIONS_REGISTERED_TOTAL,
        CONNECTIONS_REMOVED_TOTAL,
        CONNECTIONS_REJECTED_TOTAL,
        HEARTBEAT_PROBES_TOTAL,
        HEARTBEAT_MISSES_TOTAL,
        HEARTBEAT_PROBE_LATENCY_MS,
        HEARTBEAT_TIMEOUTS_TOTAL,
        ERRORS_CLASSIFIED_TOTAL,
        CLEANUP_RUNS_TOTAL,
        CLEANUP_EVICTIONS_TOTAL,
        CLEANUP_TICK_DURATION_MS,
        RECONNECT_ATTEMPTS_TOTAL,
        RECONNECT_DELAY_MS,
        RECONNECT_PERMANENT_FAILURES_TOTAL,
        BATCH_FLUSHES_TOTAL,
        BATCH_SIZE,
        BATCH_DELIVERY_FAILURES_TOTAL,
        BATCH_DISCARDED_TOTAL,
    ];
}
