//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase", default)]` so a settings
//! file may be partial: missing fields get their compiled default. Durations
//! are stored as integer milliseconds (or seconds where noted) and exposed
//! as [`Duration`] through accessor methods.

use std::time::Duration;

use lifeline_core::BackoffPolicy;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings for the connection engine.
///
/// ```json
/// {
///   "heartbeat": { "intervalMs": 15000, "missThreshold": 5 },
///   "batching": { "strategy": "priority" }
/// }
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineSettings {
    /// Connection registry limits.
    pub registry: RegistrySettings,
    /// Liveness probing.
    pub heartbeat: HeartbeatSettings,
    /// Background eviction loop.
    pub cleanup: CleanupSettings,
    /// Reconnection state machine and backoff.
    pub reconnection: ReconnectionConfig,
    /// Outbound batching policy.
    pub batching: BatchConfig,
    /// In-memory metrics store.
    pub metrics: MetricsSettings,
    /// Log output.
    pub logging: LoggingSettings,
}

impl EngineSettings {
    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        self.registry.validate()?;
        self.heartbeat.validate()?;
        self.cleanup.validate()?;
        self.reconnection.validate()?;
        self.batching.validate()?;
        self.metrics.validate()
    }
}

fn invalid(msg: impl Into<String>) -> SettingsError {
    SettingsError::InvalidValue(msg.into())
}

// ─────────────────────────────────────────────────────────────────────────────
// Registry
// ─────────────────────────────────────────────────────────────────────────────

/// Connection registry settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RegistrySettings {
    /// Maximum number of simultaneously registered connections.
    pub max_connections: usize,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            max_connections: 10_000,
        }
    }
}

impl RegistrySettings {
    fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(invalid("registry.maxConnections must be >= 1"));
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Heartbeat
// ─────────────────────────────────────────────────────────────────────────────

/// Liveness probe settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HeartbeatSettings {
    /// Time between probes of one connection.
    pub interval_ms: u64,
    /// How long a single probe may wait for its response.
    pub probe_timeout_ms: u64,
    /// Consecutive misses that declare the connection dead.
    pub miss_threshold: u32,
    /// Deadline pushed forward on every successful probe.
    pub connection_timeout_ms: u64,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            interval_ms: 30_000,
            probe_timeout_ms: 10_000,
            miss_threshold: 3,
            connection_timeout_ms: 90_000,
        }
    }
}

impl HeartbeatSettings {
    /// Probe interval.
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Per-probe response deadline.
    #[must_use]
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    /// Connection deadline extension.
    #[must_use]
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.interval_ms == 0 {
            return Err(invalid("heartbeat.intervalMs must be > 0"));
        }
        if self.probe_timeout_ms == 0 {
            return Err(invalid("heartbeat.probeTimeoutMs must be > 0"));
        }
        if self.miss_threshold == 0 {
            return Err(invalid("heartbeat.missThreshold must be >= 1"));
        }
        if self.connection_timeout_ms == 0 {
            return Err(invalid("heartbeat.connectionTimeoutMs must be > 0"));
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Cleanup
// ─────────────────────────────────────────────────────────────────────────────

/// Cleanup loop settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CleanupSettings {
    /// Time between cleanup ticks.
    pub interval_ms: u64,
    /// Sleep after a failed tick before the next one.
    pub error_backoff_ms: u64,
    /// Classified errors older than this many seconds are pruned.
    pub error_retention_secs: u64,
    /// Upper bound on retained error records.
    pub max_error_records: usize,
}

impl Default for CleanupSettings {
    fn default() -> Self {
        Self {
            interval_ms: 60_000,
            error_backoff_ms: 5_000,
            error_retention_secs: 3_600,
            max_error_records: 1_000,
        }
    }
}

impl CleanupSettings {
    /// Tick interval.
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Backoff after a failed tick.
    #[must_use]
    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }

    /// Error record retention window.
    #[must_use]
    pub fn error_retention(&self) -> Duration {
        Duration::from_secs(self.error_retention_secs)
    }

    fn validate(&self) -> Result<()> {
        if self.interval_ms == 0 {
            return Err(invalid("cleanup.intervalMs must be > 0"));
        }
        if self.max_error_records == 0 {
            return Err(invalid("cleanup.maxErrorRecords must be >= 1"));
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Reconnection
// ─────────────────────────────────────────────────────────────────────────────

/// Reconnection state machine settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReconnectionConfig {
    /// When false, disconnects never enter the reconnecting state.
    pub enabled: bool,
    /// Failed attempts before the identity is latched in permanent failure.
    pub max_attempts: u32,
    /// Delay before the first attempt.
    pub base_delay_ms: u64,
    /// Growth factor per attempt.
    pub multiplier: f64,
    /// Cap on the un-jittered delay.
    pub max_delay_ms: u64,
    /// Apply deterministic jitter to each delay.
    pub jitter: bool,
    /// Jitter range as a fraction of the delay.
    pub jitter_factor: f64,
    /// Fixed jitter seed. When absent a random seed is drawn per orchestrator.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jitter_seed: Option<u64>,
    /// How long an identity may sit idle or connected, with no live
    /// connection, before its record is forgotten.
    pub retention_secs: u64,
}

impl Default for ReconnectionConfig {
    fn default() -> Self {
        let backoff = BackoffPolicy::default();
        Self {
            enabled: true,
            max_attempts: 5,
            base_delay_ms: backoff.base_delay_ms,
            multiplier: backoff.multiplier,
            max_delay_ms: backoff.max_delay_ms,
            jitter: backoff.jitter,
            jitter_factor: backoff.jitter_factor,
            jitter_seed: None,
            retention_secs: 86_400,
        }
    }
}

impl ReconnectionConfig {
    /// Backoff curve described by these settings.
    #[must_use]
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            base_delay_ms: self.base_delay_ms,
            multiplier: self.multiplier,
            max_delay_ms: self.max_delay_ms,
            jitter: self.jitter,
            jitter_factor: self.jitter_factor,
        }
    }

    /// Retention window for settled identity records.
    #[must_use]
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(invalid("reconnection.maxAttempts must be >= 1"));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(invalid("reconnection.multiplier must be >= 1.0"));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(invalid("reconnection.maxDelayMs must be >= baseDelayMs"));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(invalid("reconnection.jitterFactor must be within 0.0..=1.0"));
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Batching
// ─────────────────────────────────────────────────────────────────────────────

/// Policy deciding when a pending batch is flushed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStrategy {
    /// Flush once the batch is full.
    SizeBased,
    /// Flush once the oldest message has waited long enough.
    TimeBased,
    /// Flush early when urgent messages are present.
    Priority,
    /// Size threshold scales with system load; time bound still applies.
    #[default]
    Adaptive,
}

/// Outbound batching configuration.
///
/// Treated as immutable by the batching engine; change policy by swapping
/// the whole value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BatchConfig {
    /// Flush policy.
    pub strategy: BatchStrategy,
    /// Hard size bound; reaching it always flushes for size and priority.
    pub max_batch_size: usize,
    /// Oldest-message age (seconds) that triggers a time flush.
    pub max_wait_time: f64,
    /// Messages at or above this priority count as urgent.
    pub priority_threshold: i32,
    /// Smallest batch worth sending (priority and low-load adaptive).
    pub adaptive_min_batch: usize,
    /// Batch size used under high load.
    pub adaptive_max_batch: usize,
    /// How often the background flusher sweeps for time-due batches.
    pub flush_interval_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            strategy: BatchStrategy::Adaptive,
            max_batch_size: 50,
            max_wait_time: 0.1,
            priority_threshold: 8,
            adaptive_min_batch: 5,
            adaptive_max_batch: 100,
            flush_interval_ms: 50,
        }
    }
}

impl BatchConfig {
    /// `max_wait_time` as a [`Duration`]; non-finite or negative values clamp to zero.
    #[must_use]
    pub fn max_wait(&self) -> Duration {
        Duration::try_from_secs_f64(self.max_wait_time).unwrap_or(Duration::ZERO)
    }

    /// Background sweep interval.
    #[must_use]
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.max_batch_size == 0 {
            return Err(invalid("batching.maxBatchSize must be >= 1"));
        }
        if !self.max_wait_time.is_finite() || self.max_wait_time < 0.0 {
            return Err(invalid("batching.maxWaitTime must be a non-negative number"));
        }
        if self.adaptive_min_batch == 0 {
            return Err(invalid("batching.adaptiveMinBatch must be >= 1"));
        }
        if self.adaptive_min_batch > self.adaptive_max_batch {
            return Err(invalid(
                "batching.adaptiveMinBatch must be <= adaptiveMaxBatch",
            ));
        }
        if self.flush_interval_ms == 0 {
            return Err(invalid("batching.flushIntervalMs must be > 0"));
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Metrics / logging
// ─────────────────────────────────────────────────────────────────────────────

/// In-memory metrics store settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MetricsSettings {
    /// Ring-buffer capacity per metric name.
    pub max_points: usize,
    /// Mirror every sample to the global `metrics` recorder.
    pub export_to_recorder: bool,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            max_points: 10_000,
            export_to_recorder: false,
        }
    }
}

impl MetricsSettings {
    fn validate(&self) -> Result<()> {
        if self.max_points == 0 {
            return Err(invalid("metrics.maxPoints must be >= 1"));
        }
        Ok(())
    }
}

/// Log output format.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable single line.
    #[default]
    Compact,
    /// One JSON object per line.
    Json,
}

/// Logging settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default level when `RUST_LOG` is unset.
    pub level: String,
    /// Output format.
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
