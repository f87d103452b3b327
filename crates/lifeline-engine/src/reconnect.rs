//! Reconnection orchestration.
//!
//! Tracks a state machine per logical identity:
//!
//! ```text
//! Idle ──disconnect──▶ Reconnecting ──success──▶ Connected
//!                          │  ▲                      │
//!                          └──┘ failure < max        └──disconnect──▶ Reconnecting
//!                          │
//!                          └── failure >= max or not retryable ──▶ PermanentFailure
//! ```
//!
//! `PermanentFailure` is latched until [`ReconnectionOrchestrator::reset`].
//! Each episode carries a number; an attempt that finishes after its episode
//! was reset, forgotten or ended by a fresh connection is dropped.
//! Backoff delays are a pure function of the attempt counter and the
//! configuration; jitter, when enabled, is derived from a seed so the same
//! identity and attempt always produce the same delay.

use std::collections::VecDeque;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use lifeline_core::{
    BackoffPolicy, EngineError, ErrorClassification, IdentityKey, Result, TransportError,
};
use lifeline_settings::ReconnectionConfig;
use lifeline_telemetry::{MetricsCollector, Tags, names};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::classifier::ErrorClassifier;

/// Attempts kept in the short per-identity ring.
const RECENT_ATTEMPTS: usize = 10;

/// Reconnection phase of one identity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconnectionState {
    /// Never disconnected, or reset.
    #[default]
    Idle,
    /// Waiting for or running an attempt.
    Reconnecting,
    /// Last attempt succeeded.
    Connected,
    /// Gave up. Latched until reset.
    PermanentFailure,
}

/// One finished reconnection attempt.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectionAttempt {
    /// 1-based position within the current episode.
    pub attempt_number: u32,
    /// When the attempt finished.
    pub timestamp: DateTime<Utc>,
    /// Backoff waited before the attempt.
    pub delay_ms: u64,
    /// Whether the transport came back.
    pub success: bool,
    /// Time spent in the attempt itself.
    pub duration_ms: u64,
    /// Failure text, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl ReconnectionAttempt {
    /// One-line rendering for status output.
    pub fn format(&self) -> String {
        let at = self.timestamp.format("%H:%M:%S%.3f");
        match &self.error_message {
            Some(err) if !self.success => format!(
                "#{} {at} failed after {}ms backoff ({}ms): {err}",
                self.attempt_number, self.delay_ms, self.duration_ms
            ),
            _ => format!(
                "#{} {at} {} after {}ms backoff ({}ms)",
                self.attempt_number,
                if self.success { "succeeded" } else { "failed" },
                self.delay_ms,
                self.duration_ms
            ),
        }
    }
}

/// Status snapshot of one identity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectionStatus {
    /// Identity described.
    pub identity: IdentityKey,
    /// Current phase.
    pub state: ReconnectionState,
    /// Failed attempts in the current episode.
    pub current_attempt: u32,
    /// Configured attempt limit.
    pub max_attempts: u32,
    /// Attempts ever recorded.
    pub total_attempts: usize,
    /// Successful attempts ever recorded.
    pub successful_reconnects: u64,
    /// Failed attempts ever recorded.
    pub failed_attempts: u64,
    /// When the last attempt finished.
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// When the identity was last seen connected.
    pub last_successful_connect_at: Option<DateTime<Utc>>,
    /// Delay before the next attempt while reconnecting.
    pub next_delay_ms: Option<u64>,
}

/// Status plus the formatted recent attempts.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectionMetrics {
    /// Status snapshot.
    pub status: ReconnectionStatus,
    /// Up to the last ten attempts, oldest first.
    pub recent_attempts: Vec<String>,
}

/// Counts across every tracked identity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectionSummary {
    /// Identities tracked.
    pub identities: usize,
    /// In `Idle`.
    pub idle: usize,
    /// In `Reconnecting`.
    pub reconnecting: usize,
    /// In `Connected`.
    pub connected: usize,
    /// In `PermanentFailure`.
    pub permanent_failure: usize,
    /// Attempts recorded across all identities.
    pub total_attempts: usize,
}

/// Re-establishes the transport for an identity.
#[async_trait]
pub trait Reconnector: Send + Sync {
    /// Try once. Errors that are not retryable end the episode.
    async fn reconnect(&self, identity: &IdentityKey) -> std::result::Result<(), TransportError>;
}

#[derive(Default)]
struct Record {
    state: ReconnectionState,
    current_attempt: u32,
    history: Vec<ReconnectionAttempt>,
    recent: VecDeque<ReconnectionAttempt>,
    successes: u64,
    failures: u64,
    last_attempt_at: Option<DateTime<Utc>>,
    last_successful_connect_at: Option<DateTime<Utc>>,
    pending: Option<CancellationToken>,
    /// Current episode; 0 outside `Reconnecting`.
    episode: u64,
    /// Episode a driver task has claimed.
    driven: u64,
    touched: Option<Instant>,
}

impl Record {
    fn push(&mut self, attempt: ReconnectionAttempt) {
        self.last_attempt_at = Some(attempt.timestamp);
        if self.recent.len() == RECENT_ATTEMPTS {
            let _ = self.recent.pop_front();
        }
        self.recent.push_back(attempt.clone());
        self.history.push(attempt);
    }

    fn cancel_pending(&mut self) {
        if let Some(token) = self.pending.take() {
            token.cancel();
        }
    }

    fn touch(&mut self) {
        self.touched = Some(Instant::now());
    }

    fn settled_for(&self, retention: Duration, now: Instant) -> bool {
        matches!(
            self.state,
            ReconnectionState::Idle | ReconnectionState::Connected
        ) && self.pending.is_none()
            && self
                .touched
                .is_none_or(|at| now.saturating_duration_since(at) >= retention)
    }
}

enum Outcome<'a> {
    Success,
    Failure(&'a TransportError),
}

/// Per-identity reconnection state machines.
pub struct ReconnectionOrchestrator {
    config: ReconnectionConfig,
    policy: BackoffPolicy,
    seed: u64,
    records: DashMap<IdentityKey, Record>,
    next_episode: AtomicU64,
    classifier: Arc<ErrorClassifier>,
    metrics: Arc<MetricsCollector>,
    root: CancellationToken,
}

impl ReconnectionOrchestrator {
    /// Create an orchestrator whose backoff waits are children of `root`.
    pub fn new(
        config: ReconnectionConfig,
        classifier: Arc<ErrorClassifier>,
        metrics: Arc<MetricsCollector>,
        root: CancellationToken,
    ) -> Self {
        let seed = config.jitter_seed.unwrap_or_else(rand::random::<u64>);
        Self {
            policy: config.backoff(),
            config,
            seed,
            records: DashMap::new(),
            next_episode: AtomicU64::new(1),
            classifier,
            metrics,
            root,
        }
    }

    /// Configuration in effect.
    pub fn config(&self) -> &ReconnectionConfig {
        &self.config
    }

    // ── Transitions ─────────────────────────────────────────────────

    /// Note that `identity` lost its transport.
    pub fn on_disconnect(&self, identity: &IdentityKey) -> Result<ReconnectionState> {
        if !self.config.enabled {
            return Err(EngineError::ReconnectionDisabled);
        }
        let mut record = self.records.entry(identity.clone()).or_default();
        match record.state {
            ReconnectionState::PermanentFailure => {
                Err(EngineError::PermanentFailure(identity.clone()))
            }
            ReconnectionState::Reconnecting => Ok(ReconnectionState::Reconnecting),
            ReconnectionState::Idle | ReconnectionState::Connected => {
                record.state = ReconnectionState::Reconnecting;
                record.current_attempt = 0;
                record.episode = self.next_episode.fetch_add(1, Ordering::Relaxed);
                record.touch();
                debug!(identity = %identity, episode = record.episode, "reconnection episode started");
                Ok(ReconnectionState::Reconnecting)
            }
        }
    }

    /// Note that `identity` is connected, whether through an attempt or a
    /// fresh admission.
    pub fn on_connected(&self, identity: &IdentityKey) {
        let mut record = self.records.entry(identity.clone()).or_default();
        record.cancel_pending();
        record.state = ReconnectionState::Connected;
        record.current_attempt = 0;
        record.episode = 0;
        record.last_successful_connect_at = Some(Utc::now());
        record.touch();
    }

    /// Return `identity` to `Idle`, cancelling any pending backoff wait.
    /// History is kept.
    pub fn reset(&self, identity: &IdentityKey) {
        if let Some(mut record) = self.records.get_mut(identity) {
            record.cancel_pending();
            record.state = ReconnectionState::Idle;
            record.current_attempt = 0;
            record.episode = 0;
            record.touch();
            info!(identity = %identity, "reconnection state reset");
        }
    }

    /// Forget `identity` entirely.
    pub fn forget(&self, identity: &IdentityKey) -> bool {
        match self.records.remove(identity) {
            Some((_, mut record)) => {
                record.cancel_pending();
                true
            }
            None => false,
        }
    }

    /// Record a successful attempt that followed `delay_ms` of backoff.
    ///
    /// Only an identity in `Reconnecting` accepts an outcome; anything else
    /// returns [`EngineError::Cancelled`].
    pub fn record_success(
        &self,
        identity: &IdentityKey,
        delay_ms: u64,
        duration_ms: u64,
    ) -> Result<ReconnectionState> {
        self.settle(identity, None, delay_ms, duration_ms, Outcome::Success)
    }

    /// Record a failed attempt that followed `delay_ms` of backoff.
    ///
    /// Reaching `max_attempts`, or an error that is not retryable, latches
    /// the identity in `PermanentFailure` and reports it.
    pub fn record_failure(
        &self,
        identity: &IdentityKey,
        delay_ms: u64,
        duration_ms: u64,
        error: &TransportError,
    ) -> Result<ReconnectionState> {
        self.settle(identity, None, delay_ms, duration_ms, Outcome::Failure(error))
    }

    /// Apply one attempt outcome. With `episode` set, the outcome is dropped
    /// unless that episode is still the current one.
    fn settle(
        &self,
        identity: &IdentityKey,
        episode: Option<u64>,
        delay_ms: u64,
        duration_ms: u64,
        outcome: Outcome<'_>,
    ) -> Result<ReconnectionState> {
        let Some(mut record) = self.records.get_mut(identity) else {
            return Err(EngineError::Cancelled);
        };
        match record.state {
            ReconnectionState::PermanentFailure => {
                return Err(EngineError::PermanentFailure(identity.clone()));
            }
            ReconnectionState::Idle | ReconnectionState::Connected => {
                return Err(EngineError::Cancelled);
            }
            ReconnectionState::Reconnecting => {}
        }
        if episode.is_some_and(|e| e != record.episode) {
            debug!(identity = %identity, "dropping outcome of a superseded attempt");
            return Err(EngineError::Cancelled);
        }
        record.pending = None;
        record.touch();

        let error = match outcome {
            Outcome::Success => {
                let now = Utc::now();
                let attempt = ReconnectionAttempt {
                    attempt_number: record.current_attempt + 1,
                    timestamp: now,
                    delay_ms,
                    success: true,
                    duration_ms,
                    error_message: None,
                };
                record.push(attempt);
                record.successes += 1;
                record.state = ReconnectionState::Connected;
                record.current_attempt = 0;
                record.episode = 0;
                record.last_successful_connect_at = Some(now);
                drop(record);

                self.record_attempt_metrics(delay_ms, "success");
                info!(identity = %identity, "reconnected");
                return Ok(ReconnectionState::Connected);
            }
            Outcome::Failure(error) => error,
        };

        record.current_attempt = record.current_attempt.saturating_add(1);
        let attempt_number = record.current_attempt;
        record.push(ReconnectionAttempt {
            attempt_number,
            timestamp: Utc::now(),
            delay_ms,
            success: false,
            duration_ms,
            error_message: Some(error.to_string()),
        });
        record.failures += 1;

        let exhausted = attempt_number >= self.config.max_attempts;
        let state = if exhausted || !error.is_retryable() {
            ReconnectionState::PermanentFailure
        } else {
            ReconnectionState::Reconnecting
        };
        record.state = state;
        drop(record);

        self.record_attempt_metrics(delay_ms, "failure");
        if state == ReconnectionState::PermanentFailure {
            self.metrics
                .record_counter(names::RECONNECT_PERMANENT_FAILURES_TOTAL, 1.0, Tags::new());
            let reason = if exhausted {
                format!("reconnection gave up after {attempt_number} attempts: {error}")
            } else {
                format!("reconnection failed permanently: {error}")
            };
            let _ = self.classifier.classify_identity(
                identity,
                ErrorClassification::ReconnectionPermanentFailure,
                reason,
            );
        } else {
            warn!(identity = %identity, attempt_number, error = %error, "reconnection attempt failed");
        }
        Ok(state)
    }

    /// Forget identities that have sat in `Idle` or `Connected` for longer
    /// than `retention`, skipping any for which `keep` returns true.
    /// Returns how many were dropped.
    pub fn prune_settled(
        &self,
        retention: Duration,
        keep: impl Fn(&IdentityKey) -> bool,
    ) -> usize {
        let now = Instant::now();
        let before = self.records.len();
        self.records
            .retain(|identity, record| !record.settled_for(retention, now) || keep(identity));
        let pruned = before.saturating_sub(self.records.len());
        if pruned > 0 {
            debug!(pruned, "forgot settled reconnection records");
        }
        pruned
    }

    #[allow(clippy::cast_precision_loss)]
    fn record_attempt_metrics(&self, delay_ms: u64, outcome: &str) {
        let mut tags = Tags::new();
        let _ = tags.insert("outcome".to_string(), outcome.to_string());
        self.metrics
            .record_counter(names::RECONNECT_ATTEMPTS_TOTAL, 1.0, tags);
        self.metrics
            .record_histogram(names::RECONNECT_DELAY_MS, delay_ms as f64, Tags::new());
    }

    // ── Backoff ─────────────────────────────────────────────────────

    /// Delay before the next attempt of `identity`.
    pub fn next_attempt_delay_ms(&self, identity: &IdentityKey) -> u64 {
        let attempt = self
            .records
            .get(identity)
            .map_or(0, |r| r.current_attempt);
        self.delay_for_attempt(identity, attempt)
    }

    /// Delay before the attempt following `attempt` failures.
    pub fn delay_for_attempt(&self, identity: &IdentityKey, attempt: u32) -> u64 {
        self.policy.delay_ms(attempt, self.seed_for(identity))
    }

    fn seed_for(&self, identity: &IdentityKey) -> u64 {
        let mut hasher = DefaultHasher::new();
        identity.hash(&mut hasher);
        self.seed ^ hasher.finish()
    }

    // ── Queries ─────────────────────────────────────────────────────

    /// Current phase of `identity`; `Idle` when untracked.
    pub fn state(&self, identity: &IdentityKey) -> ReconnectionState {
        self.records
            .get(identity)
            .map_or(ReconnectionState::Idle, |r| r.state)
    }

    /// Status snapshot of `identity`.
    pub fn status(&self, identity: &IdentityKey) -> ReconnectionStatus {
        let snapshot = self.records.get(identity).map(|r| {
            (
                r.state,
                r.current_attempt,
                r.history.len(),
                r.successes,
                r.failures,
                r.last_attempt_at,
                r.last_successful_connect_at,
            )
        });
        let (state, current_attempt, total, successes, failures, last_attempt, last_connect) =
            snapshot.unwrap_or_default();
        let next_delay_ms = (state == ReconnectionState::Reconnecting)
            .then(|| self.delay_for_attempt(identity, current_attempt));
        ReconnectionStatus {
            identity: identity.clone(),
            state,
            current_attempt,
            max_attempts: self.config.max_attempts,
            total_attempts: total,
            successful_reconnects: successes,
            failed_attempts: failures,
            last_attempt_at: last_attempt,
            last_successful_connect_at: last_connect,
            next_delay_ms,
        }
    }

    /// Status plus formatted recent attempts. Read-only.
    pub fn get_metrics(&self, identity: &IdentityKey) -> ReconnectionMetrics {
        let recent_attempts = self
            .records
            .get(identity)
            .map(|r| r.recent.iter().map(ReconnectionAttempt::format).collect())
            .unwrap_or_default();
        ReconnectionMetrics {
            status: self.status(identity),
            recent_attempts,
        }
    }

    /// Every attempt ever recorded for `identity`, oldest first.
    pub fn history(&self, identity: &IdentityKey) -> Vec<ReconnectionAttempt> {
        self.records
            .get(identity)
            .map(|r| r.history.clone())
            .unwrap_or_default()
    }

    /// Counts across every tracked identity.
    pub fn summary(&self) -> ReconnectionSummary {
        let mut summary = ReconnectionSummary::default();
        for record in &self.records {
            summary.identities += 1;
            summary.total_attempts += record.history.len();
            match record.state {
                ReconnectionState::Idle => summary.idle += 1,
                ReconnectionState::Reconnecting => summary.reconnecting += 1,
                ReconnectionState::Connected => summary.connected += 1,
                ReconnectionState::PermanentFailure => summary.permanent_failure += 1,
            }
        }
        summary
    }

    // ── Driving attempts ────────────────────────────────────────────

    /// Run attempts for `identity` until it connects, latches, or the episode
    /// is cancelled by [`Self::reset`], [`Self::forget`] or shutdown.
    ///
    /// Returns `Ok(Reconnecting)` at once when another task already drives
    /// the current episode.
    #[instrument(skip_all, fields(identity = %identity))]
    pub async fn run_reconnect(
        &self,
        identity: &IdentityKey,
        reconnector: &dyn Reconnector,
    ) -> Result<ReconnectionState> {
        let _ = self.on_disconnect(identity)?;
        let episode = {
            let Some(mut record) = self.records.get_mut(identity) else {
                return Err(EngineError::Cancelled);
            };
            if record.driven == record.episode {
                debug!("episode already has a driver");
                return Ok(ReconnectionState::Reconnecting);
            }
            record.driven = record.episode;
            record.episode
        };

        loop {
            let (token, delay_ms) = {
                let Some(mut record) = self.records.get_mut(identity) else {
                    return Err(EngineError::Cancelled);
                };
                if record.episode != episode && record.state != ReconnectionState::Connected {
                    return Err(EngineError::Cancelled);
                }
                match record.state {
                    ReconnectionState::Reconnecting => {}
                    ReconnectionState::Connected => return Ok(ReconnectionState::Connected),
                    ReconnectionState::PermanentFailure => {
                        return Err(EngineError::PermanentFailure(identity.clone()));
                    }
                    ReconnectionState::Idle => return Err(EngineError::Cancelled),
                }
                record.cancel_pending();
                let token = self.root.child_token();
                record.pending = Some(token.clone());
                let attempt = record.current_attempt;
                (token, self.delay_for_attempt(identity, attempt))
            };

            debug!(delay_ms, "waiting before reconnection attempt");
            tokio::select! {
                () = token.cancelled() => return Err(EngineError::Cancelled),
                () = time::sleep(Duration::from_millis(delay_ms)) => {}
            }
            if token.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            let started = Instant::now();
            let result = reconnector.reconnect(identity).await;
            let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

            let outcome = match &result {
                Ok(()) => Outcome::Success,
                Err(e) => Outcome::Failure(e),
            };
            match self.settle(identity, Some(episode), delay_ms, duration_ms, outcome)? {
                ReconnectionState::Connected => return Ok(ReconnectionState::Connected),
                ReconnectionState::PermanentFailure => {
                    return Err(EngineError::PermanentFailure(identity.clone()));
                }
                ReconnectionState::Reconnecting | ReconnectionState::Idle => {}
            }
        }
    }

    /// Run [`Self::run_reconnect`] on its own task.
    pub fn spawn_reconnect(
        self: &Arc<Self>,
        identity: IdentityKey,
        reconnector: Arc<dyn Reconnector>,
    ) -> JoinHandle<Result<ReconnectionState>> {
        let this = self.clone();
        tokio::spawn(async move { this.run_reconnect(&identity, reconnector.as_ref()).await })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::classifier::TracingReporter;
    use assert_matches::assert_matches;
    use proptest::prelude::*;

    fn orchestrator(config: ReconnectionConfig) -> (Arc<ReconnectionOrchestrator>, Arc<ErrorClassifier>) {
        let metrics = Arc::new(MetricsCollector::default());
        let classifier = Arc::new(ErrorClassifier::new(
            Arc::new(TracingReporter),
            100,
            metrics.clone(),
        ));
        let orch = Arc::new(ReconnectionOrchestrator::new(
            config,
            classifier.clone(),
            metrics,
            CancellationToken::new(),
        ));
        (orch, classifier)
    }

    fn config() -> ReconnectionConfig {
        ReconnectionConfig {
            jitter_seed: Some(7),
            ..ReconnectionConfig::default()
        }
    }

    fn reset_err() -> TransportError {
        TransportError::Send("connection reset".into())
    }

    struct ScriptedReconnector {
        calls: AtomicU32,
        failures_before_success: u32,
        error: fn() -> TransportError,
    }

    impl ScriptedReconnector {
        fn new(failures_before_success: u32) -> Self {
            Self {
                calls: AtomicU32::new(0),
                failures_before_success,
                error: reset_err,
            }
        }
    }

    #[async_trait]
    impl Reconnector for ScriptedReconnector {
        async fn reconnect(&self, _identity: &IdentityKey) -> std::result::Result<(), TransportError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures_before_success {
                Err((self.error)())
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn disabled_never_reconnects() {
        let (orch, _) = orchestrator(ReconnectionConfig {
            enabled: false,
            ..config()
        });
        let id = IdentityKey::from("s1");
        assert_matches!(orch.on_disconnect(&id), Err(EngineError::ReconnectionDisabled));
        assert_eq!(orch.state(&id), ReconnectionState::Idle);
    }

    #[test]
    fn failures_latch_after_max_attempts() {
        let (orch, classifier) = orchestrator(config());
        let id = IdentityKey::from("s1");
        assert_eq!(orch.on_disconnect(&id).unwrap(), ReconnectionState::Reconnecting);

        let mut delays = Vec::new();
        for _ in 0..4 {
            let delay = orch.next_attempt_delay_ms(&id);
            delays.push(delay);
            assert_eq!(
                orch.record_failure(&id, delay, 5, &reset_err()).unwrap(),
                ReconnectionState::Reconnecting
            );
        }
        assert_eq!(delays, vec![1_000, 2_000, 4_000, 8_000]);
        assert_eq!(orch.next_attempt_delay_ms(&id), 16_000);

        assert_eq!(
            orch.record_failure(&id, 16_000, 5, &reset_err()).unwrap(),
            ReconnectionState::PermanentFailure
        );
        assert_eq!(
            classifier.count(ErrorClassification::ReconnectionPermanentFailure),
            1
        );

        // latched
        assert_matches!(
            orch.record_failure(&id, 0, 0, &reset_err()),
            Err(EngineError::PermanentFailure(_))
        );
        assert_matches!(orch.on_disconnect(&id), Err(EngineError::PermanentFailure(_)));
        assert_matches!(orch.record_success(&id, 0, 0), Err(EngineError::PermanentFailure(_)));
        assert_eq!(orch.history(&id).len(), 5);

        orch.reset(&id);
        assert_eq!(orch.state(&id), ReconnectionState::Idle);
        assert_eq!(orch.on_disconnect(&id).unwrap(), ReconnectionState::Reconnecting);
        assert_eq!(orch.next_attempt_delay_ms(&id), 1_000);
    }

    #[test]
    fn success_resets_attempts() {
        let (orch, _) = orchestrator(config());
        let id = IdentityKey::from("s1");
        let _ = orch.on_disconnect(&id).unwrap();
        let _ = orch.record_failure(&id, 1_000, 3, &reset_err()).unwrap();
        let _ = orch.record_failure(&id, 2_000, 3, &reset_err()).unwrap();
        assert_eq!(
            orch.record_success(&id, 4_000, 3).unwrap(),
            ReconnectionState::Connected
        );

        let status = orch.status(&id);
        assert_eq!(status.current_attempt, 0);
        assert_eq!(status.successful_reconnects, 1);
        assert_eq!(status.failed_attempts, 2);
        assert!(status.last_successful_connect_at.is_some());
        assert_eq!(status.next_delay_ms, None);

        let numbers: Vec<u32> = orch.history(&id).iter().map(|a| a.attempt_number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);

        // connected behaves like idle for the next disconnect
        assert_eq!(orch.on_disconnect(&id).unwrap(), ReconnectionState::Reconnecting);
        assert_eq!(orch.status(&id).next_delay_ms, Some(1_000));
    }

    #[test]
    fn rejected_error_is_permanent_immediately() {
        let (orch, classifier) = orchestrator(config());
        let id = IdentityKey::from("s1");
        let _ = orch.on_disconnect(&id).unwrap();
        assert_eq!(
            orch.record_failure(&id, 1_000, 1, &TransportError::Rejected("bad token".into()))
                .unwrap(),
            ReconnectionState::PermanentFailure
        );
        assert_eq!(
            classifier.count(ErrorClassification::ReconnectionPermanentFailure),
            1
        );
    }

    #[test]
    fn recent_ring_keeps_last_ten() {
        let (orch, _) = orchestrator(ReconnectionConfig {
            max_attempts: 50,
            ..config()
        });
        let id = IdentityKey::from("s1");
        let _ = orch.on_disconnect(&id).unwrap();
        for _ in 0..12 {
            let _ = orch.record_failure(&id, 10, 1, &reset_err()).unwrap();
        }
        assert_eq!(orch.history(&id).len(), 12);

        let metrics = orch.get_metrics(&id);
        assert_eq!(metrics.recent_attempts.len(), 10);
        assert!(metrics.recent_attempts[0].starts_with("#3 "));
        assert!(metrics.recent_attempts[9].starts_with("#12 "));
        assert!(metrics.recent_attempts[9].contains("connection reset"));
        assert_eq!(metrics.status.total_attempts, 12);

        // reading is side-effect free
        assert_eq!(orch.get_metrics(&id), metrics);
    }

    #[test]
    fn unknown_identity_is_idle() {
        let (orch, _) = orchestrator(config());
        let id = IdentityKey::from("nobody");
        let status = orch.status(&id);
        assert_eq!(status.state, ReconnectionState::Idle);
        assert_eq!(status.total_attempts, 0);
        assert!(orch.get_metrics(&id).recent_attempts.is_empty());
        assert_eq!(orch.next_attempt_delay_ms(&id), 1_000);
    }

    #[test]
    fn jitter_is_deterministic_per_seed() {
        let jittered = ReconnectionConfig {
            jitter: true,
            ..config()
        };
        let (a, _) = orchestrator(jittered.clone());
        let (b, _) = orchestrator(jittered);
        let id = IdentityKey::from("s1");
        for attempt in 0..6 {
            let delay = a.delay_for_attempt(&id, attempt);
            assert_eq!(delay, b.delay_for_attempt(&id, attempt));
            let (low, high) = a.policy.bounds_ms(attempt);
            assert!((low..=high).contains(&delay), "{delay} not in {low}..={high}");
        }
    }

    #[test]
    fn summary_counts_states() {
        let (orch, _) = orchestrator(config());
        let a = IdentityKey::from("a");
        let b = IdentityKey::from("b");
        let c = IdentityKey::from("c");
        let _ = orch.on_disconnect(&a).unwrap();
        orch.on_connected(&b);
        let _ = orch.on_disconnect(&c).unwrap();
        let _ = orch
            .record_failure(&c, 0, 0, &TransportError::Rejected("no".into()))
            .unwrap();

        let summary = orch.summary();
        assert_eq!(summary.identities, 3);
        assert_eq!(summary.reconnecting, 1);
        assert_eq!(summary.connected, 1);
        assert_eq!(summary.permanent_failure, 1);
        assert_eq!(summary.total_attempts, 1);

        assert!(orch.forget(&a));
        assert_eq!(orch.summary().identities, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn run_reconnect_backs_off_then_connects() {
        let (orch, _) = orchestrator(config());
        let id = IdentityKey::from("s1");
        let reconnector = ScriptedReconnector::new(2);

        let started = Instant::now();
        let state = orch.run_reconnect(&id, &reconnector).await.unwrap();
        assert_eq!(state, ReconnectionState::Connected);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(7_000), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(7_050), "{elapsed:?}");
        assert_eq!(reconnector.calls.load(Ordering::SeqCst), 3);

        let delays: Vec<u64> = orch.history(&id).iter().map(|a| a.delay_ms).collect();
        assert_eq!(delays, vec![1_000, 2_000, 4_000]);
    }

    #[tokio::test(start_paused = true)]
    async fn run_reconnect_gives_up() {
        let (orch, classifier) = orchestrator(ReconnectionConfig {
            max_attempts: 3,
            ..config()
        });
        let id = IdentityKey::from("s1");
        let reconnector = ScriptedReconnector::new(u32::MAX);

        assert_matches!(
            orch.run_reconnect(&id, &reconnector).await,
            Err(EngineError::PermanentFailure(key)) if key == id
        );
        assert_eq!(reconnector.calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            classifier.count(ErrorClassification::ReconnectionPermanentFailure),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn run_reconnect_stops_on_rejection() {
        let (orch, _) = orchestrator(config());
        let id = IdentityKey::from("s1");
        let reconnector = ScriptedReconnector {
            calls: AtomicU32::new(0),
            failures_before_success: 1,
            error: || TransportError::Rejected("revoked".into()),
        };
        assert_matches!(
            orch.run_reconnect(&id, &reconnector).await,
            Err(EngineError::PermanentFailure(_))
        );
        assert_eq!(reconnector.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_cancels_pending_wait() {
        let (orch, _) = orchestrator(config());
        let id = IdentityKey::from("s1");
        let reconnector = Arc::new(ScriptedReconnector::new(0));

        let handle = orch.spawn_reconnect(id.clone(), reconnector.clone());
        time::sleep(Duration::from_millis(500)).await;
        orch.reset(&id);

        assert_matches!(handle.await.unwrap(), Err(EngineError::Cancelled));
        assert_eq!(reconnector.calls.load(Ordering::SeqCst), 0);
        assert_eq!(orch.state(&id), ReconnectionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn root_cancel_stops_wait() {
        let metrics = Arc::new(MetricsCollector::default());
        let classifier = Arc::new(ErrorClassifier::new(
            Arc::new(TracingReporter),
            10,
            metrics.clone(),
        ));
        let root = CancellationToken::new();
        let orch = Arc::new(ReconnectionOrchestrator::new(
            config(),
            classifier,
            metrics,
            root.clone(),
        ));
        let handle = orch.spawn_reconnect(
            IdentityKey::from("s1"),
            Arc::new(ScriptedReconnector::new(0)),
        );
        time::sleep(Duration::from_millis(100)).await;
        root.cancel();
        assert_matches!(handle.await.unwrap(), Err(EngineError::Cancelled));
    }

    struct SlowReconnector {
        calls: AtomicU32,
        takes: Duration,
    }

    #[async_trait]
    impl Reconnector for SlowReconnector {
        async fn reconnect(&self, _identity: &IdentityKey) -> std::result::Result<(), TransportError> {
            let _ = self.calls.fetch_add(1, Ordering::SeqCst);
            time::sleep(self.takes).await;
            Err(reset_err())
        }
    }

    fn slow() -> Arc<SlowReconnector> {
        Arc::new(SlowReconnector {
            calls: AtomicU32::new(0),
            takes: Duration::from_secs(5),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn reset_during_attempt_drops_its_outcome() {
        let (orch, classifier) = orchestrator(config());
        let id = IdentityKey::from("s1");
        let reconnector = slow();

        let handle = orch.spawn_reconnect(id.clone(), reconnector.clone());
        // first attempt starts at 1s and is still running at 2s
        time::sleep(Duration::from_secs(2)).await;
        assert_eq!(reconnector.calls.load(Ordering::SeqCst), 1);
        orch.reset(&id);

        assert_matches!(handle.await.unwrap(), Err(EngineError::Cancelled));
        time::sleep(Duration::from_secs(60)).await;
        assert_eq!(orch.state(&id), ReconnectionState::Idle);
        assert_eq!(reconnector.calls.load(Ordering::SeqCst), 1);
        assert!(orch.history(&id).is_empty());
        assert_eq!(
            classifier.count(ErrorClassification::ReconnectionPermanentFailure),
            0
        );
    }

    #[tokio::test(start_paused = true)]
    async fn forget_during_attempt_drops_its_outcome() {
        let (orch, _) = orchestrator(config());
        let id = IdentityKey::from("s1");
        let reconnector = slow();

        let handle = orch.spawn_reconnect(id.clone(), reconnector.clone());
        time::sleep(Duration::from_secs(2)).await;
        assert!(orch.forget(&id));

        assert_matches!(handle.await.unwrap(), Err(EngineError::Cancelled));
        assert_eq!(orch.summary().identities, 0);
        assert_eq!(reconnector.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_driver_yields_to_new_episode() {
        let (orch, _) = orchestrator(ReconnectionConfig {
            max_attempts: 2,
            ..config()
        });
        let id = IdentityKey::from("s1");
        let first = slow();
        let stale = orch.spawn_reconnect(id.clone(), first.clone());
        time::sleep(Duration::from_secs(2)).await;

        // reset and a new disconnect start a second episode under a new driver
        orch.reset(&id);
        let second = Arc::new(ScriptedReconnector::new(0));
        let fresh = orch.spawn_reconnect(id.clone(), second.clone());

        assert_matches!(stale.await.unwrap(), Err(EngineError::Cancelled));
        assert_eq!(fresh.await.unwrap().unwrap(), ReconnectionState::Connected);
        assert_eq!(orch.history(&id).len(), 1);
        assert_eq!(first.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn second_driver_for_same_episode_returns_at_once() {
        let (orch, _) = orchestrator(config());
        let id = IdentityKey::from("s1");
        let reconnector = Arc::new(ScriptedReconnector::new(0));

        let driver = orch.spawn_reconnect(id.clone(), reconnector.clone());
        time::sleep(Duration::from_millis(10)).await;
        assert_eq!(
            orch.run_reconnect(&id, reconnector.as_ref()).await.unwrap(),
            ReconnectionState::Reconnecting
        );
        assert_eq!(driver.await.unwrap().unwrap(), ReconnectionState::Connected);
        assert_eq!(reconnector.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn outcome_without_episode_is_refused() {
        let (orch, _) = orchestrator(config());
        let id = IdentityKey::from("s1");
        assert_matches!(orch.record_failure(&id, 0, 0, &reset_err()), Err(EngineError::Cancelled));

        orch.on_connected(&id);
        assert_matches!(orch.record_success(&id, 0, 0), Err(EngineError::Cancelled));
        assert!(orch.history(&id).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn prune_settled_forgets_quiet_identities() {
        let (orch, _) = orchestrator(config());
        let idle = IdentityKey::from("idle");
        let connected = IdentityKey::from("connected");
        let busy = IdentityKey::from("busy");
        let live = IdentityKey::from("live");

        let _ = orch.on_disconnect(&idle).unwrap();
        orch.reset(&idle);
        orch.on_connected(&connected);
        orch.on_connected(&live);
        let _ = orch.on_disconnect(&busy).unwrap();

        let retention = Duration::from_secs(3_600);
        assert_eq!(orch.prune_settled(retention, |_| false), 0);

        time::advance(retention).await;
        assert_eq!(orch.prune_settled(retention, |key| key == &live), 2);

        let summary = orch.summary();
        assert_eq!(summary.identities, 2);
        assert_eq!(summary.reconnecting, 1);
        assert_eq!(orch.state(&live), ReconnectionState::Connected);
    }

    proptest! {
        #[test]
        fn attempt_numbers_are_monotonic(outcomes in proptest::collection::vec(any::<bool>(), 1..30)) {
            let (orch, _) = orchestrator(ReconnectionConfig { max_attempts: 100, ..config() });
            let id = IdentityKey::from("p");
            let _ = orch.on_disconnect(&id).unwrap();
            let mut expected = 1u32;
            for success in outcomes {
                if success {
                    let _ = orch.record_success(&id, 0, 0).unwrap();
                    let last = orch.history(&id).last().cloned().unwrap();
                    prop_assert_eq!(last.attempt_number, expected);
                    expected = 1;
                    let _ = orch.on_disconnect(&id).unwrap();
                } else {
                    let _ = orch.record_failure(&id, 0, 0, &reset_err()).unwrap();
                    let last = orch.history(&id).last().cloned().unwrap();
                    prop_assert_eq!(last.attempt_number, expected);
                    expected += 1;
                }
            }
        }
    }
}
