//! Failure classification and reporting.
//!
//! Every failure raised by the heartbeat, cleanup and reconnection paths goes
//! through [`ErrorClassifier::classify`]: it is tagged with an
//! [`ErrorClassification`] and severity, logged at a matching level,
//! retained in a bounded record list, and forwarded to the injected
//! [`ErrorReporter`]. Reporter failures and panics stop here.

use std::collections::{BTreeMap, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use lifeline_core::{ConnectionId, ErrorClassification, ErrorSeverity, IdentityKey, ReportError};
use lifeline_telemetry::{MetricsCollector, Tags, names};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// One classified failure.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReport {
    /// Connection the failure belongs to, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<ConnectionId>,
    /// Logical identity the failure belongs to, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity: Option<IdentityKey>,
    /// Human-readable description.
    pub message: String,
    /// Failure kind.
    pub classification: ErrorClassification,
    /// Urgency.
    pub severity: ErrorSeverity,
    /// When it was classified.
    pub timestamp: DateTime<Utc>,
}

impl ErrorReport {
    /// Build a report stamped now with the classification's severity.
    pub fn new(classification: ErrorClassification, message: impl Into<String>) -> Self {
        Self {
            connection_id: None,
            identity: None,
            message: message.into(),
            classification,
            severity: classification.severity(),
            timestamp: Utc::now(),
        }
    }

    /// Attach a connection id.
    #[must_use]
    pub fn for_connection(mut self, id: &ConnectionId) -> Self {
        self.connection_id = Some(id.clone());
        self
    }

    /// Attach a logical identity.
    #[must_use]
    pub fn for_identity(mut self, identity: &IdentityKey) -> Self {
        self.identity = Some(identity.clone());
        self
    }
}

/// Destination for classified failures.
///
/// Must not block; implementations needing I/O queue internally.
pub trait ErrorReporter: Send + Sync {
    /// Deliver one report.
    fn report(&self, report: &ErrorReport) -> Result<(), ReportError>;
}

/// Reporter that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl ErrorReporter for TracingReporter {
    fn report(&self, report: &ErrorReport) -> Result<(), ReportError> {
        debug!(
            classification = %report.classification,
            severity = %report.severity,
            conn_id = report.connection_id.as_deref().unwrap_or("-"),
            "error reported"
        );
        Ok(())
    }
}

/// Reporter that pushes onto an unbounded queue drained elsewhere.
#[derive(Debug, Clone)]
pub struct ChannelReporter {
    tx: mpsc::UnboundedSender<ErrorReport>,
}

impl ChannelReporter {
    /// Create the reporter and the receiving end of its queue.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ErrorReport>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ErrorReporter for ChannelReporter {
    fn report(&self, report: &ErrorReport) -> Result<(), ReportError> {
        self.tx
            .send(report.clone())
            .map_err(|_| ReportError::QueueClosed)
    }
}

/// Classifies, records and forwards failures.
pub struct ErrorClassifier {
    reporter: Arc<dyn ErrorReporter>,
    records: Mutex<VecDeque<ErrorReport>>,
    max_records: usize,
    counts: [AtomicU64; ErrorClassification::ALL.len()],
    reporter_failures: AtomicU64,
    metrics: Arc<MetricsCollector>,
}

impl ErrorClassifier {
    /// Create a classifier retaining at most `max_records` reports.
    pub fn new(
        reporter: Arc<dyn ErrorReporter>,
        max_records: usize,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            reporter,
            records: Mutex::new(VecDeque::new()),
            max_records: max_records.max(1),
            counts: Default::default(),
            reporter_failures: AtomicU64::new(0),
            metrics,
        }
    }

    /// Classify a failure on one connection.
    pub fn classify_connection(
        &self,
        id: &ConnectionId,
        classification: ErrorClassification,
        message: impl Into<String>,
    ) -> ErrorReport {
        self.classify(ErrorReport::new(classification, message).for_connection(id))
    }

    /// Classify a failure on one logical identity.
    pub fn classify_identity(
        &self,
        identity: &IdentityKey,
        classification: ErrorClassification,
        message: impl Into<String>,
    ) -> ErrorReport {
        self.classify(ErrorReport::new(classification, message).for_identity(identity))
    }

    /// Log, record, count and forward a report.
    pub fn classify(&self, report: ErrorReport) -> ErrorReport {
        log_report(&report);

        let _ = self.counts[index(report.classification)].fetch_add(1, Ordering::Relaxed);
        let mut tags = Tags::new();
        let _ = tags.insert(
            "classification".to_string(),
            report.classification.to_string(),
        );
        let _ = tags.insert("severity".to_string(), report.severity.to_string());
        self.metrics
            .record_counter(names::ERRORS_CLASSIFIED_TOTAL, 1.0, tags);

        {
            let mut records = self.records.lock();
            while records.len() >= self.max_records {
                let _ = records.pop_front();
            }
            records.push_back(report.clone());
        }

        self.forward(&report);
        report
    }

    fn forward(&self, report: &ErrorReport) {
        let outcome = catch_unwind(AssertUnwindSafe(|| self.reporter.report(report)));
        let failure = match outcome {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e.to_string(),
            Err(panic) => panic_message(panic.as_ref()),
        };
        let _ = self.reporter_failures.fetch_add(1, Ordering::Relaxed);
        warn!(
            classification = %report.classification,
            error = %failure,
            "error reporter failed, report dropped"
        );
    }

    /// Drop records older than `retention`. Returns how many were dropped.
    pub fn prune_older_than(&self, retention: Duration) -> usize {
        let Ok(span) = chrono::Duration::from_std(retention) else {
            return 0;
        };
        let Some(cutoff) = Utc::now().checked_sub_signed(span) else {
            return 0;
        };
        let mut records = self.records.lock();
        let before = records.len();
        records.retain(|r| r.timestamp >= cutoff);
        before - records.len()
    }

    /// Most recent `limit` records, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<ErrorReport> {
        let records = self.records.lock();
        let skip = records.len().saturating_sub(limit);
        records.iter().skip(skip).cloned().collect()
    }

    /// Retained record count.
    pub fn record_count(&self) -> usize {
        self.records.lock().len()
    }

    /// Total reports ever classified as `classification`.
    pub fn count(&self, classification: ErrorClassification) -> u64 {
        self.counts[index(classification)].load(Ordering::Relaxed)
    }

    /// Totals per classification, keyed by wire name.
    pub fn counts(&self) -> BTreeMap<String, u64> {
        ErrorClassification::ALL
            .into_iter()
            .map(|c| (c.to_string(), self.count(c)))
            .collect()
    }

    /// Reports the reporter rejected or panicked on.
    pub fn reporter_failures(&self) -> u64 {
        self.reporter_failures.load(Ordering::Relaxed)
    }
}

fn index(classification: ErrorClassification) -> usize {
    match classification {
        ErrorClassification::HeartbeatLoopError => 0,
        ErrorClassification::HeartbeatError => 1,
        ErrorClassification::HeartbeatTimeout => 2,
        ErrorClassification::ReconnectionPermanentFailure => 3,
        ErrorClassification::CleanupTickError => 4,
    }
}

fn log_report(report: &ErrorReport) {
    let conn_id = report.connection_id.as_deref().unwrap_or("-");
    let identity = report.identity.as_deref().unwrap_or("-");
    match report.severity {
        ErrorSeverity::Low => debug!(
            conn_id,
            identity,
            classification = %report.classification,
            "{}", report.message
        ),
        ErrorSeverity::Medium => warn!(
            conn_id,
            identity,
            classification = %report.classification,
            "{}", report.message
        ),
        ErrorSeverity::High | ErrorSeverity::Critical => error!(
            conn_id,
            identity,
            classification = %report.classification,
            severity = %report.severity,
            "{}", report.message
        ),
    }
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingReporter;

    impl ErrorReporter for FailingReporter {
        fn report(&self, _report: &ErrorReport) -> Result<(), ReportError> {
            Err(ReportError::Unavailable("sink down".into()))
        }
    }

    struct PanickingReporter;

    impl ErrorReporter for PanickingReporter {
        fn report(&self, _report: &ErrorReport) -> Result<(), ReportError> {
            panic!("reporter bug");
        }
    }

    fn classifier(reporter: Arc<dyn ErrorReporter>, max: usize) -> ErrorClassifier {
        ErrorClassifier::new(reporter, max, Arc::new(MetricsCollector::default()))
    }

    #[test]
    fn report_carries_context() {
        let (reporter, mut rx) = ChannelReporter::new();
        let c = classifier(Arc::new(reporter), 10);
        let _ = c.classify_connection(
            &ConnectionId::from("c1"),
            ErrorClassification::HeartbeatTimeout,
            "3 missed probes",
        );
        let report = rx.try_recv().unwrap();
        assert_eq!(report.connection_id.as_deref(), Some("c1"));
        assert_eq!(report.message, "3 missed probes");
        assert_eq!(report.classification, ErrorClassification::HeartbeatTimeout);
        assert_eq!(report.severity, ErrorSeverity::High);
    }

    #[test]
    fn identity_reports_are_critical() {
        let (reporter, mut rx) = ChannelReporter::new();
        let c = classifier(Arc::new(reporter), 10);
        let _ = c.classify_identity(
            &IdentityKey::from("s1"),
            ErrorClassification::ReconnectionPermanentFailure,
            "gave up",
        );
        let report = rx.try_recv().unwrap();
        assert_eq!(report.identity.as_deref(), Some("s1"));
        assert_eq!(report.severity, ErrorSeverity::Critical);
    }

    #[test]
    fn reporter_error_is_swallowed() {
        let c = classifier(Arc::new(FailingReporter), 10);
        let _ = c.classify(ErrorReport::new(ErrorClassification::CleanupTickError, "boom"));
        assert_eq!(c.reporter_failures(), 1);
        assert_eq!(c.count(ErrorClassification::CleanupTickError), 1);
    }

    #[test]
    fn reporter_panic_is_swallowed() {
        let c = classifier(Arc::new(PanickingReporter), 10);
        let _ = c.classify(ErrorReport::new(ErrorClassification::HeartbeatError, "x"));
        let _ = c.classify(ErrorReport::new(ErrorClassification::HeartbeatError, "y"));
        assert_eq!(c.reporter_failures(), 2);
        assert_eq!(c.record_count(), 2);
    }

    #[test]
    fn closed_channel_counts_as_failure() {
        let (reporter, rx) = ChannelReporter::new();
        drop(rx);
        let c = classifier(Arc::new(reporter), 10);
        let _ = c.classify(ErrorReport::new(ErrorClassification::HeartbeatError, "x"));
        assert_eq!(c.reporter_failures(), 1);
    }

    #[test]
    fn records_are_bounded() {
        let c = classifier(Arc::new(TracingReporter), 3);
        for i in 0..5 {
            let _ = c.classify(ErrorReport::new(
                ErrorClassification::HeartbeatLoopError,
                format!("e{i}"),
            ));
        }
        let recent: Vec<String> = c.recent(10).into_iter().map(|r| r.message).collect();
        assert_eq!(recent, vec!["e2", "e3", "e4"]);
        assert_eq!(c.count(ErrorClassification::HeartbeatLoopError), 5);
    }

    #[test]
    fn recent_limits_from_newest() {
        let c = classifier(Arc::new(TracingReporter), 10);
        for i in 0..4 {
            let _ = c.classify(ErrorReport::new(
                ErrorClassification::HeartbeatError,
                format!("e{i}"),
            ));
        }
        let recent: Vec<String> = c.recent(2).into_iter().map(|r| r.message).collect();
        assert_eq!(recent, vec!["e2", "e3"]);
    }

    #[test]
    fn prune_drops_old_records() {
        let c = classifier(Arc::new(TracingReporter), 10);
        let mut old = ErrorReport::new(ErrorClassification::HeartbeatError, "old");
        old.timestamp = Utc::now() - chrono::Duration::hours(2);
        let _ = c.classify(old);
        let _ = c.classify(ErrorReport::new(ErrorClassification::HeartbeatError, "new"));

        assert_eq!(c.prune_older_than(Duration::from_secs(3600)), 1);
        let left: Vec<String> = c.recent(10).into_iter().map(|r| r.message).collect();
        assert_eq!(left, vec!["new"]);
        // counters are lifetime totals
        assert_eq!(c.count(ErrorClassification::HeartbeatError), 2);
    }

    #[test]
    fn counts_cover_every_classification() {
        let c = classifier(Arc::new(TracingReporter), 10);
        let _ = c.classify(ErrorReport::new(ErrorClassification::HeartbeatTimeout, "t"));
        let counts = c.counts();
        assert_eq!(counts.len(), ErrorClassification::ALL.len());
        assert_eq!(counts["HEARTBEAT_TIMEOUT"], 1);
        assert_eq!(counts["CLEANUP_TICK_ERROR"], 0);
    }

    #[test]
    fn report_serializes_camel_case() {
        let report = ErrorReport::new(ErrorClassification::HeartbeatTimeout, "t")
            .for_connection(&ConnectionId::from("c1"));
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["connectionId"], "c1");
        assert_eq!(json["classification"], "HEARTBEAT_TIMEOUT");
        assert_eq!(json["severity"], "high");
        assert!(json.get("identity").is_none());
    }

    #[test]
    fn panic_message_extracts_text() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("static");
        assert_eq!(panic_message(payload.as_ref()), "static");
        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");
        let payload: Box<dyn std::any::Any + Send> = Box::new(42);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }
}
