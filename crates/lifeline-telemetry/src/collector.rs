//! Bounded in-memory metrics store.
//!
//! Every metric name owns a fixed-capacity ring buffer of [`MetricPoint`]s.
//! Once a buffer is full the oldest point is dropped to make room; recording
//! never fails. Queries optionally restrict to the last `duration_minutes`
//! before computing [`MetricStats`].
//!
//! When export is enabled each sample is also forwarded to the global
//! `metrics` recorder so an installed Prometheus exporter can scrape it.

use std::collections::{BTreeMap, HashMap, VecDeque};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use lifeline_settings::MetricsSettings;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

/// Tag set attached to a sample.
pub type Tags = BTreeMap<String, String>;

/// Type of metric.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    /// Monotonic count increments.
    Counter,
    /// Point-in-time level.
    Gauge,
    /// Elapsed time in milliseconds.
    Timer,
    /// Arbitrary distribution sample.
    Histogram,
}

/// One recorded sample.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    /// When the sample was taken.
    pub timestamp: DateTime<Utc>,
    /// Sample value.
    pub value: f64,
    /// Sample tags.
    pub tags: Tags,
}

/// Summary statistics over a series.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetricStats {
    /// Number of points.
    pub count: usize,
    /// Sum of values.
    pub sum: f64,
    /// Arithmetic mean.
    pub mean: f64,
    /// Median (mean of the middle two for even counts).
    pub median: f64,
    /// Smallest value.
    pub min: f64,
    /// Largest value.
    pub max: f64,
    /// Population standard deviation; 0.0 for a single point.
    pub stddev: f64,
}

impl MetricStats {
    /// Compute stats over `values`. `None` when empty.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn from_values(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let count = values.len();
        let sum: f64 = values.iter().sum();
        let mean = sum / count as f64;

        let mut sorted = values.to_vec();
        sorted.sort_by(f64::total_cmp);
        let median = if count % 2 == 0 {
            (sorted[count / 2 - 1] + sorted[count / 2]) / 2.0
        } else {
            sorted[count / 2]
        };

        let stddev = if count == 1 {
            0.0
        } else {
            let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / count as f64;
            variance.sqrt()
        };

        Some(Self {
            count,
            sum,
            mean,
            median,
            min: sorted[0],
            max: sorted[count - 1],
            stddev,
        })
    }
}

struct Series {
    kind: MetricKind,
    points: VecDeque<MetricPoint>,
}

/// Bounded per-name time-series store.
pub struct MetricsCollector {
    max_points: usize,
    export: bool,
    series: RwLock<HashMap<String, Mutex<Series>>>,
}

impl MetricsCollector {
    /// Default ring-buffer capacity per metric.
    pub const DEFAULT_MAX_POINTS: usize = 10_000;

    /// Create a collector keeping at most `max_points` per metric.
    #[must_use]
    pub fn new(max_points: usize) -> Self {
        Self {
            max_points: max_points.max(1),
            export: false,
            series: RwLock::new(HashMap::new()),
        }
    }

    /// Create a collector from settings.
    #[must_use]
    pub fn from_settings(settings: &MetricsSettings) -> Self {
        Self::new(settings.max_points).with_export(settings.export_to_recorder)
    }

    /// Mirror samples to the global `metrics` recorder.
    #[must_use]
    pub fn with_export(mut self, export: bool) -> Self {
        self.export = export;
        self
    }

    /// Ring-buffer capacity per metric.
    pub fn max_points(&self) -> usize {
        self.max_points
    }

    /// Record a counter increment.
    pub fn record_counter(&self, name: &str, value: f64, tags: Tags) {
        self.record(name, MetricKind::Counter, value, tags);
    }

    /// Record a gauge level.
    pub fn record_gauge(&self, name: &str, value: f64, tags: Tags) {
        self.record(name, MetricKind::Gauge, value, tags);
    }

    /// Record an elapsed time in milliseconds.
    pub fn record_timer(&self, name: &str, value_ms: f64, tags: Tags) {
        self.record(name, MetricKind::Timer, value_ms, tags);
    }

    /// Record a distribution sample.
    pub fn record_histogram(&self, name: &str, value: f64, tags: Tags) {
        self.record(name, MetricKind::Histogram, value, tags);
    }

    /// Record a sample stamped now.
    pub fn record(&self, name: &str, kind: MetricKind, value: f64, tags: Tags) {
        self.record_at(name, kind, value, tags, Utc::now());
    }

    /// Record a sample with an explicit timestamp.
    pub fn record_at(
        &self,
        name: &str,
        kind: MetricKind,
        value: f64,
        tags: Tags,
        timestamp: DateTime<Utc>,
    ) {
        if self.export {
            forward(name, kind, value, &tags);
        }
        let point = MetricPoint {
            timestamp,
            value,
            tags,
        };

        // Fast path: series exists
        {
            let series = self.series.read();
            if let Some(s) = series.get(name) {
                self.push(&mut s.lock(), point);
                return;
            }
        }

        let mut series = self.series.write();
        let entry = series.entry(name.to_string()).or_insert_with(|| {
            Mutex::new(Series {
                kind,
                points: VecDeque::new(),
            })
        });
        self.push(&mut entry.lock(), point);
    }

    fn push(&self, series: &mut Series, point: MetricPoint) {
        while series.points.len() >= self.max_points {
            let _ = series.points.pop_front();
        }
        series.points.push_back(point);
    }

    /// Values of `name`, oldest first, optionally limited to the last
    /// `duration_minutes`. Unknown names yield an empty vector.
    pub fn get_metric_values(&self, name: &str, duration_minutes: Option<u64>) -> Vec<f64> {
        self.points(name, duration_minutes)
            .into_iter()
            .map(|p| p.value)
            .collect()
    }

    /// Points of `name`, oldest first, optionally windowed.
    pub fn points(&self, name: &str, duration_minutes: Option<u64>) -> Vec<MetricPoint> {
        let series = self.series.read();
        let Some(s) = series.get(name) else {
            return Vec::new();
        };
        let s = s.lock();
        match window_start(duration_minutes) {
            Some(cutoff) => s
                .points
                .iter()
                .filter(|p| p.timestamp >= cutoff)
                .cloned()
                .collect(),
            None => s.points.iter().cloned().collect(),
        }
    }

    /// Summary statistics for `name`. `None` when no point falls in the window.
    pub fn get_metric_stats(&self, name: &str, duration_minutes: Option<u64>) -> Option<MetricStats> {
        MetricStats::from_values(&self.get_metric_values(name, duration_minutes))
    }

    /// Kind `name` was first recorded as.
    pub fn kind(&self, name: &str) -> Option<MetricKind> {
        self.series.read().get(name).map(|s| s.lock().kind)
    }

    /// All metric names, sorted.
    pub fn metric_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.series.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Stats for every non-empty metric over the optional window.
    pub fn summary(&self, duration_minutes: Option<u64>) -> BTreeMap<String, MetricStats> {
        self.metric_names()
            .into_iter()
            .filter_map(|name| {
                let stats = self.get_metric_stats(&name, duration_minutes)?;
                Some((name, stats))
            })
            .collect()
    }

    /// Drop every series.
    pub fn clear(&self) {
        self.series.write().clear();
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new(Self::DEFAULT_MAX_POINTS)
    }
}

fn window_start(duration_minutes: Option<u64>) -> Option<DateTime<Utc>> {
    let minutes = i64::try_from(duration_minutes?).unwrap_or(i64::MAX);
    let span = ChronoDuration::try_minutes(minutes).unwrap_or(ChronoDuration::MAX);
    Some(
        Utc::now()
            .checked_sub_signed(span)
            .unwrap_or(DateTime::<Utc>::MIN_UTC),
    )
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn forward(name: &str, kind: MetricKind, value: f64, tags: &Tags) {
    let labels: Vec<metrics::Label> = tags
        .iter()
        .map(|(k, v)| metrics::Label::new(k.clone(), v.clone()))
        .collect();
    let name = name.to_owned();
    match kind {
        MetricKind::Counter => {
            metrics::counter!(name, labels).increment(value.max(0.0) as u64);
        }
        MetricKind::Gauge => metrics::gauge!(name, labels).set(value),
        MetricKind::Timer | MetricKind::Histogram => {
            metrics::histogram!(name, labels).record(value);
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
