//! # lifeline-telemetry
//!
//! Observability for the Lifeline connection engine:
//!
//! - [`MetricsCollector`]: bounded, in-memory time series with summary stats
//! - [`logging`]: `tracing-subscriber` initialisation
//! - [`export`]: metric name constants and the Prometheus recorder

#![deny(unsafe_code)]

pub mod collector;
pub mod export;
pub mod logging;

pub use collector::{MetricKind, MetricPoint, MetricStats, MetricsCollector, Tags};
pub use export::{TelemetryError, install_prometheus_recorder, names};
pub use logging::{init_from_settings, init_json_subscriber, init_subscriber};
