use std::{
    fmt,
    time::{Duration, SystemTime},
};

use serde::{Deserialize, Serialize};

use crate::{
    error::ConfigError,
    store::{Counter, Gauge, MetricStore, Rate, Trend},
};

/// The four statistical kinds a metric can have.
///
/// A metric name is bound to exactly one kind for the life of a test run.
///
/// - **Counter:** monotonic sum of all values.
/// - **Gauge:** the most recently written value. Concurrent writers race; the
///   sample that reaches the store last (arrival order, not wall-clock) wins.
/// - **Rate:** fraction of samples that were `true` (non-zero).
/// - **Trend:** numeric distribution answering avg/min/max/percentile queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Counter,
    Gauge,
    Rate,
    Trend,
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
            MetricKind::Rate => "rate",
            MetricKind::Trend => "trend",
        };
        f.write_str(name)
    }
}

/// A single observation emitted by an iteration.
///
/// Samples are immutable once built and are consumed exactly once by
/// [`MetricStore::record`]. Rate samples carry `1.0` for true and `0.0` for
/// false; any non-zero value counts as true.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub name: String,
    pub kind: MetricKind,
    pub value: f64,
    pub timestamp: SystemTime,
}

impl Sample {
    pub fn new(name: impl Into<String>, kind: MetricKind, value: f64) -> Self {
        Self {
            name: name.into(),
            kind,
            value,
            timestamp: SystemTime::now(),
        }
    }

    pub fn counter(name: impl Into<String>, value: f64) -> Self {
        Self::new(name, MetricKind::Counter, value)
    }

    pub fn gauge(name: impl Into<String>, value: f64) -> Self {
        Self::new(name, MetricKind::Gauge, value)
    }

    pub fn rate(name: impl Into<String>, value: bool) -> Self {
        Self::new(name, MetricKind::Rate, if value { 1.0 } else { 0.0 })
    }

    pub fn trend(name: impl Into<String>, value: f64) -> Self {
        Self::new(name, MetricKind::Trend, value)
    }

    /// Trend sample of a duration, expressed in milliseconds.
    pub fn trend_duration(name: impl Into<String>, value: Duration) -> Self {
        Self::trend(name, value.as_secs_f64() * 1_000.0)
    }
}

pub const HTTP_REQS: &str = "http_reqs";
pub const HTTP_REQ_DURATION: &str = "http_req_duration";
pub const HTTP_REQ_FAILED: &str = "http_req_failed";
pub const CHECKS: &str = "checks";
pub const ITERATIONS: &str = "iterations";
pub const ITERATION_DURATION: &str = "iteration_duration";
pub const INTERRUPTED_ITERATIONS: &str = "interrupted_iterations";
pub const VUS: &str = "vus";
pub const VUS_MAX: &str = "vus_max";

/// Handles to the metrics the engine records on every run.
#[derive(Clone)]
pub struct BuiltinMetrics {
    /// One increment per request issued.
    pub http_reqs: Counter,
    /// Request latency in milliseconds.
    pub http_req_duration: Trend,
    /// `true` for requests that errored or returned a status outside 200-399.
    pub http_req_failed: Rate,
    /// Every check outcome, including the implicit failures of broken iterations.
    pub checks: Rate,
    pub iterations: Counter,
    pub iteration_duration: Trend,
    /// Iterations abandoned at the grace deadline.
    pub interrupted_iterations: Counter,
    pub vus: Gauge,
    pub vus_max: Gauge,
}

impl BuiltinMetrics {
    pub fn register(store: &MetricStore) -> Result<Self, ConfigError> {
        Ok(Self {
            http_reqs: store.counter(HTTP_REQS)?,
            http_req_duration: store.trend(HTTP_REQ_DURATION)?,
            http_req_failed: store.rate(HTTP_REQ_FAILED)?,
            checks: store.rate(CHECKS)?,
            iterations: store.counter(ITERATIONS)?,
            iteration_duration: store.trend(ITERATION_DURATION)?,
            interrupted_iterations: store.counter(INTERRUPTED_ITERATIONS)?,
            vus: store.gauge(VUS)?,
            vus_max: store.gauge(VUS_MAX)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_samples_encode_booleans() {
        assert_eq!(Sample::rate("errors", true).value, 1.0);
        assert_eq!(Sample::rate("errors", false).value, 0.0);
    }

    #[test]
    fn duration_trends_are_milliseconds() {
        let sample = Sample::trend_duration("latency", Duration::from_micros(1_500));
        assert_eq!(sample.kind, MetricKind::Trend);
        assert!((sample.value - 1.5).abs() < 1e-9);
    }

    #[test]
    fn builtins_reject_conflicting_registration() {
        let store = MetricStore::new();
        store.rate(HTTP_REQS).unwrap();
        assert!(matches!(
            BuiltinMetrics::register(&store),
            Err(ConfigError::KindConflict { .. })
        ));
    }
}
