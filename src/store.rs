//! The metric store: a registry of named metrics shared by every VU of a run.
//!
//! # Concurrency
//!
//! The registry map sits behind a [`parking_lot::RwLock`] that is only taken
//! for writing when a new metric name is registered. Each metric owns a small
//! array of shards, each a [`parking_lot::Mutex`] around a
//! [`MetricAggregate`]. Writers pick a shard round-robin through a per-metric
//! atomic cursor, so only writers of the same metric can ever contend, and
//! even those are spread across shards. `finalize` merges the shards, which
//! is valid because every aggregate's `merge` is order-independent.
//!
//! Typed handles ([`Counter`], [`Gauge`], [`Rate`], [`Trend`]) hold the metric
//! cell directly and skip the registry lookup on the hot path.
use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::{Mutex, RwLock};

use crate::{
    aggregate::MetricAggregate,
    error::{ConfigError, RecordError},
    metric::{MetricKind, Sample},
};

struct MetricCell {
    name: String,
    kind: MetricKind,
    shards: Box<[Mutex<MetricAggregate>]>,
    cursor: AtomicUsize,
    /// Arrival order of gauge writes.
    sequence: AtomicU64,
}

impl MetricCell {
    fn new(name: &str, kind: MetricKind, shards: usize) -> Self {
        Self {
            name: name.to_string(),
            kind,
            shards: (0..shards)
                .map(|_| Mutex::new(MetricAggregate::new(kind)))
                .collect(),
            cursor: AtomicUsize::new(0),
            sequence: AtomicU64::new(0),
        }
    }

    fn record_checked(&self, value: f64) -> Result<(), RecordError> {
        if !value.is_finite() {
            return Err(RecordError::NonFinite(self.name.clone()));
        }
        if self.kind == MetricKind::Counter && value < 0.0 {
            return Err(RecordError::NegativeCounter(self.name.clone()));
        }
        self.record(value);
        Ok(())
    }

    fn record(&self, value: f64) {
        let sequence = match self.kind {
            MetricKind::Gauge => self.sequence.fetch_add(1, Ordering::Relaxed),
            _ => 0,
        };
        let shard = self.cursor.fetch_add(1, Ordering::Relaxed) % self.shards.len();
        self.shards[shard].lock().record(value, sequence);
    }

    fn snapshot(&self) -> MetricAggregate {
        let mut merged = MetricAggregate::new(self.kind);
        for shard in self.shards.iter() {
            merged.merge(shard.lock().clone());
        }
        merged
    }
}

/// Thread-safe registry of named metrics, scoped to one test run.
pub struct MetricStore {
    metrics: RwLock<HashMap<String, Arc<MetricCell>>>,
    shards: usize,
}

impl MetricStore {
    /// A store with one shard per CPU for each metric.
    pub fn new() -> Self {
        Self::with_shards(num_cpus::get())
    }

    pub fn with_shards(shards: usize) -> Self {
        Self {
            metrics: RwLock::new(HashMap::new()),
            shards: shards.max(1),
        }
    }

    /// Register `name` as a metric of `kind`.
    ///
    /// Registering an existing name with the same kind is a no-op; with a
    /// different kind it is a [`ConfigError::KindConflict`].
    pub fn register(&self, name: &str, kind: MetricKind) -> Result<(), ConfigError> {
        self.registered(name, kind).map(|_| ())
    }

    pub fn counter(&self, name: &str) -> Result<Counter, ConfigError> {
        self.registered(name, MetricKind::Counter).map(Counter)
    }

    pub fn gauge(&self, name: &str) -> Result<Gauge, ConfigError> {
        self.registered(name, MetricKind::Gauge).map(Gauge)
    }

    pub fn rate(&self, name: &str) -> Result<Rate, ConfigError> {
        self.registered(name, MetricKind::Rate).map(Rate)
    }

    pub fn trend(&self, name: &str) -> Result<Trend, ConfigError> {
        self.registered(name, MetricKind::Trend).map(Trend)
    }

    pub fn kind_of(&self, name: &str) -> Option<MetricKind> {
        self.metrics.read().get(name).map(|cell| cell.kind)
    }

    pub fn names(&self) -> Vec<String> {
        self.metrics.read().keys().cloned().collect()
    }

    /// Record one sample, registering its metric on first use.
    pub fn record(&self, sample: &Sample) -> Result<(), RecordError> {
        let cell =
            self.cell(&sample.name, sample.kind)
                .map_err(|existing| RecordError::KindMismatch {
                    name: sample.name.clone(),
                    existing,
                    requested: sample.kind,
                })?;
        tracing::trace!(name = %sample.name, value = sample.value, at = ?sample.timestamp, "sample");
        cell.record_checked(sample.value)
    }

    /// Shorthand for [`MetricStore::record`] with a freshly stamped sample.
    pub fn add(&self, name: &str, kind: MetricKind, value: f64) -> Result<(), RecordError> {
        self.record(&Sample::new(name, kind, value))
    }

    /// Merge every metric's shards into an immutable snapshot.
    ///
    /// Called once, after the last VU has stopped. `elapsed` is the run time
    /// used for per-second counter rates.
    pub fn finalize(&self, elapsed: Duration) -> MetricsSnapshot {
        let metrics = self
            .metrics
            .read()
            .iter()
            .map(|(name, cell)| (name.clone(), cell.snapshot()))
            .collect();
        MetricsSnapshot { elapsed, metrics }
    }

    fn registered(&self, name: &str, kind: MetricKind) -> Result<Arc<MetricCell>, ConfigError> {
        self.cell(name, kind)
            .map_err(|existing| ConfigError::KindConflict {
                name: name.to_string(),
                existing,
                requested: kind,
            })
    }

    /// Look up or create the cell for `name`. Fails with the existing kind
    /// when `name` is bound to a different one.
    fn cell(&self, name: &str, kind: MetricKind) -> Result<Arc<MetricCell>, MetricKind> {
        if let Some(cell) = self.metrics.read().get(name) {
            return Self::check_kind(cell, kind);
        }
        let mut metrics = self.metrics.write();
        // Someone may have registered it between the two locks.
        if let Some(cell) = metrics.get(name) {
            return Self::check_kind(cell, kind);
        }
        tracing::debug!("Registering {kind} metric `{name}`");
        let cell = Arc::new(MetricCell::new(name, kind, self.shards));
        metrics.insert(name.to_string(), Arc::clone(&cell));
        Ok(cell)
    }

    fn check_kind(cell: &Arc<MetricCell>, kind: MetricKind) -> Result<Arc<MetricCell>, MetricKind> {
        if cell.kind == kind {
            Ok(Arc::clone(cell))
        } else {
            Err(cell.kind)
        }
    }
}

impl Default for MetricStore {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub struct Counter(Arc<MetricCell>);

impl Counter {
    pub fn add(&self, value: f64) -> Result<(), RecordError> {
        self.0.record_checked(value)
    }

    pub fn increment(&self) {
        self.0.record(1.0);
    }
}

#[derive(Clone)]
pub struct Gauge(Arc<MetricCell>);

impl Gauge {
    pub fn set(&self, value: f64) -> Result<(), RecordError> {
        self.0.record_checked(value)
    }

    pub(crate) fn set_count(&self, value: usize) {
        self.0.record(value as f64);
    }
}

#[derive(Clone)]
pub struct Rate(Arc<MetricCell>);

impl Rate {
    pub fn add(&self, value: bool) {
        self.0.record(if value { 1.0 } else { 0.0 });
    }
}

#[derive(Clone)]
pub struct Trend(Arc<MetricCell>);

impl Trend {
    pub fn add(&self, value: f64) -> Result<(), RecordError> {
        self.0.record_checked(value)
    }

    /// Record a duration in milliseconds.
    pub fn add_duration(&self, value: Duration) {
        self.0.record(value.as_secs_f64() * 1_000.0);
    }
}

/// Immutable result of [`MetricStore::finalize`]: metric name to aggregate.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    elapsed: Duration,
    metrics: BTreeMap<String, MetricAggregate>,
}

impl MetricsSnapshot {
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn get(&self, name: &str) -> Option<&MetricAggregate> {
        self.metrics.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &MetricAggregate)> {
        self.metrics.iter()
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    /// Total of a counter, `0.0` if the metric is missing or not a counter.
    pub fn counter_total(&self, name: &str) -> f64 {
        match self.metrics.get(name) {
            Some(MetricAggregate::Counter(c)) => c.sum,
            _ => 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_kind_registration_is_idempotent() {
        let store = MetricStore::new();
        store.register("errors", MetricKind::Rate).unwrap();
        store.register("errors", MetricKind::Rate).unwrap();
        assert_eq!(store.names(), vec!["errors".to_string()]);
    }

    #[test]
    fn conflicting_registration_is_a_config_error() {
        let store = MetricStore::new();
        store.register("errors", MetricKind::Rate).unwrap();
        assert_eq!(
            store.register("errors", MetricKind::Counter),
            Err(ConfigError::KindConflict {
                name: "errors".into(),
                existing: MetricKind::Rate,
                requested: MetricKind::Counter,
            })
        );
    }

    #[test]
    fn wrong_kind_sample_is_rejected() {
        let store = MetricStore::new();
        store.add("latency", MetricKind::Trend, 10.0).unwrap();
        assert!(matches!(
            store.add("latency", MetricKind::Gauge, 1.0),
            Err(RecordError::KindMismatch { .. })
        ));
    }

    #[test]
    fn non_finite_sample_is_rejected() {
        let store = MetricStore::new();
        assert_eq!(
            store.add("latency", MetricKind::Trend, f64::NAN),
            Err(RecordError::NonFinite("latency".into()))
        );
        assert!(store.trend("latency").unwrap().add(f64::INFINITY).is_err());
    }

    #[test]
    fn negative_counter_sample_is_rejected() {
        let store = MetricStore::new();
        let reqs = store.counter("reqs").unwrap();
        reqs.increment();
        assert_eq!(reqs.add(-5.0), Err(RecordError::NegativeCounter("reqs".into())));
        assert_eq!(
            store.add("reqs", MetricKind::Counter, -1.0),
            Err(RecordError::NegativeCounter("reqs".into()))
        );
        reqs.add(0.0).unwrap();
        reqs.add(2.5).unwrap();
        // Gauges and trends still take negative values.
        store.add("temperature", MetricKind::Gauge, -3.0).unwrap();
        store.add("offset", MetricKind::Trend, -3.0).unwrap();

        let snapshot = store.finalize(Duration::from_secs(1));
        assert_eq!(snapshot.counter_total("reqs"), 3.5);
    }

    #[test]
    fn record_registers_unknown_metrics() {
        let store = MetricStore::new();
        store.record(&Sample::counter("requests", 2.0)).unwrap();
        store.record(&Sample::counter("requests", 3.0)).unwrap();
        assert_eq!(store.kind_of("requests"), Some(MetricKind::Counter));
        let snapshot = store.finalize(Duration::from_secs(1));
        assert_eq!(snapshot.counter_total("requests"), 5.0);
    }

    #[test]
    fn gauge_keeps_last_arrival_across_shards() {
        let store = MetricStore::with_shards(4);
        let gauge = store.gauge("active").unwrap();
        for v in 1..=10 {
            gauge.set(v as f64).unwrap();
        }
        let snapshot = store.finalize(Duration::ZERO);
        match snapshot.get("active") {
            Some(MetricAggregate::Gauge(g)) => {
                assert_eq!(g.value(), Some(10.0));
                assert_eq!(g.min, Some(1.0));
                assert_eq!(g.max, Some(10.0));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_counter_increments_are_never_lost() {
        let store = Arc::new(MetricStore::with_shards(3));
        let counter = store.counter("hits").unwrap();
        let writers = 64;
        let per_writer = 500;

        let handles: Vec<_> = (0..writers)
            .map(|_| {
                let counter = counter.clone();
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    for i in 0..per_writer {
                        if i % 2 == 0 {
                            counter.increment();
                        } else {
                            store.add("hits", MetricKind::Counter, 1.0).unwrap();
                        }
                        if i % 50 == 0 {
                            tokio::task::yield_now().await;
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        let snapshot = store.finalize(Duration::from_secs(1));
        assert_eq!(snapshot.counter_total("hits"), (writers * per_writer) as f64);
    }

    #[test]
    fn trend_shards_merge_into_one_distribution() {
        let store = MetricStore::with_shards(8);
        let trend = store.trend("latency").unwrap();
        for v in 1..=100 {
            trend.add(v as f64).unwrap();
        }
        match store.finalize(Duration::ZERO).get("latency") {
            Some(MetricAggregate::Trend(t)) => {
                assert_eq!(t.estimator.count(), 100);
                assert_eq!(t.estimator.percentile(0.0), Some(1.0));
                assert_eq!(t.estimator.percentile(100.0), Some(100.0));
                let p50 = t.estimator.percentile(50.0).unwrap();
                assert!((p50 - 50.0).abs() <= 0.5, "p50 = {p50}");
                let p90 = t.estimator.percentile(90.0).unwrap();
                assert!((p90 - 90.0).abs() <= 0.9, "p90 = {p90}");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
