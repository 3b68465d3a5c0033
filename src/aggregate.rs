use std::fmt::Debug;

use crate::{metric::MetricKind, trend::PercentileEstimator};

/// The `Aggregate` trait defines how raw samples are folded into a compact,
/// mergeable representation that keeps everything needed for the final
/// statistics.
///
/// Aggregates do **not** compute derived values such as averages or rates;
/// those are produced by [`crate::report::MetricSummary`] and by threshold
/// evaluation from the finalized aggregate.
///
/// # Implementor notes
/// - `merge` must be **associative** and **commutative**: the metric store keeps
///   several shards per metric and merges them in arbitrary order at finalize.
/// - `consume` sits on the hot path of every VU and must not allocate.
pub trait Aggregate
where
    Self: Send + Sync + Debug + Clone,
{
    /// The sample type this aggregate summarizes.
    type Sample;

    /// Create a new, empty instance of the aggregate.
    fn new() -> Self;

    /// Aggregate multiple samples into the current instance.
    fn aggregate(&mut self, samples: &[Self::Sample]) {
        samples.iter().for_each(|s| self.consume(s));
    }

    /// Incorporate a single sample into the aggregate.
    fn consume(&mut self, sample: &Self::Sample);

    /// Combine two aggregates into one.
    fn merge(&mut self, other: Self);
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CounterAggregate {
    pub sum: f64,
    pub samples: u64,
}

impl Aggregate for CounterAggregate {
    type Sample = f64;

    fn new() -> Self {
        Self::default()
    }

    fn consume(&mut self, sample: &f64) {
        self.sum += sample;
        self.samples += 1;
    }

    fn merge(&mut self, other: Self) {
        self.sum += other.sum;
        self.samples += other.samples;
    }
}

/// A gauge write tagged with its arrival position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GaugeSample {
    pub sequence: u64,
    pub value: f64,
}

/// Last-write-wins gauge. "Last" is the highest arrival sequence, which keeps
/// `merge` order-independent across shards.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GaugeAggregate {
    pub last: Option<GaugeSample>,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl GaugeAggregate {
    pub fn value(&self) -> Option<f64> {
        self.last.map(|s| s.value)
    }
}

impl Aggregate for GaugeAggregate {
    type Sample = GaugeSample;

    fn new() -> Self {
        Self::default()
    }

    fn consume(&mut self, sample: &GaugeSample) {
        if self.last.is_none_or(|last| sample.sequence >= last.sequence) {
            self.last = Some(*sample);
        }
        self.min = Some(self.min.map_or(sample.value, |m| m.min(sample.value)));
        self.max = Some(self.max.map_or(sample.value, |m| m.max(sample.value)));
    }

    fn merge(&mut self, other: Self) {
        if let Some(last) = other.last {
            if self.last.is_none_or(|mine| last.sequence > mine.sequence) {
                self.last = Some(last);
            }
        }
        self.min = match (self.min, other.min) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.max = match (self.max, other.max) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RateAggregate {
    pub passes: u64,
    pub total: u64,
}

impl RateAggregate {
    pub fn fails(&self) -> u64 {
        self.total - self.passes
    }

    /// `passes / total`, or `None` before the first sample.
    pub fn rate(&self) -> Option<f64> {
        (self.total > 0).then(|| self.passes as f64 / self.total as f64)
    }
}

impl Aggregate for RateAggregate {
    type Sample = bool;

    fn new() -> Self {
        Self::default()
    }

    fn consume(&mut self, sample: &bool) {
        self.passes += u64::from(*sample);
        self.total += 1;
    }

    fn merge(&mut self, other: Self) {
        self.passes += other.passes;
        self.total += other.total;
    }
}

#[derive(Debug, Clone, Default)]
pub struct TrendAggregate {
    pub estimator: PercentileEstimator,
}

impl Aggregate for TrendAggregate {
    type Sample = f64;

    fn new() -> Self {
        Self::default()
    }

    fn consume(&mut self, sample: &f64) {
        self.estimator.record(*sample);
    }

    fn merge(&mut self, other: Self) {
        self.estimator.merge(&other.estimator);
    }
}

/// Aggregate of any kind, as stored per metric shard and handed out at finalize.
#[derive(Debug, Clone)]
pub enum MetricAggregate {
    Counter(CounterAggregate),
    Gauge(GaugeAggregate),
    Rate(RateAggregate),
    Trend(TrendAggregate),
}

impl MetricAggregate {
    pub fn new(kind: MetricKind) -> Self {
        match kind {
            MetricKind::Counter => Self::Counter(CounterAggregate::new()),
            MetricKind::Gauge => Self::Gauge(GaugeAggregate::new()),
            MetricKind::Rate => Self::Rate(RateAggregate::new()),
            MetricKind::Trend => Self::Trend(TrendAggregate::new()),
        }
    }

    pub fn kind(&self) -> MetricKind {
        match self {
            Self::Counter(_) => MetricKind::Counter,
            Self::Gauge(_) => MetricKind::Gauge,
            Self::Rate(_) => MetricKind::Rate,
            Self::Trend(_) => MetricKind::Trend,
        }
    }

    /// Route a raw value to the kind-specific aggregate. `sequence` is only
    /// meaningful for gauges.
    pub(crate) fn record(&mut self, value: f64, sequence: u64) {
        match self {
            Self::Counter(agg) => agg.consume(&value),
            Self::Gauge(agg) => agg.consume(&GaugeSample { sequence, value }),
            Self::Rate(agg) => agg.consume(&(value != 0.0)),
            Self::Trend(agg) => agg.consume(&value),
        }
    }

    /// Merge an aggregate of the same kind. Shards of one metric always share
    /// a kind, so a mismatch is ignored.
    pub fn merge(&mut self, other: MetricAggregate) {
        match (self, other) {
            (Self::Counter(a), Self::Counter(b)) => a.merge(b),
            (Self::Gauge(a), Self::Gauge(b)) => a.merge(b),
            (Self::Rate(a), Self::Rate(b)) => a.merge(b),
            (Self::Trend(a), Self::Trend(b)) => a.merge(b),
            (a, b) => {
                tracing::error!("Refusing to merge a {} into a {}", b.kind(), a.kind());
            }
        }
    }
}
