//! Streaming percentile estimation for trend metrics.
//!
//! [`PercentileEstimator`] keeps exact `count`, `sum`, `min` and `max`, and
//! records every sample into HDR histograms for percentile queries. Memory is
//! bounded by the spread of the recorded magnitudes, not by the number of
//! samples.
//!
//! # Layout
//!
//! A magnitude `m` is assigned to the band `floor(log2(m)) / BAND_BITS` and
//! rescaled by a power of two so that every band records integers in
//! `[2^FLOOR_BITS, 2^(FLOOR_BITS + BAND_BITS))`. Each band owns one
//! histogram, negatives and positives are kept apart, and exact zeros (plus
//! subnormals) are only counted. The precision is therefore relative to the
//! sample itself: a nanosecond trend and a trend of byte counts in the
//! exabytes are resolved equally well, over the whole finite `f64` range.
//!
//! # Error bound
//!
//! With three significant digits a percentile answer is within 0.1% relative
//! error of a value that was actually observed at that rank. Percentile 0 and
//! 100 are always the exact observed min and max.
//!
//! Percentiles use the nearest-rank definition: `p(N)` is the sample at rank
//! `ceil(N / 100 * count)` in ascending order.
use std::{collections::BTreeMap, fmt};

use hdrhistogram::Histogram;

/// Binary orders of magnitude covered by one band.
const BAND_BITS: i32 = 16;
/// Every band records magnitudes scaled to at least `2^FLOOR_BITS`.
const FLOOR_BITS: i32 = 11;
const SIGNIFICANT_DIGITS: u8 = 3;

#[derive(Clone)]
pub struct PercentileEstimator {
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
    /// Samples that are zero or too small to be normal floats.
    zeros: u64,
    /// Magnitudes of positive samples, by band.
    positive: BTreeMap<i32, Histogram<u64>>,
    /// Magnitudes of negative samples, by band.
    negative: BTreeMap<i32, Histogram<u64>>,
}

impl PercentileEstimator {
    pub fn new() -> Self {
        Self {
            count: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            zeros: 0,
            positive: BTreeMap::new(),
            negative: BTreeMap::new(),
        }
    }

    /// Ingest one sample. Non-finite values must be filtered by the caller.
    pub fn record(&mut self, value: f64) {
        debug_assert!(value.is_finite());
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);

        let magnitude = value.abs();
        if magnitude < f64::MIN_POSITIVE {
            self.zeros += 1;
            return;
        }
        let band = band_of(magnitude);
        let scaled = scale(magnitude, band).round() as u64;
        let bands = if value < 0.0 {
            &mut self.negative
        } else {
            &mut self.positive
        };
        if let Err(e) = bands.entry(band).or_insert_with(new_histogram).record(scaled) {
            tracing::warn!("Dropping trend sample {value}: {e:?}");
        }
    }

    pub fn merge(&mut self, other: &PercentileEstimator) {
        if other.count == 0 {
            return;
        }
        self.count += other.count;
        self.sum += other.sum;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.zeros += other.zeros;
        merge_bands(&mut self.positive, &other.positive);
        merge_bands(&mut self.negative, &other.negative);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn sum(&self) -> f64 {
        self.sum
    }

    pub fn min(&self) -> Option<f64> {
        (self.count > 0).then_some(self.min)
    }

    pub fn max(&self) -> Option<f64> {
        (self.count > 0).then_some(self.max)
    }

    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }

    pub fn median(&self) -> Option<f64> {
        self.percentile(50.0)
    }

    /// Value at percentile `p` (clamped to `[0, 100]`), or `None` if empty.
    ///
    /// Results are non-decreasing in `p` and always inside `[min, max]`.
    pub fn percentile(&self, p: f64) -> Option<f64> {
        if self.count == 0 || p.is_nan() {
            return None;
        }
        let p = p.clamp(0.0, 100.0);
        if p == 0.0 {
            return Some(self.min);
        }
        if p == 100.0 {
            return Some(self.max);
        }

        let rank = ((p / 100.0) * self.count as f64).ceil().max(1.0) as u64;
        Some(self.value_at_rank(rank.min(self.count)).clamp(self.min, self.max))
    }

    /// Representative of the `rank`-th smallest sample (1-based), walking
    /// negatives from the largest magnitude down, then zeros, then positives.
    fn value_at_rank(&self, mut rank: u64) -> f64 {
        for (&band, histogram) in self.negative.iter().rev() {
            let len = histogram.len();
            if rank <= len {
                // Ascending negative values are descending magnitudes.
                return -unscale(magnitude_at_rank(histogram, len - rank + 1), band);
            }
            rank -= len;
        }
        if rank <= self.zeros {
            return 0.0;
        }
        rank -= self.zeros;
        for (&band, histogram) in &self.positive {
            let len = histogram.len();
            if rank <= len {
                return unscale(magnitude_at_rank(histogram, rank), band);
            }
            rank -= len;
        }
        self.max
    }
}

impl Default for PercentileEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PercentileEstimator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PercentileEstimator")
            .field("count", &self.count)
            .field("sum", &self.sum)
            .field("min", &self.min())
            .field("max", &self.max())
            .field("bands", &(self.negative.len() + self.positive.len()))
            .finish_non_exhaustive()
    }
}

fn new_histogram() -> Histogram<u64> {
    // Auto-resizing histogram; only fails for more than 5 significant digits.
    Histogram::new(SIGNIFICANT_DIGITS).expect("3 significant digits is a valid histogram precision")
}

fn merge_bands(into: &mut BTreeMap<i32, Histogram<u64>>, from: &BTreeMap<i32, Histogram<u64>>) {
    for (&band, histogram) in from {
        if let Err(e) = into.entry(band).or_insert_with(new_histogram).add(histogram) {
            tracing::warn!("Dropping trend histogram data while merging: {e:?}");
        }
    }
}

/// Band of a normal, positive magnitude.
fn band_of(magnitude: f64) -> i32 {
    (magnitude.log2().floor() as i32).div_euclid(BAND_BITS)
}

/// Multiply by `2^exp` in two steps so that neither factor over- or
/// underflows; `exp` spans about +-1040 across all bands.
fn pow2_mul(value: f64, exp: i32) -> f64 {
    let half = exp / 2;
    value * 2f64.powi(half) * 2f64.powi(exp - half)
}

fn scale(magnitude: f64, band: i32) -> f64 {
    pow2_mul(magnitude, FLOOR_BITS - band * BAND_BITS)
}

fn unscale(scaled: u64, band: i32) -> f64 {
    pow2_mul(scaled as f64, band * BAND_BITS - FLOOR_BITS)
}

/// Representative magnitude of the `rank`-th smallest recorded value (1-based).
fn magnitude_at_rank(histogram: &Histogram<u64>, rank: u64) -> u64 {
    let mut seen = 0;
    for bucket in histogram.iter_recorded() {
        seen += bucket.count_at_value();
        if seen >= rank {
            return histogram.median_equivalent(bucket.value_iterated_to());
        }
    }
    histogram.max()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one_to_hundred() -> PercentileEstimator {
        let mut est = PercentileEstimator::new();
        for v in 1..=100 {
            est.record(v as f64);
        }
        est
    }

    fn within(actual: f64, expected: f64, relative: f64) -> bool {
        (actual - expected).abs() <= expected.abs() * relative
    }

    #[test]
    fn empty_has_no_statistics() {
        let est = PercentileEstimator::new();
        assert_eq!(est.count(), 0);
        assert_eq!(est.min(), None);
        assert_eq!(est.mean(), None);
        assert_eq!(est.percentile(50.0), None);
    }

    #[test]
    fn one_to_hundred_percentiles() {
        let est = one_to_hundred();
        assert_eq!(est.percentile(0.0), Some(1.0));
        assert_eq!(est.percentile(100.0), Some(100.0));
        assert!(within(est.percentile(50.0).unwrap(), 50.0, 0.01));
        assert!(within(est.percentile(95.0).unwrap(), 95.0, 0.01));
        assert!(within(est.percentile(99.0).unwrap(), 99.0, 0.01));
    }

    #[test]
    fn exact_moments() {
        let est = one_to_hundred();
        assert_eq!(est.count(), 100);
        assert_eq!(est.sum(), 5050.0);
        assert_eq!(est.mean(), Some(50.5));
        assert_eq!(est.min(), Some(1.0));
        assert_eq!(est.max(), Some(100.0));
    }

    #[test]
    fn percentiles_are_monotonic() {
        let mut est = PercentileEstimator::new();
        for i in 0..5_000u64 {
            est.record(((i * 7919) % 10_007) as f64 * 0.37);
        }
        let mut last = f64::NEG_INFINITY;
        for step in 0..=1_000 {
            let v = est.percentile(step as f64 / 10.0).unwrap();
            assert!(v >= last, "p({}) = {v} < {last}", step as f64 / 10.0);
            last = v;
        }
    }

    #[test]
    fn repeated_queries_are_identical() {
        let est = one_to_hundred();
        let first: Vec<_> = (0..=100).map(|p| est.percentile(p as f64)).collect();
        let second: Vec<_> = (0..=100).map(|p| est.percentile(p as f64)).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn handles_negative_samples() {
        let mut est = PercentileEstimator::new();
        for v in -50..=50 {
            est.record(v as f64);
        }
        assert_eq!(est.percentile(0.0), Some(-50.0));
        assert_eq!(est.percentile(100.0), Some(50.0));
        assert!(est.percentile(10.0).unwrap() < 0.0);
        assert!(est.percentile(90.0).unwrap() > 0.0);
        assert!(within(est.percentile(25.0).unwrap(), -25.0, 0.01));
    }

    #[test]
    fn merge_matches_single_stream() {
        let mut left = PercentileEstimator::new();
        let mut right = PercentileEstimator::new();
        for v in 1..=100 {
            if v % 2 == 0 {
                left.record(v as f64);
            } else {
                right.record(v as f64);
            }
        }
        left.merge(&right);
        let whole = one_to_hundred();
        assert_eq!(left.count(), whole.count());
        assert_eq!(left.sum(), whole.sum());
        for p in [1.0, 25.0, 50.0, 90.0, 99.9] {
            assert_eq!(left.percentile(p), whole.percentile(p));
        }
    }

    #[test]
    fn large_latencies_stay_within_bound() {
        let mut est = PercentileEstimator::new();
        for v in 1..=10_000 {
            est.record(v as f64 * 3.3);
        }
        assert!(within(est.percentile(95.0).unwrap(), 9_500.0 * 3.3, 0.01));
    }

    #[test]
    fn sub_millisecond_values_keep_their_resolution() {
        let mut est = PercentileEstimator::new();
        for k in 1..=100 {
            est.record(k as f64 * 1e-5);
        }
        assert!(within(est.percentile(50.0).unwrap(), 5e-4, 0.01));
        assert!(within(est.percentile(90.0).unwrap(), 9e-4, 0.01));
        assert!(within(est.percentile(1.0).unwrap(), 1e-5, 0.01));
    }

    #[test]
    fn huge_values_do_not_saturate() {
        let mut est = PercentileEstimator::new();
        for k in 1..=100 {
            est.record(k as f64 * 1e17);
        }
        assert!(within(est.percentile(50.0).unwrap(), 5e18, 0.01));
        assert!(within(est.percentile(99.0).unwrap(), 9.9e18, 0.01));
        assert_eq!(est.percentile(100.0), Some(1e19));
    }

    #[test]
    fn spans_the_whole_float_range() {
        let mut est = PercentileEstimator::new();
        for k in -300..=300 {
            est.record(10f64.powi(k));
            est.record(-(10f64.powi(k)));
        }
        est.record(0.0);
        est.record(1e-310);

        let mut last = f64::NEG_INFINITY;
        for step in 1..1_000 {
            let v = est.percentile(step as f64 / 10.0).unwrap();
            assert!(v >= last, "p({}) = {v} < {last}", step as f64 / 10.0);
            last = v;
        }
        // 601 negatives sort first, then the two zeros; 1.0 is rank 904.
        assert!(within(est.percentile(75.05).unwrap(), 1.0, 0.001));
        assert!(within(est.percentile(25.0).unwrap(), -1.0, 0.001));
        assert!(within(est.percentile(99.0).unwrap(), 1e288, 0.001));
        assert_eq!(est.percentile(0.0), Some(-(10f64.powi(300))));
        assert_eq!(est.percentile(100.0), Some(10f64.powi(300)));
    }

    #[test]
    fn zeros_sit_between_negatives_and_positives() {
        let mut est = PercentileEstimator::new();
        for v in [-2.0, 0.0, 0.0, 0.0, 3.0] {
            est.record(v);
        }
        assert!(within(est.percentile(20.0).unwrap(), -2.0, 0.001));
        assert_eq!(est.percentile(50.0), Some(0.0));
        assert_eq!(est.percentile(60.0), Some(0.0));
        assert!(within(est.percentile(90.0).unwrap(), 3.0, 0.001));
    }
}
