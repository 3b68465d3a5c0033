use std::{
    collections::BTreeMap,
    fmt,
    future::Future,
    path::PathBuf,
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{aggregate::MetricAggregate, error::Result, metric, run::TestResult};

/// Percentiles every trend summary carries.
pub const SUMMARY_PERCENTILES: [f64; 3] = [90.0, 95.0, 99.0];

/// Derived statistics of one metric, as published in a [`TestResult`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MetricSummary {
    Counter {
        count: f64,
        /// Per second of run time.
        rate: f64,
    },
    Gauge {
        value: Option<f64>,
        min: Option<f64>,
        max: Option<f64>,
    },
    Rate {
        rate: Option<f64>,
        passes: u64,
        fails: u64,
    },
    Trend(TrendSummary),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendSummary {
    pub count: u64,
    pub avg: Option<f64>,
    pub min: Option<f64>,
    pub med: Option<f64>,
    pub max: Option<f64>,
    /// Keyed `p(N)`.
    pub percentiles: BTreeMap<String, f64>,
}

impl TrendSummary {
    pub fn percentile(&self, p: f64) -> Option<f64> {
        self.percentiles.get(&format!("p({p})")).copied()
    }
}

impl MetricSummary {
    /// Summarize a finalized aggregate. `extra_percentiles` are added to the
    /// default p(90), p(95) and p(99) of trends.
    pub fn new(aggregate: &MetricAggregate, elapsed: Duration, extra_percentiles: &[f64]) -> Self {
        match aggregate {
            MetricAggregate::Counter(c) => {
                let secs = elapsed.as_secs_f64();
                MetricSummary::Counter {
                    count: c.sum,
                    rate: if secs > 0.0 { c.sum / secs } else { 0.0 },
                }
            }
            MetricAggregate::Gauge(g) => MetricSummary::Gauge {
                value: g.value(),
                min: g.min,
                max: g.max,
            },
            MetricAggregate::Rate(r) => MetricSummary::Rate {
                rate: r.rate(),
                passes: r.passes,
                fails: r.fails(),
            },
            MetricAggregate::Trend(t) => {
                let est = &t.estimator;
                let percentiles = SUMMARY_PERCENTILES
                    .iter()
                    .chain(extra_percentiles)
                    .filter_map(|&p| est.percentile(p).map(|v| (format!("p({p})"), v)))
                    .collect();
                MetricSummary::Trend(TrendSummary {
                    count: est.count(),
                    avg: est.mean(),
                    min: est.min(),
                    med: est.median(),
                    max: est.max(),
                    percentiles,
                })
            }
        }
    }
}

/// Sends a finished [`TestResult`] somewhere (stdout, a file, a database).
pub trait Reporter {
    fn report(&self, result: &TestResult) -> impl Future<Output = Result<()>> + Send;
}

/// Prints the human-readable [`Summary`].
pub struct StdoutReporter;

impl Reporter for StdoutReporter {
    async fn report(&self, result: &TestResult) -> Result<()> {
        println!("{}", Summary(result));
        Ok(())
    }
}

/// Writes the full result as pretty-printed JSON.
pub struct JsonReporter {
    path: PathBuf,
}

impl JsonReporter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Reporter for JsonReporter {
    async fn report(&self, result: &TestResult) -> Result<()> {
        let body = serde_json::to_vec_pretty(result)?;
        tokio::fs::write(&self.path, body).await?;
        tracing::info!("Wrote results to {}", self.path.display());
        Ok(())
    }
}

/// Plain-text rendering of a [`TestResult`].
pub struct Summary<'a>(pub &'a TestResult);

fn ms(v: Option<f64>) -> String {
    v.map_or_else(|| "-".to_string(), |v| format!("{v:.2}ms"))
}

fn percent(v: Option<f64>) -> String {
    v.map_or_else(|| "-".to_string(), |v| format!("{:.2}%", v * 100.0))
}

impl fmt::Display for Summary<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let result = self.0;
        let title = format!("Performance Test Summary: {}", result.scenario);
        writeln!(f, "{title}")?;
        writeln!(f, "{}", "=".repeat(title.len()))?;
        if result.partial {
            writeln!(f, "(cancelled, partial results)")?;
        }
        writeln!(f)?;

        writeln!(
            f,
            "Duration: {:.1}s, iterations: {} ({} interrupted), max VUs: {}",
            result.duration_ms / 1_000.0,
            result.iterations,
            result.interrupted_iterations,
            result.vus_max
        )?;
        writeln!(f)?;

        if let Some(MetricSummary::Counter { count, rate }) = result.metrics.get(metric::HTTP_REQS) {
            writeln!(f, "Requests:")?;
            writeln!(f, "  Total: {count}")?;
            if let Some(MetricSummary::Rate { rate: failed, .. }) =
                result.metrics.get(metric::HTTP_REQ_FAILED)
            {
                writeln!(f, "  Failed: {}", percent(*failed))?;
            }
            writeln!(f, "  Rate: {rate:.2}/sec")?;
            writeln!(f)?;
        }

        if let Some(MetricSummary::Trend(t)) = result.metrics.get(metric::HTTP_REQ_DURATION) {
            writeln!(f, "Response Times:")?;
            writeln!(f, "  Average: {}", ms(t.avg))?;
            writeln!(f, "  95th percentile: {}", ms(t.percentile(95.0)))?;
            writeln!(f, "  Max: {}", ms(t.max))?;
            writeln!(f)?;
        }

        writeln!(f, "Metrics:")?;
        for (name, summary) in &result.metrics {
            match summary {
                MetricSummary::Counter { count, rate } => {
                    writeln!(f, "  {name}: {count} ({rate:.2}/s)")?
                }
                MetricSummary::Gauge { value, min, max } => writeln!(
                    f,
                    "  {name}: {} (min {}, max {})",
                    fmt_opt(*value),
                    fmt_opt(*min),
                    fmt_opt(*max)
                )?,
                MetricSummary::Rate {
                    rate,
                    passes,
                    fails,
                } => writeln!(f, "  {name}: {} ({passes} true, {fails} false)", percent(*rate))?,
                MetricSummary::Trend(t) => {
                    write!(
                        f,
                        "  {name}: avg={} min={} med={} max={}",
                        fmt_opt(t.avg),
                        fmt_opt(t.min),
                        fmt_opt(t.med),
                        fmt_opt(t.max)
                    )?;
                    for (key, value) in &t.percentiles {
                        write!(f, " {key}={value:.2}")?;
                    }
                    writeln!(f)?;
                }
            }
        }
        writeln!(f)?;

        writeln!(f, "Thresholds:")?;
        if result.thresholds.is_empty() {
            writeln!(f, "  (none)")?;
        }
        for t in &result.thresholds {
            let mark = if t.passed { "✓" } else { "✗" };
            writeln!(
                f,
                "  {mark} {} {} (observed {})",
                t.metric,
                t.expression,
                fmt_opt(t.observed)
            )?;
        }
        Ok(())
    }
}

fn fmt_opt(v: Option<f64>) -> String {
    v.map_or_else(|| "-".to_string(), |v| format!("{v:.2}"))
}
