//! Pass/fail predicates over finalized metric aggregates.
//!
//! A threshold expression has the form `<statistic> <operator> <number>`, with
//! or without spaces: `p(95)<500`, `p95 < 500`, `rate<0.1`, `count >= 100`.
//!
//! | statistic | counter | gauge | rate | trend |
//! |-----------|:-------:|:-----:|:----:|:-----:|
//! | `count`   | sum     |       |      | samples |
//! | `rate`    | per second | | true ratio | |
//! | `value`   |         | last  |      |       |
//! | `min`/`max` |       | yes   |      | yes   |
//! | `avg`/`med`/`p(N)` | |     |      | yes   |
//!
//! Thresholds are parsed and checked against the registered metric kinds
//! before a run starts, so a typo surfaces as a [`ConfigError`] instead of a
//! silent failure at the end of a long test.
use std::{collections::BTreeMap, fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{
    aggregate::MetricAggregate,
    error::ConfigError,
    metric::MetricKind,
    store::{MetricStore, MetricsSnapshot},
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Statistic {
    Count,
    Rate,
    Value,
    Avg,
    Min,
    Max,
    Med,
    Percentile(f64),
}

impl Statistic {
    pub fn supported_by(&self, kind: MetricKind) -> bool {
        use Statistic::*;
        match kind {
            MetricKind::Counter => matches!(self, Count | Rate),
            MetricKind::Gauge => matches!(self, Value | Min | Max),
            MetricKind::Rate => matches!(self, Rate),
            MetricKind::Trend => matches!(self, Count | Avg | Min | Max | Med | Percentile(_)),
        }
    }

    /// Value of this statistic for a finalized aggregate, if it has data.
    pub fn resolve(&self, aggregate: &MetricAggregate, snapshot: &MetricsSnapshot) -> Option<f64> {
        match (aggregate, self) {
            (MetricAggregate::Counter(c), Statistic::Count) => Some(c.sum),
            (MetricAggregate::Counter(c), Statistic::Rate) => {
                let secs = snapshot.elapsed().as_secs_f64();
                (secs > 0.0).then(|| c.sum / secs)
            }
            (MetricAggregate::Gauge(g), Statistic::Value) => g.value(),
            (MetricAggregate::Gauge(g), Statistic::Min) => g.min,
            (MetricAggregate::Gauge(g), Statistic::Max) => g.max,
            (MetricAggregate::Rate(r), Statistic::Rate) => r.rate(),
            (MetricAggregate::Trend(t), stat) => {
                let est = &t.estimator;
                match stat {
                    Statistic::Count => Some(est.count() as f64),
                    Statistic::Avg => est.mean(),
                    Statistic::Min => est.min(),
                    Statistic::Max => est.max(),
                    Statistic::Med => est.median(),
                    Statistic::Percentile(p) => est.percentile(*p),
                    Statistic::Rate | Statistic::Value => None,
                }
            }
            _ => None,
        }
    }
}

impl fmt::Display for Statistic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Statistic::Count => f.write_str("count"),
            Statistic::Rate => f.write_str("rate"),
            Statistic::Value => f.write_str("value"),
            Statistic::Avg => f.write_str("avg"),
            Statistic::Min => f.write_str("min"),
            Statistic::Max => f.write_str("max"),
            Statistic::Med => f.write_str("med"),
            Statistic::Percentile(p) => write!(f, "p({p})"),
        }
    }
}

impl FromStr for Statistic {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let stat = match s {
            "count" => Statistic::Count,
            "rate" => Statistic::Rate,
            "value" => Statistic::Value,
            "avg" => Statistic::Avg,
            "min" => Statistic::Min,
            "max" => Statistic::Max,
            "med" => Statistic::Med,
            _ => {
                let raw = s
                    .strip_prefix("p(")
                    .and_then(|rest| rest.strip_suffix(')'))
                    .or_else(|| s.strip_prefix('p'))
                    .ok_or_else(|| format!("unknown statistic `{s}`"))?;
                let p: f64 = raw
                    .parse()
                    .map_err(|_| format!("invalid percentile `{s}`"))?;
                if !(0.0..=100.0).contains(&p) {
                    return Err(format!("percentile `{s}` is outside 0..=100"));
                }
                Statistic::Percentile(p)
            }
        };
        Ok(stat)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl Comparison {
    // Two-character operators first so `<=` is not read as `<`.
    const TOKENS: [(&'static str, Comparison); 6] = [
        ("<=", Comparison::Le),
        (">=", Comparison::Ge),
        ("==", Comparison::Eq),
        ("!=", Comparison::Ne),
        ("<", Comparison::Lt),
        (">", Comparison::Gt),
    ];

    pub fn holds(&self, observed: f64, limit: f64) -> bool {
        match self {
            Comparison::Lt => observed < limit,
            Comparison::Le => observed <= limit,
            Comparison::Gt => observed > limit,
            Comparison::Ge => observed >= limit,
            Comparison::Eq => observed == limit,
            Comparison::Ne => observed != limit,
        }
    }
}

/// Parsed form of a threshold expression.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Condition {
    pub statistic: Statistic,
    pub comparison: Comparison,
    pub limit: f64,
}

impl FromStr for Condition {
    type Err = ConfigError;

    fn from_str(expression: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: String| ConfigError::InvalidThreshold {
            expression: expression.to_string(),
            reason,
        };
        let compact: String = expression.chars().filter(|c| !c.is_whitespace()).collect();

        let (at, token, comparison) = Comparison::TOKENS
            .iter()
            .filter_map(|(token, cmp)| compact.find(token).map(|at| (at, *token, *cmp)))
            .min_by_key(|(at, token, _)| (*at, std::cmp::Reverse(token.len())))
            .ok_or_else(|| invalid("missing comparison operator".into()))?;

        let statistic = compact[..at].parse::<Statistic>().map_err(invalid)?;
        let raw_limit = &compact[at + token.len()..];
        let limit: f64 = raw_limit
            .parse()
            .map_err(|_| invalid(format!("`{raw_limit}` is not a number")))?;
        if !limit.is_finite() {
            return Err(invalid(format!("`{raw_limit}` is not a finite number")));
        }

        Ok(Condition {
            statistic,
            comparison,
            limit,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Threshold {
    pub metric: String,
    pub expression: String,
    pub condition: Condition,
}

impl Threshold {
    pub fn parse(metric: impl Into<String>, expression: impl Into<String>) -> Result<Self, ConfigError> {
        let expression = expression.into();
        let condition = expression.parse()?;
        Ok(Self {
            metric: metric.into(),
            expression,
            condition,
        })
    }

    /// Check the metric exists and provides the statistic.
    pub fn validate(&self, store: &MetricStore) -> Result<(), ConfigError> {
        let kind = store
            .kind_of(&self.metric)
            .ok_or_else(|| ConfigError::UnknownMetric(self.metric.clone()))?;
        if self.condition.statistic.supported_by(kind) {
            Ok(())
        } else {
            Err(ConfigError::IncompatibleThreshold {
                metric: self.metric.clone(),
                expression: self.expression.clone(),
                statistic: self.condition.statistic.to_string(),
                kind,
            })
        }
    }

    /// Evaluate against a finalized snapshot.
    ///
    /// A metric that never received a sample has nothing to judge: the
    /// threshold passes with no observed value. Counters are the exception,
    /// since a count of zero is itself a meaningful observation.
    pub fn evaluate(&self, snapshot: &MetricsSnapshot) -> ThresholdResult {
        let observed = snapshot
            .get(&self.metric)
            .and_then(|agg| self.condition.statistic.resolve(agg, snapshot));
        let passed = observed.is_none_or(|v| self.condition.comparison.holds(v, self.condition.limit));
        ThresholdResult {
            metric: self.metric.clone(),
            expression: self.expression.clone(),
            passed,
            observed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdResult {
    pub metric: String,
    pub expression: String,
    pub passed: bool,
    pub observed: Option<f64>,
}

/// All thresholds of a run, validated up front.
#[derive(Debug, Clone, Default)]
pub struct ThresholdSet {
    thresholds: Vec<Threshold>,
}

impl ThresholdSet {
    /// Parse `metric -> [expressions]` and validate each against `store`.
    pub fn build(
        config: &BTreeMap<String, Vec<String>>,
        store: &MetricStore,
    ) -> Result<Self, ConfigError> {
        let mut thresholds = Vec::new();
        for (metric, expressions) in config {
            for expression in expressions {
                let threshold = Threshold::parse(metric.as_str(), expression.as_str())?;
                threshold.validate(store)?;
                thresholds.push(threshold);
            }
        }
        Ok(Self { thresholds })
    }

    pub fn iter(&self) -> impl Iterator<Item = &Threshold> {
        self.thresholds.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.thresholds.is_empty()
    }

    /// Percentiles referenced by trend thresholds, for report summaries.
    pub fn percentiles(&self) -> Vec<f64> {
        self.thresholds
            .iter()
            .filter_map(|t| match t.condition.statistic {
                Statistic::Percentile(p) => Some(p),
                _ => None,
            })
            .collect()
    }

    pub fn evaluate(&self, snapshot: &MetricsSnapshot) -> Vec<ThresholdResult> {
        self.thresholds.iter().map(|t| t.evaluate(snapshot)).collect()
    }
}
