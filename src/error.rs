use std::time::Duration;

use serde::{Serialize, Serializer};
use thiserror::Error;

use crate::metric::MetricKind;

/// Problems with the test definition. Always raised before any VU starts.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("the stage list is empty")]
    EmptySchedule,

    #[error("the stages add up to a zero-length schedule")]
    ZeroDuration,

    /// A metric name was registered twice with different kinds.
    #[error("metric `{name}` is already a {existing}, it cannot be registered as a {requested}")]
    KindConflict {
        name: String,
        existing: MetricKind,
        requested: MetricKind,
    },

    #[error("threshold references unknown metric `{0}`")]
    UnknownMetric(String),

    #[error("invalid threshold `{expression}`: {reason}")]
    InvalidThreshold { expression: String, reason: String },

    /// The statistic used by a threshold does not exist for the metric kind.
    #[error("threshold `{expression}` on `{metric}` uses `{statistic}`, which a {kind} does not provide")]
    IncompatibleThreshold {
        metric: String,
        expression: String,
        statistic: String,
        kind: MetricKind,
    },

    #[error("invalid option `{name}`: {reason}")]
    InvalidOption { name: &'static str, reason: String },
}

/// A sample that could not be recorded.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RecordError {
    #[error("metric `{name}` is a {existing}, got a {requested} sample")]
    KindMismatch {
        name: String,
        existing: MetricKind,
        requested: MetricKind,
    },

    #[error("metric `{0}` got a non-finite sample")]
    NonFinite(String),

    /// Counters only ever go up.
    #[error("counter `{0}` got a negative sample")]
    NegativeCounter(String),
}

/// Failure of a single request. Recorded as a failed sample, never fatal.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RequestError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("{0}")]
    Transport(String),
}

impl Serialize for RequestError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Record(#[from] RecordError),

    #[error("on_start hook failed: {0}")]
    Setup(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
