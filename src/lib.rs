//! Volley: a staged virtual-user load generator for HTTP services.
//!
//! A run spins a pool of virtual users (VUs) up and down along a list of
//! stages, each VU looping over a [`Scenario`] iteration. Every request,
//! check and custom value lands in a concurrent [`MetricStore`]; at the end the
//! store is finalized into a [`TestResult`] and checked against pass/fail
//! thresholds.
//!
//! # Architecture
//!
//! The main building blocks are:
//!
//! - [`Scenario`]: the per-iteration request logic plus the `on_start` and
//!   `on_finalize` lifecycle hooks. [`EndpointScenario`] is the built-in,
//!   data-driven implementation.
//! - [`Executor`]: drives the VUs. The provided [`RampingVuExecutor`] follows a
//!   [`ScheduleCurve`] that linearly interpolates between stage targets.
//! - [`IterationRunner`]: runs one iteration for one VU, timing it, recording
//!   the built-in metrics and isolating failures and panics.
//! - [`MetricStore`]: named counter, gauge, rate and trend metrics, written
//!   concurrently by every VU and folded into [`Aggregate`]s.
//! - [`PercentileEstimator`]: the bounded-memory percentile sketch behind trends.
//! - [`ThresholdSet`]: `p(95)<500` style expressions evaluated against the
//!   finalized metrics.
//! - [`Reporter`]: sends a [`TestResult`] somewhere (stdout, a JSON file).
//!
//! # Example
//!
//! ```rust,ignore
//! use volley::{Profile, ReqwestClient, EndpointScenario, StdoutReporter, Reporter, TestRun};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let file = Profile::Basic.scenario("http://localhost:8080", "ml-platform.local");
//!     let scenario = EndpointScenario::new(file.plan)?;
//!     let run = TestRun::new(file.scenario, scenario, ReqwestClient::new())?;
//!
//!     let result = run.run().await?;
//!     StdoutReporter.report(&result).await?;
//!     Ok(())
//! }
//! ```

/// Metric aggregators
pub mod aggregate;
/// Scenario files and built-in profiles
pub mod config;
pub mod error;
/// Orchestrators that define how VUs are scheduled
pub mod executor;
/// HTTP client boundary
pub mod http;
pub mod metric;
/// Result summaries and reporters
pub mod report;
/// Glue that ties a scenario, an executor and the metrics together
pub mod run;
pub mod runner;
pub mod scenario;
/// Concurrent metric registry
pub mod store;
/// Endpoint selection and the data-driven endpoint scenario
pub mod strategy;
pub mod threshold;
pub mod trend;

pub use aggregate::Aggregate;
pub use config::{Profile, ScenarioFile};
pub use error::{ConfigError, Error, RecordError, RequestError, Result};
pub use executor::{Executor, RampingVuExecutor, ScheduleCurve, Stage};
pub use http::{HttpClient, Method, ReqwestClient, RequestOutcome, RequestSpec};
pub use metric::{MetricKind, Sample};
pub use report::{JsonReporter, MetricSummary, Reporter, StdoutReporter};
pub use run::{CancelHandle, TestResult, TestRun};
pub use runner::{HookContext, IterationContext, IterationRunner};
pub use scenario::{Scenario, ScenarioConfig, Target, ThinkTime};
pub use store::{MetricStore, MetricsSnapshot};
pub use strategy::{Endpoint, EndpointPlan, EndpointScenario};
pub use threshold::{Threshold, ThresholdResult, ThresholdSet};
pub use trend::PercentileEstimator;
