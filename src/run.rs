use std::{collections::BTreeMap, sync::Arc};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::{
    error::{ConfigError, Error, Result},
    executor::{ExecutionSummary, Executor, RampingVuExecutor},
    http::HttpClient,
    metric,
    report::MetricSummary,
    runner::IterationRunner,
    scenario::{Scenario, ScenarioConfig},
    store::{MetricStore, MetricsSnapshot},
    threshold::{ThresholdResult, ThresholdSet},
};

/// One load test: configuration, scenario, metrics and thresholds, ready to
/// run exactly once.
///
/// Everything that can be wrong with the definition (stages, metric kinds,
/// thresholds) is rejected by the constructors, before any VU exists.
pub struct TestRun<S, C, E = RampingVuExecutor> {
    config: ScenarioConfig,
    scenario: Arc<S>,
    runner: Arc<IterationRunner<S, C>>,
    executor: E,
    store: Arc<MetricStore>,
    thresholds: ThresholdSet,
    cancel: Arc<watch::Sender<bool>>,
}

impl<S: Scenario, C: HttpClient> TestRun<S, C> {
    pub fn new(config: ScenarioConfig, scenario: S, client: C) -> Result<Self, ConfigError> {
        let executor = RampingVuExecutor::from_config(&config)?;
        Self::with_executor(config, scenario, client, executor)
    }
}

impl<S, C, E> TestRun<S, C, E>
where
    S: Scenario,
    C: HttpClient,
    E: Executor,
{
    pub fn with_executor(
        config: ScenarioConfig,
        scenario: S,
        client: C,
        executor: E,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let store = Arc::new(MetricStore::new());
        let scenario = Arc::new(scenario);
        let runner = Arc::new(IterationRunner::new(
            Arc::clone(&scenario),
            client,
            Arc::clone(&store),
            &config,
        )?);

        for (name, kind) in &config.metrics {
            store.register(name, *kind)?;
        }
        for (name, kind) in scenario.metrics() {
            store.register(&name, kind)?;
        }
        let thresholds = ThresholdSet::build(&config.thresholds, &store)?;
        let (cancel, _) = watch::channel(false);

        Ok(Self {
            config,
            scenario,
            runner,
            executor,
            store,
            thresholds,
            cancel: Arc::new(cancel),
        })
    }

    pub fn config(&self) -> &ScenarioConfig {
        &self.config
    }

    /// The run's metric store, for scenarios that record outside of
    /// [`crate::runner::IterationContext`].
    pub fn store(&self) -> &Arc<MetricStore> {
        &self.store
    }

    pub fn thresholds(&self) -> &ThresholdSet {
        &self.thresholds
    }

    /// A handle that stops the run from another task.
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle(Arc::clone(&self.cancel))
    }

    /// Run `on_start`, drive the VUs, then finalize the metrics and evaluate
    /// thresholds. Per-request and per-iteration failures only show up in
    /// the result; the only error after construction is a failing `on_start`.
    pub async fn run(self) -> Result<TestResult> {
        let Self {
            config,
            scenario,
            runner,
            executor,
            store,
            thresholds,
            cancel,
        } = self;

        scenario
            .on_start(&runner.hook_context())
            .await
            .map_err(|e| Error::Setup(format!("{e:#}")))?;

        tracing::info!("Running scenario: {}!", config.name);
        let summary = executor.exec(Arc::clone(&runner), cancel.subscribe()).await;

        if summary.abandoned > 0 {
            tracing::warn!(
                "{} iterations were abandoned at the graceful stop deadline.",
                summary.abandoned
            );
        }
        tracing::info!("Processing results...");
        let snapshot = store.finalize(summary.elapsed);
        let results = thresholds.evaluate(&snapshot);
        let result = TestResult::new(&config.name, &snapshot, &summary, results, &thresholds.percentiles());

        for failed in result.failures() {
            tracing::warn!(
                "Threshold {} on {} failed (observed {:?})",
                failed.expression,
                failed.metric,
                failed.observed
            );
        }
        if result.partial {
            tracing::warn!("Scenario {} was cancelled, results are partial.", config.name);
        }

        scenario.on_finalize(&runner.hook_context(), &result).await;
        tracing::info!("Done running scenario: {}!", config.name);
        Ok(result)
    }
}

/// Cooperative cancellation for a [`TestRun`]. Cloneable; any clone cancels.
#[derive(Clone)]
pub struct CancelHandle(Arc<watch::Sender<bool>>);

impl CancelHandle {
    /// Stop spawning VUs and let in-flight iterations finish within the
    /// graceful stop period.
    pub fn cancel(&self) {
        if !self.0.send_replace(true) {
            tracing::info!("Cancellation requested.");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }
}

/// The immutable outcome of a run, handed to reporters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub scenario: String,
    /// Every threshold passed.
    pub passed: bool,
    /// The run was cancelled before the schedule completed.
    pub partial: bool,
    pub duration_ms: f64,
    pub iterations: u64,
    pub interrupted_iterations: u64,
    pub vus_max: usize,
    pub metrics: BTreeMap<String, MetricSummary>,
    pub thresholds: Vec<ThresholdResult>,
}

impl TestResult {
    pub fn new(
        scenario: &str,
        snapshot: &MetricsSnapshot,
        summary: &ExecutionSummary,
        thresholds: Vec<ThresholdResult>,
        extra_percentiles: &[f64],
    ) -> Self {
        let metrics = snapshot
            .iter()
            .map(|(name, aggregate)| {
                let summary = MetricSummary::new(aggregate, snapshot.elapsed(), extra_percentiles);
                (name.clone(), summary)
            })
            .collect();

        Self {
            scenario: scenario.to_string(),
            passed: thresholds.iter().all(|t| t.passed),
            partial: summary.cancelled,
            duration_ms: summary.elapsed.as_secs_f64() * 1_000.0,
            iterations: snapshot.counter_total(metric::ITERATIONS) as u64,
            interrupted_iterations: snapshot.counter_total(metric::INTERRUPTED_ITERATIONS) as u64,
            vus_max: summary.vus_max,
            metrics,
            thresholds,
        }
    }

    /// Results of failed thresholds.
    pub fn failures(&self) -> impl Iterator<Item = &ThresholdResult> {
        self.thresholds.iter().filter(|t| !t.passed)
    }
}
