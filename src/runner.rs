use std::{any::Any, panic::AssertUnwindSafe, sync::Arc, time::Duration};

use futures::FutureExt;
use tokio::time::Instant;

use crate::{
    error::{ConfigError, RecordError, RequestError},
    http::{HttpClient, HttpRequest, RequestOutcome, RequestSpec},
    metric::{BuiltinMetrics, MetricKind},
    scenario::{Scenario, ScenarioConfig, Target, ThinkTime},
    store::MetricStore,
};

/// How one iteration ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationStatus {
    Completed,
    /// The scenario returned an error.
    Failed,
    Panicked,
}

/// Runs scenario iterations for every VU of a run and feeds their outcomes
/// into the [`MetricStore`].
///
/// Shared by all VUs behind an `Arc`; the only mutable state it reaches is the
/// store.
pub struct IterationRunner<S, C> {
    scenario: Arc<S>,
    client: C,
    store: Arc<MetricStore>,
    metrics: BuiltinMetrics,
    target: Target,
    request_timeout: Duration,
    think_time: ThinkTime,
}

impl<S: Scenario, C: HttpClient> IterationRunner<S, C> {
    /// Registers the built-in metrics in `store`.
    pub fn new(
        scenario: Arc<S>,
        client: C,
        store: Arc<MetricStore>,
        config: &ScenarioConfig,
    ) -> Result<Self, ConfigError> {
        let metrics = BuiltinMetrics::register(&store)?;
        Ok(Self {
            scenario,
            client,
            store,
            metrics,
            target: config.target.clone(),
            request_timeout: config.request_timeout,
            think_time: config.think_time,
        })
    }

    pub fn store(&self) -> &Arc<MetricStore> {
        &self.store
    }

    pub fn metrics(&self) -> &BuiltinMetrics {
        &self.metrics
    }

    /// Sampled once per iteration.
    pub fn think_time(&self) -> Duration {
        self.think_time.sample()
    }

    /// Request access for lifecycle hooks. Nothing issued through it is
    /// recorded.
    pub fn hook_context(&self) -> HookContext<'_, C> {
        HookContext {
            client: &self.client,
            target: &self.target,
            request_timeout: self.request_timeout,
        }
    }

    /// Execute one iteration of the scenario for VU `vu`.
    ///
    /// Errors and panics from the scenario are absorbed: they count as a
    /// failed check and the VU carries on. If the returned future is dropped
    /// before completion (the VU was abandoned), the iteration is counted in
    /// `interrupted_iterations` and as a failed check.
    pub async fn run_iteration(&self, vu: u64, iteration: u64) -> IterationStatus {
        let mut guard = InFlight {
            metrics: &self.metrics,
            armed: true,
        };
        let started = Instant::now();
        let mut ctx = IterationContext {
            vu,
            iteration,
            client: &self.client,
            store: &self.store,
            metrics: &self.metrics,
            target: &self.target,
            request_timeout: self.request_timeout,
            failed_checks: 0,
        };

        let result = AssertUnwindSafe(self.scenario.iteration(&mut ctx))
            .catch_unwind()
            .await;
        guard.armed = false;

        self.metrics.iterations.increment();
        self.metrics.iteration_duration.add_duration(started.elapsed());

        match result {
            Ok(Ok(())) => IterationStatus::Completed,
            Ok(Err(e)) => {
                tracing::debug!("VU {vu} iteration {iteration} failed: {e:#}");
                self.metrics.checks.add(false);
                IterationStatus::Failed
            }
            Err(payload) => {
                tracing::warn!(
                    "VU {vu} iteration {iteration} panicked: {}",
                    panic_message(payload.as_ref())
                );
                self.metrics.checks.add(false);
                IterationStatus::Panicked
            }
        }
    }
}

/// Records an interrupted iteration if dropped while armed.
struct InFlight<'a> {
    metrics: &'a BuiltinMetrics,
    armed: bool,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.metrics.interrupted_iterations.increment();
            self.metrics.checks.add(false);
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

/// Handle given to [`Scenario::iteration`] for the duration of one iteration.
pub struct IterationContext<'a, C> {
    vu: u64,
    iteration: u64,
    client: &'a C,
    store: &'a MetricStore,
    metrics: &'a BuiltinMetrics,
    target: &'a Target,
    request_timeout: Duration,
    failed_checks: usize,
}

impl<C: HttpClient> IterationContext<'_, C> {
    pub fn vu_id(&self) -> u64 {
        self.vu
    }

    /// Zero-based iteration number of this VU.
    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    pub fn target(&self) -> &Target {
        self.target
    }

    /// Issue a request and record `http_reqs`, `http_req_duration` and
    /// `http_req_failed`. Failures are returned in the outcome, never raised.
    pub async fn request(&mut self, spec: RequestSpec) -> RequestOutcome {
        let outcome = send(self.client, self.target, self.request_timeout, spec).await;

        self.metrics.http_reqs.increment();
        self.metrics.http_req_duration.add_duration(outcome.duration);
        self.metrics.http_req_failed.add(!outcome.is_success());
        outcome
    }

    /// Record a check outcome into `checks` and return it.
    pub fn check(&mut self, name: &str, passed: bool) -> bool {
        self.metrics.checks.add(passed);
        if !passed {
            self.failed_checks += 1;
            tracing::trace!("VU {} check failed: {name}", self.vu);
        }
        passed
    }

    /// Checks failed so far in this iteration.
    pub fn failed_checks(&self) -> usize {
        self.failed_checks
    }

    /// Record a sample for a custom metric.
    pub fn add(&self, name: &str, kind: MetricKind, value: f64) -> Result<(), RecordError> {
        self.store.add(name, kind, value)
    }

    pub fn store(&self) -> &MetricStore {
        self.store
    }
}

/// Request access for [`Scenario::on_start`] and [`Scenario::on_finalize`].
pub struct HookContext<'a, C> {
    client: &'a C,
    target: &'a Target,
    request_timeout: Duration,
}

impl<C: HttpClient> HookContext<'_, C> {
    pub fn target(&self) -> &Target {
        self.target
    }

    pub async fn request(&self, spec: RequestSpec) -> RequestOutcome {
        send(self.client, self.target, self.request_timeout, spec).await
    }
}

async fn send<C: HttpClient>(
    client: &C,
    target: &Target,
    default_timeout: Duration,
    spec: RequestSpec,
) -> RequestOutcome {
    let timeout = spec.timeout.unwrap_or(default_timeout);
    let request = HttpRequest {
        method: spec.method,
        url: target.resolve(&spec.url),
        headers: target.headers_for(spec.headers),
        body: spec.body,
        timeout,
    };

    let started = Instant::now();
    let result = tokio::time::timeout(timeout, client.do_request(&request)).await;
    let (status, duration, error) = match result {
        Ok(Ok(response)) => (response.status, response.duration, None),
        Ok(Err(e)) => (0, started.elapsed(), Some(e)),
        Err(_) => (0, started.elapsed(), Some(RequestError::Timeout(timeout))),
    };
    if let Some(e) = &error {
        tracing::debug!("{} {} failed: {e}", request.method.as_str(), request.url);
    }
    RequestOutcome {
        status,
        duration,
        error,
    }
}
