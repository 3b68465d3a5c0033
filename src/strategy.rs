//! Endpoint-driven scenarios with a pluggable selection policy.
//!
//! An [`EndpointPlan`] lists the endpoints to hit and how each response is
//! judged. Which endpoint an iteration hits is decided by an
//! [`EndpointStrategy`]; the built-in policies are [`Sequential`],
//! [`UniformRandom`] and [`Weighted`].
use std::time::Duration;

use rand::{distributions::WeightedIndex, prelude::Distribution, Rng};
use serde::{Deserialize, Serialize};

use crate::{
    error::ConfigError,
    http::{HttpClient, Method, RequestSpec},
    metric::MetricKind,
    run::TestResult,
    runner::{HookContext, IterationContext},
    scenario::{Scenario, Target},
};

/// Where a VU is when it asks for its next endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    pub vu: u64,
    pub iteration: u64,
    /// Index of the request within the iteration.
    pub request: usize,
    /// Requests this VU issued before this one.
    pub sequence: u64,
}

/// Chooses the endpoint for the next request.
pub trait EndpointStrategy: Send + Sync {
    /// `endpoints` is never empty.
    fn next_endpoint<'a>(&self, endpoints: &'a [Endpoint], position: Position) -> &'a Endpoint;
}

/// Walks the endpoint list in order, wrapping around.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sequential;

impl EndpointStrategy for Sequential {
    fn next_endpoint<'a>(&self, endpoints: &'a [Endpoint], position: Position) -> &'a Endpoint {
        &endpoints[(position.sequence % endpoints.len() as u64) as usize]
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UniformRandom;

impl EndpointStrategy for UniformRandom {
    fn next_endpoint<'a>(&self, endpoints: &'a [Endpoint], _: Position) -> &'a Endpoint {
        &endpoints[rand::thread_rng().gen_range(0..endpoints.len())]
    }
}

/// Picks endpoints with probability proportional to their `weight`.
#[derive(Debug, Clone)]
pub struct Weighted {
    index: WeightedIndex<u32>,
}

impl Weighted {
    pub fn new(endpoints: &[Endpoint]) -> Result<Self, ConfigError> {
        let index = WeightedIndex::new(endpoints.iter().map(|e| e.weight)).map_err(|e| {
            ConfigError::InvalidOption {
                name: "weight",
                reason: e.to_string(),
            }
        })?;
        Ok(Self { index })
    }
}

impl EndpointStrategy for Weighted {
    fn next_endpoint<'a>(&self, endpoints: &'a [Endpoint], _: Position) -> &'a Endpoint {
        let i = self.index.sample(&mut rand::thread_rng());
        &endpoints[i.min(endpoints.len() - 1)]
    }
}

/// Built-in selection policies, as written in scenario files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Selection {
    #[default]
    Sequential,
    Uniform,
    Weighted,
}

impl Selection {
    pub fn strategy(&self, endpoints: &[Endpoint]) -> Result<Box<dyn EndpointStrategy>, ConfigError> {
        Ok(match self {
            Selection::Sequential => Box::new(Sequential),
            Selection::Uniform => Box::new(UniformRandom),
            Selection::Weighted => Box::new(Weighted::new(endpoints)?),
        })
    }
}

/// Which statuses count as a good response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusRule {
    Exactly(Vec<u16>),
    /// Any status strictly below the limit.
    Below(u16),
}

impl Default for StatusRule {
    fn default() -> Self {
        StatusRule::Exactly(vec![200])
    }
}

impl StatusRule {
    pub fn accepts(&self, status: u16) -> bool {
        match self {
            StatusRule::Exactly(allowed) => allowed.contains(&status),
            StatusRule::Below(limit) => status != 0 && status < *limit,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Endpoint {
    /// Prefix of the check names recorded for this endpoint.
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub method: Method,
    /// `Host` header for this endpoint. `{host}` is replaced by the target host.
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub accept: StatusRule,
    /// Latency budget; adds a "response time acceptable" check when set.
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub max_duration: Option<Duration>,
    #[serde(default = "default_weight")]
    pub weight: u32,
    /// Whether the outcome feeds the plan's error and latency metrics.
    #[serde(default = "default_tracked")]
    pub tracked: bool,
}

fn default_weight() -> u32 {
    1
}

fn default_tracked() -> bool {
    true
}

impl Endpoint {
    pub fn request(&self, target: &Target) -> RequestSpec {
        let spec = RequestSpec::new(self.method, self.path.clone());
        match (&self.host, &target.host) {
            (Some(template), Some(host)) => spec.header("Host", template.replace("{host}", host)),
            (Some(template), None) if !template.contains("{host}") => {
                spec.header("Host", template.clone())
            }
            _ => spec,
        }
    }
}

/// The endpoints an [`EndpointScenario`] requests and the metrics it keeps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EndpointPlan {
    pub endpoints: Vec<Endpoint>,
    #[serde(default)]
    pub selection: Selection,
    #[serde(default = "default_requests")]
    pub requests_per_iteration: usize,
    /// Rate metric, `true` when a tracked request failed one of its checks.
    #[serde(default)]
    pub error_metric: Option<String>,
    /// Trend metric of tracked request durations in milliseconds.
    #[serde(default)]
    pub latency_metric: Option<String>,
    /// Counter incremented once per iteration.
    #[serde(default)]
    pub iteration_counter: Option<String>,
    /// Path requested before the run; a 5xx or error aborts the run.
    #[serde(default)]
    pub warmup: Option<String>,
    /// Path requested after the run to report whether the target recovered.
    #[serde(default)]
    pub final_check: Option<String>,
}

fn default_requests() -> usize {
    1
}

impl EndpointPlan {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |name, reason: &str| {
            Err(ConfigError::InvalidOption {
                name,
                reason: reason.to_string(),
            })
        };
        if self.endpoints.is_empty() {
            return invalid("endpoints", "at least one endpoint is required");
        }
        if self.requests_per_iteration == 0 {
            return invalid("requests_per_iteration", "must be at least 1");
        }
        if let Some(e) = self
            .endpoints
            .iter()
            .find(|e| matches!(&e.accept, StatusRule::Exactly(s) if s.is_empty()))
        {
            return invalid("accept", &format!("endpoint `{}` accepts no status", e.name));
        }
        if self.selection == Selection::Weighted {
            Weighted::new(&self.endpoints)?;
        }
        Ok(())
    }

    fn metrics(&self) -> Vec<(String, MetricKind)> {
        [
            (&self.error_metric, MetricKind::Rate),
            (&self.latency_metric, MetricKind::Trend),
            (&self.iteration_counter, MetricKind::Counter),
        ]
        .into_iter()
        .filter_map(|(name, kind)| name.clone().map(|n| (n, kind)))
        .collect()
    }
}

/// [`Scenario`] that issues `requests_per_iteration` requests per iteration
/// against endpoints chosen by an [`EndpointStrategy`].
///
/// Every request records a "`<name>` responds" check and, when the endpoint
/// has a latency budget, a "`<name>` response time acceptable" check.
pub struct EndpointScenario {
    plan: EndpointPlan,
    strategy: Box<dyn EndpointStrategy>,
}

impl EndpointScenario {
    pub fn new(plan: EndpointPlan) -> Result<Self, ConfigError> {
        plan.validate()?;
        let strategy = plan.selection.strategy(&plan.endpoints)?;
        Ok(Self { plan, strategy })
    }

    /// Use a custom selection policy instead of `plan.selection`.
    pub fn with_strategy(
        plan: EndpointPlan,
        strategy: impl EndpointStrategy + 'static,
    ) -> Result<Self, ConfigError> {
        plan.validate()?;
        Ok(Self {
            plan,
            strategy: Box::new(strategy),
        })
    }

    pub fn plan(&self) -> &EndpointPlan {
        &self.plan
    }
}

impl Scenario for EndpointScenario {
    fn metrics(&self) -> Vec<(String, MetricKind)> {
        self.plan.metrics()
    }

    async fn iteration<C: HttpClient>(&self, ctx: &mut IterationContext<'_, C>) -> anyhow::Result<()> {
        if let Some(counter) = &self.plan.iteration_counter {
            ctx.add(counter, MetricKind::Counter, 1.0)?;
        }

        let per_iteration = self.plan.requests_per_iteration;
        for request in 0..per_iteration {
            let position = Position {
                vu: ctx.vu_id(),
                iteration: ctx.iteration(),
                request,
                sequence: ctx.iteration() * per_iteration as u64 + request as u64,
            };
            let endpoint = self.strategy.next_endpoint(&self.plan.endpoints, position);
            let spec = endpoint.request(ctx.target());
            let outcome = ctx.request(spec).await;

            let responds = outcome.error.is_none() && endpoint.accept.accepts(outcome.status);
            let mut ok = ctx.check(&format!("{} responds", endpoint.name), responds);
            if let Some(budget) = endpoint.max_duration {
                let fast = outcome.duration < budget;
                ok &= ctx.check(&format!("{} response time acceptable", endpoint.name), fast);
            }

            if !endpoint.tracked {
                continue;
            }
            if let Some(metric) = &self.plan.error_metric {
                ctx.add(metric, MetricKind::Rate, if ok { 0.0 } else { 1.0 })?;
            }
            if let Some(metric) = &self.plan.latency_metric {
                ctx.add(
                    metric,
                    MetricKind::Trend,
                    outcome.duration.as_secs_f64() * 1_000.0,
                )?;
            }
        }
        Ok(())
    }

    async fn on_start<C: HttpClient>(&self, ctx: &HookContext<'_, C>) -> anyhow::Result<()> {
        let Some(path) = &self.plan.warmup else {
            return Ok(());
        };
        tracing::info!("Target URL: {}", ctx.target().base_url);
        if let Some(host) = &ctx.target().host {
            tracing::info!("Target host: {host}");
        }
        let outcome = ctx.request(RequestSpec::get(path.as_str())).await;
        match (&outcome.error, outcome.status) {
            (Some(e), _) => anyhow::bail!("warmup request to {path} failed: {e}"),
            (None, status) if status >= 500 => {
                anyhow::bail!("warmup request to {path} returned {status}, the target appears to be down")
            }
            _ => Ok(()),
        }
    }

    async fn on_finalize<C: HttpClient>(&self, ctx: &HookContext<'_, C>, _result: &TestResult) {
        let Some(path) = &self.plan.final_check else {
            return;
        };
        let outcome = ctx.request(RequestSpec::get(path.as_str())).await;
        if outcome.error.is_some() || outcome.status >= 500 {
            tracing::warn!("Target may be degraded after the run: {path} answered {}", outcome.status);
        } else {
            tracing::info!("Target recovered after the run: {path} answered {}", outcome.status);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoints(n: usize) -> Vec<Endpoint> {
        (0..n)
            .map(|i| Endpoint {
                name: format!("e{i}"),
                path: format!("/{i}"),
                method: Method::Get,
                host: None,
                accept: StatusRule::default(),
                max_duration: None,
                weight: 1,
                tracked: true,
            })
            .collect()
    }

    fn at(sequence: u64) -> Position {
        Position {
            vu: 0,
            iteration: 0,
            request: 0,
            sequence,
        }
    }

    fn plan(endpoints: Vec<Endpoint>) -> EndpointPlan {
        EndpointPlan {
            endpoints,
            selection: Selection::Sequential,
            requests_per_iteration: 1,
            error_metric: None,
            latency_metric: None,
            iteration_counter: None,
            warmup: None,
            final_check: None,
        }
    }

    #[test]
    fn sequential_wraps_around() {
        let list = endpoints(3);
        let names: Vec<&str> = (0..7)
            .map(|s| Sequential.next_endpoint(&list, at(s)).name.as_str())
            .collect();
        assert_eq!(names, ["e0", "e1", "e2", "e0", "e1", "e2", "e0"]);
    }

    #[test]
    fn uniform_hits_every_endpoint() {
        let list = endpoints(4);
        let mut seen = [0usize; 4];
        for s in 0..2_000 {
            let e = UniformRandom.next_endpoint(&list, at(s));
            seen[list.iter().position(|x| x == e).unwrap()] += 1;
        }
        assert!(seen.iter().all(|&n| n > 300), "{seen:?}");
    }

    #[test]
    fn weighted_skips_zero_weights() {
        let mut list = endpoints(3);
        list[0].weight = 0;
        list[1].weight = 3;
        list[2].weight = 1;
        let weighted = Weighted::new(&list).unwrap();
        let mut seen = [0usize; 3];
        for s in 0..4_000 {
            let e = weighted.next_endpoint(&list, at(s));
            seen[list.iter().position(|x| x == e).unwrap()] += 1;
        }
        assert_eq!(seen[0], 0);
        assert!(seen[1] > seen[2] * 2, "{seen:?}");
    }

    #[test]
    fn all_zero_weights_are_rejected() {
        let mut list = endpoints(2);
        list.iter_mut().for_each(|e| e.weight = 0);
        assert!(Weighted::new(&list).is_err());
    }

    #[test]
    fn status_rules() {
        assert!(StatusRule::default().accepts(200));
        assert!(!StatusRule::default().accepts(404));
        assert!(StatusRule::Exactly(vec![200, 404]).accepts(404));
        assert!(StatusRule::Below(500).accepts(404));
        assert!(!StatusRule::Below(500).accepts(503));
        assert!(!StatusRule::Below(500).accepts(0));
    }

    #[test]
    fn host_templates() {
        let target = Target::new("http://localhost:8080").with_host("ml-platform.local");
        let mut endpoint = endpoints(1).remove(0);
        endpoint.host = Some("api.{host}".into());
        assert_eq!(
            endpoint.request(&target).headers,
            vec![("Host".to_string(), "api.ml-platform.local".to_string())]
        );
        assert!(endpoint.request(&Target::new("http://x")).headers.is_empty());
    }

    #[test]
    fn plan_validation() {
        assert!(plan(endpoints(2)).validate().is_ok());
        assert!(plan(vec![]).validate().is_err());

        let mut zero = plan(endpoints(1));
        zero.requests_per_iteration = 0;
        assert!(zero.validate().is_err());

        let mut empty_accept = plan(endpoints(1));
        empty_accept.endpoints[0].accept = StatusRule::Exactly(vec![]);
        assert!(empty_accept.validate().is_err());
    }

    #[test]
    fn declares_its_custom_metrics() {
        let mut p = plan(endpoints(1));
        p.error_metric = Some("errors".into());
        p.latency_metric = Some("response_time".into());
        let scenario = EndpointScenario::new(p).unwrap();
        assert_eq!(
            scenario.metrics(),
            vec![
                ("errors".to_string(), MetricKind::Rate),
                ("response_time".to_string(), MetricKind::Trend),
            ]
        );
    }

    #[test]
    fn plan_from_json() {
        let plan: EndpointPlan = serde_json::from_str(
            r#"{
                "endpoints": [
                    { "name": "frontend", "path": "/", "max_duration": "1s" },
                    { "name": "api", "path": "/api/health", "host": "api.{host}", "accept": { "below": 500 }, "weight": 3 }
                ],
                "selection": "weighted",
                "error_metric": "errors"
            }"#,
        )
        .unwrap();
        assert_eq!(plan.endpoints[0].max_duration, Some(Duration::from_secs(1)));
        assert_eq!(plan.endpoints[1].accept, StatusRule::Below(500));
        assert_eq!(plan.selection, Selection::Weighted);
        assert!(plan.validate().is_ok());
    }
}
