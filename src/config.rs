//! Scenario files and the built-in load profiles.
//!
//! Durations in scenario files use `humantime` syntax: `"500ms"`, `"30s"`,
//! `"2m"`, `"1h"`, or combinations such as `"1m 30s"`.
use std::{collections::BTreeMap, path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    error::Result,
    executor::Stage,
    http::Method,
    metric,
    scenario::{ScenarioConfig, Target, ThinkTime},
    strategy::{Endpoint, EndpointPlan, Selection, StatusRule},
};

pub const DEFAULT_BASE_URL: &str = "http://localhost:8080";
pub const DEFAULT_TARGET_HOST: &str = "ml-platform.local";

/// On-disk scenario definition: the run configuration plus the endpoint plan
/// driving each iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScenarioFile {
    pub scenario: ScenarioConfig,
    pub plan: EndpointPlan,
}

impl ScenarioFile {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = tokio::fs::read(path.as_ref()).await?;
        let file: ScenarioFile = serde_json::from_slice(&raw)?;
        tracing::debug!(
            "Loaded scenario {} from {}",
            file.scenario.name,
            path.as_ref().display()
        );
        Ok(file)
    }

    /// Replace the target's base URL and host, keeping its headers.
    pub fn retarget(mut self, base_url: Option<String>, host: Option<String>) -> Self {
        if let Some(base_url) = base_url {
            self.scenario.target.base_url = base_url;
        }
        if host.is_some() {
            self.scenario.target.host = host;
        }
        self
    }
}

/// Built-in load profiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Profile {
    /// 16 minutes, up to 20 VUs, requests `/`, `/health` and `/api/health`.
    Basic,
    /// 50 minutes, up to 200 VUs against randomly chosen endpoints.
    Stress,
}

impl Profile {
    pub fn scenario(self, base_url: &str, host: &str) -> ScenarioFile {
        match self {
            Profile::Basic => basic(base_url, host),
            Profile::Stress => stress(base_url, host),
        }
    }
}

fn stages(spec: &[(u64, u64)]) -> Vec<Stage> {
    spec.iter()
        .map(|&(minutes, target)| Stage::new(Duration::from_secs(minutes * 60), target))
        .collect()
}

fn thresholds(entries: &[(&str, &str)]) -> BTreeMap<String, Vec<String>> {
    entries
        .iter()
        .map(|(metric, expr)| (metric.to_string(), vec![expr.to_string()]))
        .collect()
}

fn endpoint(name: &str, path: &str) -> Endpoint {
    Endpoint {
        name: name.to_string(),
        path: path.to_string(),
        method: Method::Get,
        host: None,
        accept: StatusRule::default(),
        max_duration: None,
        weight: 1,
        tracked: true,
    }
}

fn basic(base_url: &str, host: &str) -> ScenarioFile {
    let scenario = ScenarioConfig::builder()
        .name("basic-load")
        .stages(stages(&[(2, 10), (5, 10), (2, 20), (5, 20), (2, 0)]))
        .thresholds(thresholds(&[
            (metric::HTTP_REQ_DURATION, "p(95)<500"),
            (metric::HTTP_REQ_FAILED, "rate<0.1"),
            ("errors", "rate<0.1"),
        ]))
        .think_time(ThinkTime::Fixed(Duration::from_secs(1)))
        .target(Target::new(base_url).with_host(host))
        .build();

    let plan = EndpointPlan {
        endpoints: vec![
            Endpoint {
                max_duration: Some(Duration::from_millis(1_000)),
                ..endpoint("frontend", "/")
            },
            Endpoint {
                accept: StatusRule::Exactly(vec![200, 404]),
                tracked: false,
                ..endpoint("health", "/health")
            },
            Endpoint {
                host: Some("api.{host}".to_string()),
                accept: StatusRule::Exactly(vec![200, 404]),
                tracked: false,
                ..endpoint("api", "/api/health")
            },
        ],
        selection: Selection::Sequential,
        requests_per_iteration: 3,
        error_metric: Some("errors".to_string()),
        latency_metric: Some("response_time".to_string()),
        iteration_counter: None,
        warmup: None,
        final_check: None,
    };
    ScenarioFile { scenario, plan }
}

fn stress(base_url: &str, host: &str) -> ScenarioFile {
    let target = Target::new(base_url)
        .with_host(host)
        .with_header("User-Agent", concat!("volley/", env!("CARGO_PKG_VERSION")));
    let scenario = ScenarioConfig::builder()
        .name("stress")
        .stages(stages(&[
            (5, 50),
            (10, 50),
            (5, 100),
            (10, 100),
            (5, 200),
            (10, 200),
            (5, 0),
        ]))
        .thresholds(thresholds(&[
            (metric::HTTP_REQ_DURATION, "p(95)<2000"),
            (metric::HTTP_REQ_FAILED, "rate<0.5"),
            ("stress_errors", "rate<0.5"),
        ]))
        .think_time(ThinkTime::Uniform {
            min: Duration::ZERO,
            max: Duration::from_secs(3),
        })
        .request_timeout(Duration::from_secs(30))
        .target(target)
        .build();

    let tolerant = |name: &str, path: &str| Endpoint {
        accept: StatusRule::Below(500),
        max_duration: Some(Duration::from_millis(5_000)),
        ..endpoint(name, path)
    };
    let plan = EndpointPlan {
        endpoints: vec![
            tolerant("frontend", "/"),
            tolerant("health", "/health"),
            Endpoint {
                host: Some("api.{host}".to_string()),
                ..tolerant("api_health", "/api/health")
            },
            tolerant("metrics", "/metrics"),
        ],
        selection: Selection::Uniform,
        requests_per_iteration: 1,
        error_metric: Some("stress_errors".to_string()),
        latency_metric: Some("stress_response_time".to_string()),
        iteration_counter: Some("stress_requests".to_string()),
        warmup: Some("/".to_string()),
        final_check: Some("/health".to_string()),
    };
    ScenarioFile { scenario, plan }
}
