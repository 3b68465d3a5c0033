use std::{collections::BTreeMap, future::Future, time::Duration};

use rand::Rng;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::{
    config::DEFAULT_BASE_URL,
    error::ConfigError,
    executor::Stage,
    http::HttpClient,
    metric::MetricKind,
    run::TestResult,
    runner::{HookContext, IterationContext},
};

/// Per-iteration request logic plus the run's lifecycle phases.
///
/// `iteration` is called once per VU loop pass. Everything it records goes
/// through the [`IterationContext`]: requests are timed and counted, checks
/// land in the `checks` rate, and custom metrics are written by name.
///
/// An `Err` or a panic from `iteration` is recorded as a failed check; the VU
/// moves on to its next iteration.
///
/// ```rust,ignore
/// struct Home;
///
/// impl Scenario for Home {
///     async fn iteration<C: HttpClient>(&self, ctx: &mut IterationContext<'_, C>) -> anyhow::Result<()> {
///         let res = ctx.request(RequestSpec::get("/")).await;
///         ctx.check("status is 200", res.status == 200);
///         Ok(())
///     }
/// }
/// ```
pub trait Scenario: Send + Sync + 'static {
    fn iteration<C: HttpClient>(
        &self,
        ctx: &mut IterationContext<'_, C>,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;

    /// Custom metrics this scenario records, registered before thresholds are
    /// validated.
    fn metrics(&self) -> Vec<(String, MetricKind)> {
        Vec::new()
    }

    /// Runs once before the first VU starts. An error aborts the run.
    fn on_start<C: HttpClient>(
        &self,
        _ctx: &HookContext<'_, C>,
    ) -> impl Future<Output = anyhow::Result<()>> + Send {
        async { Ok(()) }
    }

    /// Runs once after the result has been finalized.
    fn on_finalize<C: HttpClient>(
        &self,
        _ctx: &HookContext<'_, C>,
        _result: &TestResult,
    ) -> impl Future<Output = ()> + Send {
        async {}
    }
}

/// Everything that defines a run apart from the per-iteration logic.
#[derive(Debug, Clone, TypedBuilder, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScenarioConfig {
    #[builder(setter(into))]
    pub name: String,
    pub stages: Vec<Stage>,
    /// VUs alive at `t = 0`, before the first stage starts ramping.
    #[builder(default)]
    #[serde(default)]
    pub start_vus: u64,
    /// Metric name to threshold expressions, e.g. `"http_req_duration": ["p(95)<500"]`.
    #[builder(default)]
    #[serde(default)]
    pub thresholds: BTreeMap<String, Vec<String>>,
    /// Custom metrics recorded by the scenario.
    #[builder(default)]
    #[serde(default)]
    pub metrics: BTreeMap<String, MetricKind>,
    #[builder(default)]
    #[serde(default)]
    pub think_time: ThinkTime,
    #[builder(default = Duration::from_secs(60))]
    #[serde(default = "defaults::request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,
    #[builder(default = Duration::from_secs(30))]
    #[serde(default = "defaults::graceful_stop", with = "humantime_serde")]
    pub graceful_stop: Duration,
    #[builder(default = Duration::from_millis(100))]
    #[serde(default = "defaults::tick", with = "humantime_serde")]
    pub tick: Duration,
    #[builder(default)]
    #[serde(default)]
    pub target: Target,
}

mod defaults {
    use std::time::Duration;

    pub fn base_url() -> String {
        crate::config::DEFAULT_BASE_URL.to_string()
    }

    pub fn request_timeout() -> Duration {
        Duration::from_secs(60)
    }

    pub fn graceful_stop() -> Duration {
        Duration::from_secs(30)
    }

    pub fn tick() -> Duration {
        Duration::from_millis(100)
    }
}

impl ScenarioConfig {
    /// Checks that do not need the metric store. Stage and threshold errors
    /// are raised when the run is built.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick.is_zero() {
            return Err(ConfigError::InvalidOption {
                name: "tick",
                reason: "must be greater than zero".into(),
            });
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigError::InvalidOption {
                name: "request_timeout",
                reason: "must be greater than zero".into(),
            });
        }
        self.think_time.validate()
    }
}

/// Pause between two iterations of the same VU.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThinkTime {
    #[default]
    None,
    Fixed(#[serde(with = "humantime_serde")] Duration),
    /// Uniformly random in `[min, max)`.
    Uniform {
        #[serde(with = "humantime_serde")]
        min: Duration,
        #[serde(with = "humantime_serde")]
        max: Duration,
    },
}

impl ThinkTime {
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            ThinkTime::Uniform { min, max } if min > max => Err(ConfigError::InvalidOption {
                name: "think_time",
                reason: format!("min {min:?} is greater than max {max:?}"),
            }),
            _ => Ok(()),
        }
    }

    pub fn sample(&self) -> Duration {
        match *self {
            ThinkTime::None => Duration::ZERO,
            ThinkTime::Fixed(d) => d,
            ThinkTime::Uniform { min, max } if min >= max => min,
            ThinkTime::Uniform { min, max } => {
                let secs = rand::thread_rng().gen_range(min.as_secs_f64()..max.as_secs_f64());
                Duration::from_secs_f64(secs)
            }
        }
    }
}

/// Where requests go, and the headers sent with every one of them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Target {
    #[serde(default = "defaults::base_url")]
    pub base_url: String,
    /// Sent as the `Host` header unless a request sets its own.
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl Default for Target {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_URL)
    }
}

impl Target {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            host: None,
            headers: BTreeMap::new(),
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Absolute URLs pass through; anything else is appended to `base_url`.
    pub fn resolve(&self, url: &str) -> String {
        if url.starts_with("http://") || url.starts_with("https://") {
            return url.to_string();
        }
        let base = self.base_url.trim_end_matches('/');
        if url.is_empty() {
            base.to_string()
        } else if url.starts_with('/') {
            format!("{base}{url}")
        } else {
            format!("{base}/{url}")
        }
    }

    /// Default headers overlaid with the request's own. Names compare
    /// case-insensitively; the request wins.
    pub fn headers_for(&self, request: Vec<(String, String)>) -> Vec<(String, String)> {
        let overridden = |name: &str| request.iter().any(|(n, _)| n.eq_ignore_ascii_case(name));
        let mut headers: Vec<(String, String)> = Vec::with_capacity(self.headers.len() + 1);
        if let Some(host) = &self.host {
            if !overridden("host") {
                headers.push(("Host".to_string(), host.clone()));
            }
        }
        headers.extend(
            self.headers
                .iter()
                .filter(|(name, _)| !overridden(name))
                .map(|(n, v)| (n.clone(), v.clone())),
        );
        headers.extend(request);
        headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config: ScenarioConfig =
            serde_json::from_str(r#"{ "name": "smoke", "stages": [{ "duration": "30s", "target": 5 }] }"#)
                .unwrap();
        assert_eq!(config.start_vus, 0);
        assert_eq!(config.request_timeout, Duration::from_secs(60));
        assert_eq!(config.graceful_stop, Duration::from_secs(30));
        assert_eq!(config.tick, Duration::from_millis(100));
        assert_eq!(config.think_time, ThinkTime::None);
        assert_eq!(config.target, Target::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn think_time_forms() {
        let fixed: ThinkTime = serde_json::from_str(r#"{ "fixed": "1s" }"#).unwrap();
        assert_eq!(fixed, ThinkTime::Fixed(Duration::from_secs(1)));
        let uniform: ThinkTime =
            serde_json::from_str(r#"{ "uniform": { "min": "0s", "max": "3s" } }"#).unwrap();
        assert_eq!(
            uniform,
            ThinkTime::Uniform {
                min: Duration::ZERO,
                max: Duration::from_secs(3)
            }
        );
        let none: ThinkTime = serde_json::from_str(r#""none""#).unwrap();
        assert_eq!(none, ThinkTime::None);
    }

    #[test]
    fn uniform_think_time_stays_in_range() {
        let think = ThinkTime::Uniform {
            min: Duration::from_millis(100),
            max: Duration::from_millis(300),
        };
        for _ in 0..1_000 {
            let d = think.sample();
            assert!(d >= Duration::from_millis(100) && d < Duration::from_millis(300), "{d:?}");
        }
    }

    #[test]
    fn inverted_think_time_is_rejected() {
        let config = ScenarioConfig::builder()
            .name("bad")
            .stages(vec![Stage::new(Duration::from_secs(1), 1)])
            .think_time(ThinkTime::Uniform {
                min: Duration::from_secs(2),
                max: Duration::from_secs(1),
            })
            .build();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidOption { name: "think_time", .. })
        ));
    }

    #[test]
    fn zero_tick_is_rejected() {
        let config = ScenarioConfig::builder()
            .name("bad")
            .stages(vec![Stage::new(Duration::from_secs(1), 1)])
            .tick(Duration::ZERO)
            .build();
        assert!(config.validate().is_err());
    }

    #[test]
    fn resolves_relative_urls() {
        let target = Target::new("http://localhost:8080/");
        assert_eq!(target.resolve("/health"), "http://localhost:8080/health");
        assert_eq!(target.resolve("api/health"), "http://localhost:8080/api/health");
        assert_eq!(target.resolve(""), "http://localhost:8080");
        assert_eq!(target.resolve("https://elsewhere/x"), "https://elsewhere/x");
    }

    #[test]
    fn request_headers_override_defaults() {
        let target = Target::new("http://x")
            .with_host("ml-platform.local")
            .with_header("User-Agent", "volley");
        let headers = target.headers_for(vec![("host".into(), "api.ml-platform.local".into())]);
        assert_eq!(
            headers,
            vec![
                ("User-Agent".to_string(), "volley".to_string()),
                ("host".to_string(), "api.ml-platform.local".to_string()),
            ]
        );
        let headers = target.headers_for(vec![]);
        assert_eq!(headers[0], ("Host".to_string(), "ml-platform.local".to_string()));
    }
}
