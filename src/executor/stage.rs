//! The `RampingVuExecutor` and its schedule, providing a stage-based
//! concurrency model.
//!
//! A list of [`Stage`]s describes how many VUs should be alive over time. Each
//! `Stage` defines a target VU count and a duration over which the target is
//! linearly interpolated from the previous stage's target.
//!
//! This design separates **population control** (the scheduler loop) from
//! **work execution** (VU tasks): the scheduler never performs request I/O,
//! it only spawns and retires VUs.
//!
//! # High-level flow
//! 1. The stage list is validated into a [`ScheduleCurve`], a pure function of
//!    elapsed time.
//! 2. Every `tick` the scheduler evaluates the curve and scales the VU pool to
//!    `round(target_vus(elapsed))`:
//!    - missing VUs are spawned and start iterating immediately,
//!    - surplus VUs are told to retire; they finish their current iteration
//!      and exit.
//! 3. When the schedule is exhausted (or the run is cancelled) every VU is
//!    retired and the pool waits up to `graceful_stop` for in-flight
//!    iterations. Iterations still running at the deadline are abandoned.
//!
//! # Mathematical behavior of the curve
//! For a stage with `from` (previous target, or `start_vus` for the first
//! stage) and `to` (stage.target) over `duration`, at time `elapsed` into the
//! stage:
//!
//! ```text
//! t = min(elapsed / duration, 1)
//! target(t) = from + (to - from) * t
//! ```
//!
//! The curve is continuous, equals each stage's target at the stage's end and
//! never leaves the interval between two consecutive targets.
//!
//! # Tuning knobs
//! - `tick` (Duration): how often the population is reconciled. The live VU
//!   count converges to the curve within one tick. Typical: 50–1000ms.
//! - `graceful_stop` (Duration): how long retired VUs may keep running their
//!   last iteration once the schedule ends or the run is cancelled.
use std::{sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use tokio::sync::watch::Receiver;
use tokio::time::{Instant, MissedTickBehavior};
use typed_builder::TypedBuilder;

use super::{pool::VuPool, ExecutionSummary, Executor};
use crate::{
    error::ConfigError,
    http::HttpClient,
    runner::IterationRunner,
    scenario::{Scenario, ScenarioConfig},
};

/// A stage defines a target VU count and how long to ramp to that target.
///
/// Use `Stage::new(Duration::from_secs(10), 100)` to ramp to 100 VUs over 10s.
/// A stage with `Duration::ZERO` is skipped entirely.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Stage {
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    /// Number of VUs
    pub target: u64,
}

impl Stage {
    pub fn new(duration: Duration, target: u64) -> Self {
        Self { duration, target }
    }
}

/// Target VU count as a function of elapsed time, derived from a stage list.
#[derive(Clone, Debug, PartialEq)]
pub struct ScheduleCurve {
    start_vus: u64,
    stages: Vec<Stage>,
    total: Duration,
}

impl ScheduleCurve {
    pub fn new(stages: &[Stage]) -> Result<Self, ConfigError> {
        Self::with_start(0, stages)
    }

    /// Curve starting at `start_vus` at `t = 0`.
    pub fn with_start(start_vus: u64, stages: &[Stage]) -> Result<Self, ConfigError> {
        if stages.is_empty() {
            return Err(ConfigError::EmptySchedule);
        }
        let stages: Vec<Stage> = stages
            .iter()
            .copied()
            .filter(|stage| {
                if stage.duration.is_zero() {
                    tracing::debug!("Skipping zero-length stage targeting {} VUs", stage.target);
                }
                !stage.duration.is_zero()
            })
            .collect();
        if stages.is_empty() {
            return Err(ConfigError::ZeroDuration);
        }
        let total = stages.iter().map(|s| s.duration).sum();
        Ok(Self {
            start_vus,
            stages,
            total,
        })
    }

    pub fn total_duration(&self) -> Duration {
        self.total
    }

    /// The stages that make up the curve (zero-length stages removed).
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Index of the stage whose window contains `elapsed`, or `None` once the
    /// schedule is over.
    pub fn stage_at(&self, elapsed: Duration) -> Option<usize> {
        let mut end = Duration::ZERO;
        for (i, stage) in self.stages.iter().enumerate() {
            end += stage.duration;
            if elapsed < end {
                return Some(i);
            }
        }
        None
    }

    /// Interpolated target at `elapsed`. Past the end of the schedule this is
    /// the last stage's target.
    pub fn target_vus(&self, elapsed: Duration) -> f64 {
        let mut from = self.start_vus as f64;
        let mut stage_start = Duration::ZERO;
        for stage in &self.stages {
            let stage_end = stage_start + stage.duration;
            if elapsed < stage_end {
                return interpolate(
                    elapsed - stage_start,
                    stage.duration,
                    from,
                    stage.target as f64,
                );
            }
            from = stage.target as f64;
            stage_start = stage_end;
        }
        from
    }

    /// Number of VUs that should be alive at `elapsed`.
    pub fn scheduled_vus(&self, elapsed: Duration) -> usize {
        self.target_vus(elapsed).round() as usize
    }
}

/// Pure linear interpolation between two targets, clamped to `>= 0`.
///
/// `elapsed` beyond `stage_duration` yields `to`.
pub fn interpolate(elapsed: Duration, stage_duration: Duration, from: f64, to: f64) -> f64 {
    // Interpolation factor [0.0..1.0]
    let t = (elapsed.as_secs_f64() / stage_duration.as_secs_f64()).min(1.0);
    (from + (to - from) * t).max(0.0)
}

/// Executor that keeps the number of live VUs on a [`ScheduleCurve`].
///
/// - The scheduler ticks every `tick` and spawns or retires VUs to match
///   `round(target_vus(elapsed))`.
/// - Retired VUs finish their current iteration and exit; they are never
///   interrupted mid-iteration by a ramp-down.
/// - At the end of the schedule (or on cancellation) every VU is retired and
///   given `graceful_stop` to finish.
#[derive(TypedBuilder)]
pub struct RampingVuExecutor {
    pub curve: ScheduleCurve,
    /// The granularity of population updates.
    #[builder(default = Duration::from_millis(100))]
    pub tick: Duration,
    /// How long in-flight iterations may run once VUs are told to stop.
    #[builder(default = Duration::from_secs(30))]
    pub graceful_stop: Duration,
}

impl RampingVuExecutor {
    pub fn from_config(config: &ScenarioConfig) -> Result<Self, ConfigError> {
        Ok(Self::builder()
            .curve(ScheduleCurve::with_start(config.start_vus, &config.stages)?)
            .tick(config.tick)
            .graceful_stop(config.graceful_stop)
            .build())
    }
}

impl Executor for RampingVuExecutor {
    async fn exec<S, C>(
        &self,
        runner: Arc<IterationRunner<S, C>>,
        mut shutdown: Receiver<bool>,
    ) -> ExecutionSummary
    where
        S: Scenario,
        C: HttpClient,
    {
        let total = self.curve.total_duration();
        let stage_count = self.curve.stages().len();
        let mut pool = VuPool::new(runner, shutdown.clone());
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!("Running {stage_count} stages over {total:?}...");
        let start = Instant::now();
        let mut current_stage = None;
        let cancelled = loop {
            tokio::select! {
                _ = ticker.tick() => {}
                Ok(_) = shutdown.wait_for(|stop| *stop) => break true,
            }

            let elapsed = start.elapsed();
            if elapsed >= total {
                break false;
            }
            let stage = self.curve.stage_at(elapsed);
            if stage != current_stage {
                if let Some(i) = stage {
                    tracing::info!("Starting stage: {}/{stage_count}", i + 1);
                }
                current_stage = stage;
            }
            pool.scale_to(self.curve.scheduled_vus(elapsed));
        };

        tracing::debug!("{} VUs live when the scheduler stopped.", pool.live());
        if cancelled {
            tracing::warn!("Run cancelled, stopping all VUs...");
        } else {
            tracing::info!("Schedule finished, retiring all VUs...");
        }
        let vus_max = pool.peak();
        let abandoned = pool.drain(self.graceful_stop).await;

        ExecutionSummary {
            elapsed: start.elapsed(),
            vus_max,
            abandoned,
            cancelled,
        }
    }
}
