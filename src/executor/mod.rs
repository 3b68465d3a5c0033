//! Executor: orchestration of VU population over time
//!
//! The `Executor` trait is the runtime that drives a scenario's VUs. Different
//! executors provide different population strategies: a fixed number of VUs,
//! a staged ramp, or anything else that decides when VUs start and stop.
//!
//! Volley provides a built-in [`RampingVuExecutor`] which follows a list of
//! [`Stage`]s.
mod pool;
pub mod stage;
pub use stage::{RampingVuExecutor, ScheduleCurve, Stage};

use std::{future::Future, sync::Arc, time::Duration};

use tokio::sync::watch::Receiver;

use crate::{http::HttpClient, runner::IterationRunner, scenario::Scenario};

/// What happened while the VUs were running.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExecutionSummary {
    /// Wall time from the first tick until the last VU stopped.
    pub elapsed: Duration,
    /// Highest number of VUs alive at once.
    pub vus_max: usize,
    /// VUs whose iteration was still running at the grace deadline.
    pub abandoned: usize,
    pub cancelled: bool,
}

/// The runtime hook that executes a scenario's VUs.
///
/// `Executor` decides how many VUs are alive at any point in time. Each VU
/// loops over [`IterationRunner::run_iteration`]; the executor never performs
/// request I/O itself.
///
/// Implementations must stop spawning VUs once `shutdown` turns `true`, and
/// must not return before every VU they started has stopped or been
/// abandoned.
pub trait Executor
where
    Self: Send + Sync + Sized,
{
    /// Run the scenario to completion (or cancellation).
    fn exec<S, C>(
        &self,
        runner: Arc<IterationRunner<S, C>>,
        shutdown: Receiver<bool>,
    ) -> impl Future<Output = ExecutionSummary> + Send
    where
        S: Scenario,
        C: HttpClient;
}
