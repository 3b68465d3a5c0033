use std::{sync::Arc, time::Duration};

use futures::FutureExt;
use tokio::{
    sync::watch::{self, Receiver, Sender},
    task::JoinHandle,
    time::Instant,
};

use crate::{http::HttpClient, runner::IterationRunner, scenario::Scenario};

struct Vu {
    id: u64,
    retire: Sender<bool>,
    task: JoinHandle<u64>,
}

/// The live VU population of one run.
///
/// VUs are retired newest first. A retired VU keeps running until its current
/// iteration ends, so it is tracked separately until its task finishes.
pub(crate) struct VuPool<S, C> {
    runner: Arc<IterationRunner<S, C>>,
    shutdown: Receiver<bool>,
    active: Vec<Vu>,
    retiring: Vec<Vu>,
    next_id: u64,
    peak: usize,
}

impl<S: Scenario, C: HttpClient> VuPool<S, C> {
    pub fn new(runner: Arc<IterationRunner<S, C>>, shutdown: Receiver<bool>) -> Self {
        Self {
            runner,
            shutdown,
            active: Vec::new(),
            retiring: Vec::new(),
            next_id: 0,
            peak: 0,
        }
    }

    pub fn live(&self) -> usize {
        self.active.len()
    }

    pub fn peak(&self) -> usize {
        self.peak
    }

    /// Spawn or retire VUs until exactly `target` are active.
    pub fn scale_to(&mut self, target: usize) {
        self.reap_retired();

        while self.active.len() < target {
            self.spawn();
        }
        while self.active.len() > target {
            let Some(vu) = self.active.pop() else { break };
            tracing::debug!("Retiring VU {}.", vu.id);
            vu.retire.send_replace(true);
            self.retiring.push(vu);
        }

        self.peak = self.peak.max(self.active.len());
        let metrics = self.runner.metrics();
        metrics.vus.set_count(self.active.len());
        metrics.vus_max.set_count(self.peak);
    }

    /// Forget retired VUs whose task has ended. Returns how many of them
    /// panicked.
    fn reap_retired(&mut self) -> usize {
        let (finished, running): (Vec<Vu>, Vec<Vu>) = std::mem::take(&mut self.retiring)
            .into_iter()
            .partition(|vu| vu.task.is_finished());
        self.retiring = running;

        let mut panicked = 0;
        for mut vu in finished {
            match (&mut vu.task).now_or_never() {
                Some(Ok(iterations)) => {
                    tracing::debug!("VU {} stopped after {iterations} iterations.", vu.id)
                }
                Some(Err(e)) => {
                    tracing::error!("VU {} panicked with error: {e}", vu.id);
                    panicked += 1;
                }
                None => {}
            }
        }
        panicked
    }

    fn spawn(&mut self) {
        let id = self.next_id;
        self.next_id += 1;
        let (retire, retire_rx) = watch::channel(false);
        let task = tokio::spawn(vu_loop(
            id,
            Arc::clone(&self.runner),
            retire_rx,
            self.shutdown.clone(),
        ));
        tracing::debug!("VU {id} spawned.");
        self.active.push(Vu { id, retire, task });
    }

    /// Retire every VU and wait for them until `grace` has passed. VUs still
    /// running after that are aborted. Returns how many were aborted.
    pub async fn drain(mut self, grace: Duration) -> usize {
        let mut vus = std::mem::take(&mut self.active);
        for vu in &vus {
            vu.retire.send_replace(true);
        }
        vus.append(&mut self.retiring);
        self.runner.metrics().vus.set_count(0);

        let deadline = Instant::now() + grace;
        let mut abandoned = 0;
        for mut vu in vus {
            match tokio::time::timeout_at(deadline, &mut vu.task).await {
                Ok(Ok(iterations)) => {
                    tracing::debug!("VU {} stopped after {iterations} iterations.", vu.id)
                }
                Ok(Err(e)) => tracing::error!("VU {} panicked with error: {e}", vu.id),
                Err(_) => {
                    tracing::warn!(
                        "VU {} still running at the graceful stop deadline, abandoning its iteration.",
                        vu.id
                    );
                    vu.task.abort();
                    // Lets the task drop its in-flight iteration before finalize.
                    let _ = vu.task.await;
                    abandoned += 1;
                }
            }
        }
        abandoned
    }
}

/// One VU: iterate until retired or shut down, sleeping think time in between.
async fn vu_loop<S: Scenario, C: HttpClient>(
    id: u64,
    runner: Arc<IterationRunner<S, C>>,
    mut retire: Receiver<bool>,
    mut shutdown: Receiver<bool>,
) -> u64 {
    let mut iteration = 0;
    while !*retire.borrow() && !*shutdown.borrow() {
        runner.run_iteration(id, iteration).await;
        iteration += 1;

        let pause = runner.think_time();
        if pause.is_zero() {
            tokio::task::yield_now().await;
            continue;
        }
        tokio::select! {
            _ = tokio::time::sleep(pause) => {}
            _ = retire.wait_for(|r| *r) => break,
            _ = shutdown.wait_for(|s| *s) => break,
        }
    }
    iteration
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::RequestError,
        executor::Stage,
        http::{HttpRequest, HttpResponse},
        runner::IterationContext,
        scenario::ScenarioConfig,
        store::MetricStore,
    };
    use std::sync::atomic::{AtomicU64, Ordering};

    struct NoopClient;

    impl HttpClient for NoopClient {
        async fn do_request(&self, _: &HttpRequest) -> Result<HttpResponse, RequestError> {
            Ok(HttpResponse {
                status: 200,
                duration: Duration::from_millis(1),
            })
        }
    }

    /// Sleeps for `busy` inside every iteration.
    struct Busy {
        busy: Duration,
        started: AtomicU64,
    }

    impl Scenario for Busy {
        async fn iteration<C: HttpClient>(
            &self,
            _ctx: &mut IterationContext<'_, C>,
        ) -> anyhow::Result<()> {
            self.started.fetch_add(1, Ordering::Relaxed);
            tokio::time::sleep(self.busy).await;
            Ok(())
        }
    }

    fn runner(busy: Duration) -> Arc<IterationRunner<Busy, NoopClient>> {
        let config = ScenarioConfig::builder()
            .name("pool")
            .stages(vec![Stage::new(Duration::from_secs(1), 1)])
            .build();
        let scenario = Busy {
            busy,
            started: AtomicU64::new(0),
        };
        Arc::new(
            IterationRunner::new(
                Arc::new(scenario),
                NoopClient,
                Arc::new(MetricStore::new()),
                &config,
            )
            .unwrap(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn spawn_expected_number_of_vus() {
        let (_tx, rx) = watch::channel(false);
        let mut pool = VuPool::new(runner(Duration::from_millis(10)), rx);

        pool.scale_to(10);
        assert_eq!(pool.live(), 10);
        pool.scale_to(3);
        assert_eq!(pool.live(), 3);
        assert_eq!(pool.peak(), 10);

        assert_eq!(pool.drain(Duration::from_secs(1)).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn retired_vus_finish_their_iteration() {
        let runner = runner(Duration::from_secs(2));
        let (_tx, rx) = watch::channel(false);
        let mut pool = VuPool::new(Arc::clone(&runner), rx);

        pool.scale_to(4);
        tokio::time::sleep(Duration::from_millis(500)).await;
        pool.scale_to(0);
        assert_eq!(pool.drain(Duration::from_secs(5)).await, 0);

        let snapshot = runner.store().finalize(Duration::from_secs(3));
        assert_eq!(snapshot.counter_total(crate::metric::ITERATIONS), 4.0);
        assert_eq!(snapshot.counter_total(crate::metric::INTERRUPTED_ITERATIONS), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn finished_retired_vus_are_reaped() {
        let (_tx, rx) = watch::channel(false);
        let mut pool = VuPool::new(runner(Duration::from_millis(100)), rx);

        pool.scale_to(3);
        pool.scale_to(0);
        assert_eq!(pool.retiring.len(), 3);

        let (retire, _) = watch::channel(false);
        let task: JoinHandle<u64> = tokio::spawn(async { panic!("scenario bug") });
        while !task.is_finished() {
            tokio::task::yield_now().await;
        }
        pool.retiring.push(Vu { id: 99, retire, task });

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(pool.reap_retired(), 1);
        assert!(pool.retiring.is_empty());
        pool.scale_to(0);
        assert_eq!(pool.drain(Duration::from_secs(1)).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_abandons_after_grace() {
        let runner = runner(Duration::from_secs(60));
        let (_tx, rx) = watch::channel(false);
        let mut pool = VuPool::new(Arc::clone(&runner), rx);

        pool.scale_to(2);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(pool.drain(Duration::from_secs(1)).await, 2);

        let snapshot = runner.store().finalize(Duration::from_secs(2));
        assert_eq!(snapshot.counter_total(crate::metric::INTERRUPTED_ITERATIONS), 2.0);
        assert_eq!(snapshot.counter_total(crate::metric::ITERATIONS), 0.0);
    }
}
