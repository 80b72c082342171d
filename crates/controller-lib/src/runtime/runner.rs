//! Worker pool driving reconciliation cycles
//!
//! Each worker takes one key at a time from the [`WorkQueue`], runs the
//! matching controller, and turns the typed outcome into a scheduling
//! [`Action`].

use super::WorkQueue;
use crate::controller::{NodeController, PodController};
use crate::health::{components, HealthRegistry};
use crate::models::ObjectKey;
use crate::observability::{outcomes, ControllerMetrics};
use crate::reconcile::{Action, Reconciled};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

const NODE_CONTROLLER: &str = "node";
const POD_CONTROLLER: &str = "pod";

/// Builder-style configuration for [`Runner`]
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Concurrent cycles across all identities
    pub workers: usize,
    /// Requeue delay after a failed cycle
    pub requeue_delay: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            requeue_delay: crate::controller::DEFAULT_REQUEUE_DELAY,
        }
    }
}

#[derive(Clone)]
pub struct Runner {
    queue: Arc<WorkQueue>,
    nodes: Arc<NodeController>,
    pods: Arc<PodController>,
    metrics: ControllerMetrics,
    health: HealthRegistry,
    config: RunnerConfig,
}

impl Runner {
    pub fn new(
        queue: Arc<WorkQueue>,
        nodes: Arc<NodeController>,
        pods: Arc<PodController>,
        metrics: ControllerMetrics,
        health: HealthRegistry,
        config: RunnerConfig,
    ) -> Self {
        Self {
            queue,
            nodes,
            pods,
            metrics,
            health,
            config,
        }
    }

    /// Workers running until `shutdown` fires
    ///
    /// Subscribes before returning, so a signal sent right after spawning the
    /// returned future is not missed.
    pub fn run(self, shutdown: &broadcast::Sender<()>) -> impl Future<Output = ()> + Send + 'static {
        let workers = self.config.workers.max(1);
        let worker_stops: Vec<_> = (0..workers).map(|_| shutdown.subscribe()).collect();
        let mut stop = shutdown.subscribe();

        async move {
            info!(workers = workers, "Starting reconcile workers");
            self.health.set_healthy(components::NODE_CONTROLLER).await;
            self.health.set_healthy(components::POD_CONTROLLER).await;

            let mut set = JoinSet::new();
            for (id, worker_stop) in worker_stops.into_iter().enumerate() {
                let runner = self.clone();
                set.spawn(async move { runner.worker(id, worker_stop).await });
            }

            let _ = stop.recv().await;
            self.queue.shutdown().await;
            while let Some(joined) = set.join_next().await {
                if let Err(e) = joined {
                    error!(error = %e, "Reconcile worker ended abnormally");
                }
            }
            info!("Reconcile workers stopped");
        }
    }

    async fn worker(&self, id: usize, mut shutdown: broadcast::Receiver<()>) {
        loop {
            let key = tokio::select! {
                key = self.queue.next() => match key {
                    Some(key) => key,
                    None => break,
                },
                _ = shutdown.recv() => break,
            };

            // Shutdown never interrupts a started cycle
            let action = self.isolated(id, &key).await;

            self.queue.done(&key).await;
            match action {
                Action::Done => {}
                Action::RequeueNow => self.queue.add(key).await,
                Action::RequeueAfter(delay) => self.queue.add_after(key, delay).await,
            }
            self.metrics.set_queue_depth(self.queue.len().await);
        }
        debug!(worker = id, "Worker exiting");
    }

    /// Run `process` on its own task so a panicking cycle releases its key
    /// instead of taking the worker down with it
    async fn isolated(&self, id: usize, key: &ObjectKey) -> Action {
        let runner = self.clone();
        let cycle_key = key.clone();
        match tokio::spawn(async move { runner.process(&cycle_key).await }).await {
            Ok(action) => action,
            Err(e) => {
                error!(worker = id, key = %key, error = %e, "Reconcile cycle panicked");
                let component = match key {
                    ObjectKey::Node(_) => components::NODE_CONTROLLER,
                    ObjectKey::Pod(_) => components::POD_CONTROLLER,
                };
                self.health
                    .set_degraded(component, format!("cycle for {} panicked", key))
                    .await;
                Action::RequeueAfter(self.config.requeue_delay)
            }
        }
    }

    /// Run one cycle for `key` and decide what happens to it next
    pub async fn process(&self, key: &ObjectKey) -> Action {
        let started = Instant::now();
        let (controller, component, outcome, action) = match key {
            ObjectKey::Node(name) => {
                let settings = self.nodes.settings();
                let (outcome, action) =
                    self.settle(key, self.nodes.reconcile(name).await, |c| c.action(settings));
                (NODE_CONTROLLER, components::NODE_CONTROLLER, outcome, action)
            }
            ObjectKey::Pod(pod) => {
                let (outcome, action) =
                    self.settle(key, self.pods.reconcile(pod).await, |c| c.action());
                (POD_CONTROLLER, components::POD_CONTROLLER, outcome, action)
            }
        };

        self.metrics
            .observe_reconcile(controller, outcome, started.elapsed().as_secs_f64());
        if outcome == outcomes::FAIL {
            self.health
                .set_degraded(component, format!("last cycle for {} failed", key))
                .await;
        } else {
            self.health.set_healthy(component).await;
        }
        action
    }

    fn settle<T>(
        &self,
        key: &ObjectKey,
        outcome: Reconciled<T>,
        on_success: impl FnOnce(&T) -> Action,
    ) -> (&'static str, Action) {
        match outcome {
            Reconciled::Success(cycle) => (outcomes::SUCCESS, on_success(&cycle)),
            Reconciled::Retry(retry) => {
                debug!(key = %key, reason = %retry.reason, "Cycle will be retried");
                (outcomes::RETRY, retry.after.into())
            }
            Reconciled::Fail(e) => {
                error!(key = %key, error = %e, "Reconcile cycle failed");
                (
                    outcomes::FAIL,
                    Action::RequeueAfter(self.config.requeue_delay),
                )
            }
        }
    }
}
