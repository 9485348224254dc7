//! Bulk worker: drains the per-kind queues and runs queued jobs.
//!
//! A job that fails or overruns its timeout is left in the queue and comes
//! back after the visibility window. After `max_attempts` deliveries (or at
//! once, for jobs that can never succeed) it is acknowledged and reported as
//! failed. The worker also sweeps expired lock-store rows.

pub mod notify;

pub use notify::{JobOutcome, LogNotifier, Notifier};

use std::sync::Arc;
use std::time::Duration;

use opentelemetry::KeyValue;
use tokio::sync::Notify;
use tracing::{Instrument, error, info, warn};

use crate::bulk::Executor;
use crate::error::{Error, Result};
use crate::lock::LockStore;
use crate::model::{BulkJob, OperationKind};
use crate::queue::{QueuedJob, WorkerQueue};
use crate::router::RouteTable;
use crate::telemetry::{metrics, spans};

/// Extra visibility on top of a job's timeout, so a job that is still being
/// cancelled does not reappear on another worker.
const VISIBILITY_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Sleep between queue sweeps.
    pub poll_interval: Duration,
    /// Deliveries before a failing job is given up on.
    pub max_attempts: u32,
    pub lock_sweep_interval: Duration,
    /// Queues this worker drains.
    pub kinds: Vec<OperationKind>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            max_attempts: 3,
            lock_sweep_interval: Duration::from_secs(300),
            kinds: OperationKind::ALL.to_vec(),
        }
    }
}

#[derive(Clone)]
pub struct BulkWorker {
    queue: Arc<dyn WorkerQueue>,
    executor: Executor,
    notifier: Arc<dyn Notifier>,
    locks: Option<Arc<dyn LockStore>>,
    routes: RouteTable,
    config: WorkerConfig,
    shutdown: Arc<Notify>,
}

impl BulkWorker {
    pub fn new(
        queue: Arc<dyn WorkerQueue>,
        executor: Executor,
        notifier: Arc<dyn Notifier>,
        routes: RouteTable,
        config: WorkerConfig,
    ) -> Self {
        Self {
            queue,
            executor,
            notifier,
            locks: None,
            routes,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Also purge expired entries from `locks` every sweep interval.
    pub fn with_lock_sweep(mut self, locks: Arc<dyn LockStore>) -> Self {
        self.locks = Some(locks);
        self
    }

    /// Signal the worker loop to stop.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Run until [`BulkWorker::shutdown`].
    pub async fn run(&self) -> Result<()> {
        if self.config.poll_interval.is_zero() || self.config.lock_sweep_interval.is_zero() {
            return Err(Error::Config(
                "worker poll and lock sweep intervals must be positive".to_string(),
            ));
        }
        info!(kinds = ?self.config.kinds, "bulk worker started");
        let mut sweep = tokio::time::interval(self.config.lock_sweep_interval);

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("bulk worker shutting down");
                    return Ok(());
                }
                _ = sweep.tick() => {
                    self.sweep_locks().await;
                    continue;
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }

            if let Err(e) = self.process_once().await {
                error!("bulk worker poll error: {e}");
            }
        }
    }

    /// One pass over every queue, one message each. Returns how many
    /// messages were handled.
    pub async fn process_once(&self) -> Result<usize> {
        let mut handled = 0;
        for &kind in &self.config.kinds {
            let route_timeout = self.routes.get(kind).timeout();
            if let Some(msg) = self.queue.receive(kind, route_timeout + VISIBILITY_GRACE).await? {
                self.handle(kind, msg, route_timeout).await?;
                handled += 1;
            }
        }
        Ok(handled)
    }

    async fn handle(
        &self,
        kind: OperationKind,
        msg: QueuedJob,
        route_timeout: Duration,
    ) -> Result<()> {
        let job: BulkJob = match serde_json::from_value(msg.payload.clone()) {
            Ok(job) => job,
            Err(e) => {
                // Nobody to report to; drop it so it stops coming back.
                error!(msg_id = msg.msg_id, queue = kind.queue_name(), "undecodable bulk job: {e}");
                self.queue.ack(kind, msg.msg_id).await?;
                self.record(kind, "dead_letter");
                return Ok(());
            }
        };

        let span = spans::start_bulk_span(kind.as_str(), &job.id.to_string(), job.project_id.0);
        async {
            let budget = execution_budget(msg.timeout, route_timeout);
            let result = match tokio::time::timeout(budget, self.executor.execute(&job)).await {
                Ok(result) => result,
                Err(_) => Err(Error::Other(format!("timed out after {}s", budget.as_secs()))),
            };

            match result {
                Ok(report) => {
                    self.queue.ack(kind, msg.msg_id).await?;
                    self.record(kind, "ok");
                    self.report(&job, JobOutcome::Succeeded { report }).await;
                }
                Err(e) if e.is_client_error() || msg.read_count >= self.config.max_attempts => {
                    error!(job = %job.id, attempts = msg.read_count, "giving up on bulk job: {e}");
                    self.queue.ack(kind, msg.msg_id).await?;
                    self.record(kind, "dead_letter");
                    self.report(
                        &job,
                        JobOutcome::Failed {
                            error: e.to_string(),
                            attempts: msg.read_count,
                        },
                    )
                    .await;
                }
                Err(e) => {
                    // Left in the queue; redelivered after the visibility window.
                    warn!(
                        job = %job.id,
                        attempt = msg.read_count,
                        "bulk job failed, will retry: {e}"
                    );
                    self.record(kind, "retry");
                }
            }
            Ok(())
        }
        .instrument(span)
        .await
    }

    async fn report(&self, job: &BulkJob, outcome: JobOutcome) {
        if let Err(e) = self.notifier.notify(job, &outcome).await {
            warn!(job = %job.id, "failed to notify requester: {e}");
        }
    }

    fn record(&self, kind: OperationKind, result: &'static str) {
        metrics::bulk_jobs().add(
            1,
            &[
                KeyValue::new("kind", kind.as_str()),
                KeyValue::new("result", result),
            ],
        );
    }

    async fn sweep_locks(&self) {
        let Some(locks) = &self.locks else {
            return;
        };
        match locks.purge_expired().await {
            Ok(0) => {}
            Ok(n) => {
                metrics::lock_purges().add(n, &[]);
                info!(purged = n, "expired reservations purged");
            }
            Err(e) => warn!("lock sweep failed: {e}"),
        }
    }
}

/// Time a delivered job may run: its enqueued timeout, capped by this
/// worker's own timeout for the kind so the message stays hidden for the
/// whole run.
fn execution_budget(enqueued: Duration, route_timeout: Duration) -> Duration {
    enqueued.min(route_timeout)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_never_outlives_visibility() {
        let route = Duration::from_secs(600);
        assert_eq!(execution_budget(Duration::from_secs(60), route), Duration::from_secs(60));
        assert_eq!(execution_budget(Duration::from_secs(3600), route), route);
        assert!(execution_budget(Duration::from_secs(3600), route) < route + VISIBILITY_GRACE);
    }
}
