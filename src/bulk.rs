//! Bulk mutation executor.
//!
//! Shared by the inline path of the router and by the queue worker, so a job
//! does the same thing wherever it runs. Mutations are applied per task;
//! a job interrupted halfway leaves the finished tasks done and can be run
//! again. Tasks that vanished in the meantime are counted as skipped.

use std::sync::Arc;
use std::time::Instant;

use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::model::{BulkJob, BulkOperation, JobId, NewTask, OperationKind, Task, TaskId};
use crate::repo::TaskRepository;
use crate::telemetry::metrics;
use crate::tracker::RedundancyTracker;

/// Ids per delete transaction.
pub const DELETE_BATCH: usize = 100;

/// Definitive result of a bulk mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkReport {
    pub job_id: JobId,
    pub kind: OperationKind,
    /// Tasks the selector resolved to (for imports, tasks submitted).
    pub matched: u64,
    /// Tasks actually changed, created or removed.
    pub applied: u64,
    /// Matched tasks left alone: already in the target state, protected by
    /// answers, or gone before they could be touched.
    pub skipped: u64,
}

impl BulkReport {
    fn new(job: &BulkJob, matched: u64) -> Self {
        Self {
            job_id: job.id,
            kind: job.kind(),
            matched,
            applied: 0,
            skipped: 0,
        }
    }

    fn tally(&mut self, applied: bool) {
        if applied {
            self.applied += 1;
        } else {
            self.skipped += 1;
        }
    }
}

#[derive(Clone)]
pub struct Executor {
    repo: Arc<dyn TaskRepository>,
    tracker: RedundancyTracker,
}

impl Executor {
    pub fn new(repo: Arc<dyn TaskRepository>, tracker: RedundancyTracker) -> Self {
        Self { repo, tracker }
    }

    pub async fn execute(&self, job: &BulkJob) -> Result<BulkReport> {
        let start = Instant::now();

        let report = match &job.operation {
            BulkOperation::Import { tasks } => self.import(job, tasks).await?,
            BulkOperation::SetPriority { priority } => {
                let tasks = self.select(job).await?;
                self.set_priority(job, &tasks, *priority).await?
            }
            BulkOperation::SetRedundancy { n_answers } => {
                let tasks = self.select(job).await?;
                self.set_redundancy(job, &tasks, *n_answers).await?
            }
            BulkOperation::Delete { force } => {
                let tasks = self.select(job).await?;
                self.delete(job, &tasks, *force).await?
            }
            BulkOperation::Export => {
                let tasks = self.select(job).await?;
                self.export(job, &tasks).await?
            }
        };

        metrics::operation_duration_ms().record(
            start.elapsed().as_secs_f64() * 1000.0,
            &[KeyValue::new("operation", format!("bulk_{}", job.kind()))],
        );
        info!(
            job = %job.id,
            kind = %job.kind(),
            project = %job.project_id,
            matched = report.matched,
            applied = report.applied,
            skipped = report.skipped,
            "bulk mutation applied"
        );
        Ok(report)
    }

    async fn select(&self, job: &BulkJob) -> Result<Vec<Task>> {
        job.selector.validate()?;
        self.repo
            .get_tasks_by(job.project_id, &job.selector.to_filter())
            .await
    }

    async fn import(&self, job: &BulkJob, tasks: &[NewTask]) -> Result<BulkReport> {
        // Reject the whole batch before creating anything.
        for task in tasks {
            task.validate()?;
        }
        let mut report = BulkReport::new(job, tasks.len() as u64);
        for task in tasks {
            self.repo.insert_task(job.project_id, task).await?;
            report.applied += 1;
        }
        Ok(report)
    }

    async fn set_priority(
        &self,
        job: &BulkJob,
        tasks: &[Task],
        priority: f64,
    ) -> Result<BulkReport> {
        if !priority.is_finite() {
            return Err(Error::InvalidPriority(priority));
        }
        let mut report = BulkReport::new(job, tasks.len() as u64);
        for task in tasks {
            let changed = task.priority != priority;
            let applied = skip_missing(self.tracker.set_priority(task.id, priority).await)?;
            report.tally(applied.is_some() && changed);
        }
        Ok(report)
    }

    async fn set_redundancy(
        &self,
        job: &BulkJob,
        tasks: &[Task],
        n_answers: u32,
    ) -> Result<BulkReport> {
        if n_answers == 0 {
            return Err(Error::InvalidRedundancy(n_answers));
        }
        let mut report = BulkReport::new(job, tasks.len() as u64);
        for task in tasks {
            let changed = task.n_answers != n_answers;
            let applied = skip_missing(self.tracker.set_redundancy(task.id, n_answers).await)?;
            report.tally(applied.is_some() && changed);
        }
        Ok(report)
    }

    /// Without `force` the repository keeps answered tasks; the answer check
    /// happens inside each batch's delete, not here.
    async fn delete(&self, job: &BulkJob, tasks: &[Task], force: bool) -> Result<BulkReport> {
        let mut report = BulkReport::new(job, tasks.len() as u64);
        let ids: Vec<TaskId> = tasks.iter().map(|t| t.id).collect();

        for batch in ids.chunks(DELETE_BATCH) {
            let deleted = self.repo.delete_tasks(job.project_id, batch, force).await?;
            debug!(job = %job.id, batch = batch.len(), deleted, "delete batch");
            report.applied += deleted;
        }
        report.skipped = report.matched.saturating_sub(report.applied);
        Ok(report)
    }

    async fn export(&self, job: &BulkJob, tasks: &[Task]) -> Result<BulkReport> {
        let mut report = BulkReport::new(job, tasks.len() as u64);
        for task in tasks {
            let marked = skip_missing(self.tracker.mark_exported(task.id).await)?;
            report.tally(marked.unwrap_or(false));
        }
        Ok(report)
    }
}

/// A task deleted between selection and mutation is skipped, not fatal.
fn skip_missing<T>(result: Result<T>) -> Result<Option<T>> {
    match result {
        Ok(v) => Ok(Some(v)),
        Err(Error::NotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}
