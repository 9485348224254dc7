//! Out-of-band reporting of queued job outcomes to whoever requested them.

use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};

use crate::bulk::BulkReport;
use crate::error::Result;
use crate::model::BulkJob;

/// Terminal outcome of a queued job. Intermediate retries are not reported.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobOutcome {
    Succeeded { report: BulkReport },
    Failed { error: String, attempts: u32 },
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, job: &BulkJob, outcome: &JobOutcome) -> Result<()>;
}

/// Reports through the log only.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, job: &BulkJob, outcome: &JobOutcome) -> Result<()> {
        match outcome {
            JobOutcome::Succeeded { report } => info!(
                job = %job.id,
                kind = %job.kind(),
                requested_by = %job.requested_by,
                applied = report.applied,
                skipped = report.skipped,
                "bulk job finished"
            ),
            JobOutcome::Failed { error, attempts } => warn!(
                job = %job.id,
                kind = %job.kind(),
                requested_by = %job.requested_by,
                attempts,
                error = %error,
                "bulk job failed"
            ),
        }
        Ok(())
    }
}
