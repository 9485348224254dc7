//! Bulk mutation router.
//!
//! Decides, per request, whether a bulk mutation runs inline or is handed to
//! the worker queue. The decision compares an estimated cardinality against
//! a per-kind threshold from [`RouteTable`]. Validation always happens first,
//! so a bad selector never reaches either path.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use tracing::{Instrument, info};

use crate::bulk::{BulkReport, Executor};
use crate::error::{Error, Result};
use crate::model::{BulkJob, BulkOperation, JobId, OperationKind, Selector};
use crate::queue::WorkerQueue;
use crate::repo::TaskRepository;
use crate::telemetry::{metrics, spans};

// ---------------------------------------------------------------------------
// Route table
// ---------------------------------------------------------------------------

/// Routing rule for one operation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutePolicy {
    /// Jobs touching at least this many tasks go to the worker queue.
    pub threshold: u64,
    /// Execution budget for a queued job, also its queue visibility window.
    pub timeout_secs: u64,
    /// Explicit id lists always run inline, whatever their length.
    pub ids_always_inline: bool,
}

impl RoutePolicy {
    pub const fn new(threshold: u64, timeout_secs: u64, ids_always_inline: bool) -> Self {
        Self {
            threshold,
            timeout_secs,
            ids_always_inline,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Partial override read from TOML; unset fields keep the default.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct PolicyOverride {
    threshold: Option<u64>,
    timeout_secs: Option<u64>,
    ids_always_inline: Option<bool>,
}

/// Per-kind routing rules.
///
/// ```toml
/// [delete]
/// threshold = 500
/// timeout_secs = 1800
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteTable {
    policies: HashMap<OperationKind, RoutePolicy>,
}

impl Default for RouteTable {
    fn default() -> Self {
        let policies = OperationKind::ALL
            .into_iter()
            .map(|kind| (kind, Self::default_policy(kind)))
            .collect();
        Self { policies }
    }
}

impl RouteTable {
    pub fn default_policy(kind: OperationKind) -> RoutePolicy {
        match kind {
            OperationKind::Import => RoutePolicy::new(200, 10 * 60, false),
            OperationKind::Delete => RoutePolicy::new(1000, 60 * 60, false),
            OperationKind::Priority => RoutePolicy::new(1000, 10 * 60, true),
            OperationKind::Redundancy => RoutePolicy::new(1000, 10 * 60, true),
            // Exports always run on the worker.
            OperationKind::Export => RoutePolicy::new(0, 20 * 60, false),
        }
    }

    pub fn get(&self, kind: OperationKind) -> RoutePolicy {
        self.policies
            .get(&kind)
            .copied()
            .unwrap_or_else(|| Self::default_policy(kind))
    }

    pub fn set(&mut self, kind: OperationKind, policy: RoutePolicy) {
        self.policies.insert(kind, policy);
    }

    /// Parse overrides on top of the defaults. Unknown kinds or fields are
    /// errors.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let overrides: HashMap<String, PolicyOverride> = toml::from_str(content)
            .map_err(|e| Error::Config(format!("bad route table: {e}")))?;

        let mut table = Self::default();
        for (name, o) in overrides {
            let kind = OperationKind::ALL
                .into_iter()
                .find(|k| k.as_str() == name)
                .ok_or_else(|| {
                    Error::Config(format!("unknown operation kind in route table: {name}"))
                })?;
            let mut policy = table.get(kind);
            if let Some(threshold) = o.threshold {
                policy.threshold = threshold;
            }
            if let Some(timeout_secs) = o.timeout_secs {
                if timeout_secs == 0 {
                    return Err(Error::Config(format!("{kind}: timeout_secs must be positive")));
                }
                policy.timeout_secs = timeout_secs;
            }
            if let Some(inline) = o.ids_always_inline {
                policy.ids_always_inline = inline;
            }
            table.set(kind, policy);
        }
        Ok(table)
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| {
                Error::Config(format!("cannot read route table {}: {e}", path.display()))
            })?;
        Self::from_toml_str(&content)
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// What happened to a routed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Ran synchronously; the report is final.
    Inline(BulkReport),
    /// Accepted by the worker queue; the result arrives out of band.
    Enqueued { job_id: JobId, msg_id: i64 },
}

impl RouteOutcome {
    pub fn is_enqueued(&self) -> bool {
        matches!(self, RouteOutcome::Enqueued { .. })
    }
}

#[derive(Clone)]
pub struct BulkRouter {
    repo: Arc<dyn TaskRepository>,
    queue: Arc<dyn WorkerQueue>,
    executor: Executor,
    table: RouteTable,
}

impl BulkRouter {
    pub fn new(
        repo: Arc<dyn TaskRepository>,
        queue: Arc<dyn WorkerQueue>,
        executor: Executor,
        table: RouteTable,
    ) -> Self {
        Self {
            repo,
            queue,
            executor,
            table,
        }
    }

    pub fn table(&self) -> &RouteTable {
        &self.table
    }

    /// Validate, estimate, then run inline or enqueue.
    ///
    /// An enqueue failure is returned as `Error::Enqueue`; nothing has been
    /// mutated at that point.
    pub async fn route(&self, mut job: BulkJob) -> Result<RouteOutcome> {
        let kind = job.kind();
        let policy = self.table.get(kind);
        let span = spans::start_bulk_span(kind.as_str(), &job.id.to_string(), job.project_id.0);

        async move {
            self.validate(&job)?;
            self.repo.get_project(job.project_id).await?;

            job.estimate = self.estimate(&job).await?;
            let inline = match (&job.selector, kind) {
                (Selector::Ids(_), OperationKind::Priority | OperationKind::Redundancy) => {
                    policy.ids_always_inline || job.estimate < policy.threshold
                }
                _ => job.estimate < policy.threshold,
            };

            let route = if inline { "inline" } else { "enqueued" };
            spans::record_route(&tracing::Span::current(), job.estimate, route);
            metrics::bulk_routed().add(
                1,
                &[
                    KeyValue::new("kind", kind.as_str()),
                    KeyValue::new("route", route),
                ],
            );

            if inline {
                let report = self.executor.execute(&job).await?;
                return Ok(RouteOutcome::Inline(report));
            }

            let payload = serde_json::to_value(&job)?;
            let msg_id = self
                .queue
                .enqueue(kind, &payload, policy.timeout())
                .await
                .map_err(|e| match e {
                    Error::Enqueue(_) => e,
                    other => Error::Enqueue(other.to_string()),
                })?;

            info!(job = %job.id, msg_id, queue = kind.queue_name(), "bulk job enqueued");
            Ok(RouteOutcome::Enqueued {
                job_id: job.id,
                msg_id,
            })
        }
        .instrument(span)
        .await
    }

    fn validate(&self, job: &BulkJob) -> Result<()> {
        match &job.operation {
            BulkOperation::Import { tasks } => {
                for task in tasks {
                    task.validate()?;
                }
                Ok(())
            }
            BulkOperation::SetPriority { priority } if !priority.is_finite() => {
                Err(Error::InvalidPriority(*priority))
            }
            BulkOperation::SetRedundancy { n_answers: 0 } => Err(Error::InvalidRedundancy(0)),
            _ => job.selector.validate(),
        }
    }

    /// Explicit list length, imported task count, or a count resolved from
    /// the filter.
    async fn estimate(&self, job: &BulkJob) -> Result<u64> {
        if let BulkOperation::Import { tasks } = &job.operation {
            return Ok(tasks.len() as u64);
        }
        match job.selector.explicit_len() {
            Some(n) => Ok(n),
            None => {
                self.repo
                    .count_tasks(job.project_id, &job.selector.to_filter())
                    .await
            }
        }
    }
}
