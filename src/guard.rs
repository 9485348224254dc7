//! Contribution guard: per-(task, requester) reservations and presentation
//! stamps on top of a [`LockStore`].
//!
//! The guard never retries a failed store call. A lock store that is down
//! must surface as an error, not as "nothing reserved", or the scheduler
//! would hand the same slot out twice.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use tracing::debug;

use crate::error::{Error, Result};
use crate::lock::{LockKey, LockStore};
use crate::model::{ProjectId, Requester, Task, TaskId};
use crate::telemetry::metrics;

/// Presentation stamps outlive reservations; they are for accounting.
pub const DEFAULT_PRESENTED_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Live reservations on one task: requester → remaining TTL.
pub type TaskLocks = HashMap<Requester, Duration>;

#[derive(Clone)]
pub struct ContributionGuard {
    store: Arc<dyn LockStore>,
    presented_ttl: Duration,
}

impl ContributionGuard {
    pub fn new(store: Arc<dyn LockStore>) -> Self {
        Self {
            store,
            presented_ttl: DEFAULT_PRESENTED_TTL,
        }
    }

    pub fn with_presented_ttl(mut self, ttl: Duration) -> Self {
        self.presented_ttl = ttl;
        self
    }

    /// Reserve `task` for `requester`. Returns `false` if the requester
    /// already holds a live reservation; the existing one is left untouched.
    pub async fn acquire(&self, task: &Task, requester: &Requester, ttl: Duration) -> Result<bool> {
        check_ttl(ttl)?;
        let key = LockKey::reservation(task.project_id, task.id, requester);
        let acquired = self
            .store
            .set_if_absent_or_expired(&key.encode(), &expiry_value(ttl), ttl)
            .await?;

        debug!(task = %task.id, %requester, acquired, "reservation acquire");
        metrics::reservations().add(
            1,
            &[KeyValue::new(
                "result",
                if acquired { "acquired" } else { "held" },
            )],
        );
        Ok(acquired)
    }

    /// Explicitly re-stamp a reservation, restarting its TTL.
    pub async fn refresh(&self, task: &Task, requester: &Requester, ttl: Duration) -> Result<()> {
        check_ttl(ttl)?;
        let key = LockKey::reservation(task.project_id, task.id, requester);
        self.store.set(&key.encode(), &expiry_value(ttl), ttl).await?;
        metrics::reservations().add(1, &[KeyValue::new("result", "refreshed")]);
        Ok(())
    }

    /// Drop a reservation ahead of its TTL.
    pub async fn release(&self, task: &Task, requester: &Requester) -> Result<bool> {
        let key = LockKey::reservation(task.project_id, task.id, requester);
        let released = self.store.delete(&key.encode()).await?;
        if released {
            metrics::reservations().add(1, &[KeyValue::new("result", "released")]);
        }
        Ok(released)
    }

    pub async fn is_reserved(&self, task: &Task, requester: &Requester) -> Result<bool> {
        let key = LockKey::reservation(task.project_id, task.id, requester);
        Ok(self.store.get(&key.encode()).await?.is_some())
    }

    pub async fn has_presented(&self, task: &Task, requester: &Requester) -> Result<bool> {
        Ok(self.presented_at(task, requester).await?.is_some())
    }

    /// When the task was first presented to the requester, if ever.
    pub async fn presented_at(
        &self,
        task: &Task,
        requester: &Requester,
    ) -> Result<Option<DateTime<Utc>>> {
        let key = LockKey::presented(task.project_id, task.id, requester);
        Ok(self
            .store
            .get(&key.encode())
            .await?
            .and_then(|v| DateTime::parse_from_rfc3339(&v).ok())
            .map(|t| t.with_timezone(&Utc)))
    }

    /// Stamp first presentation. Idempotent: later calls keep the first
    /// timestamp, which is returned.
    pub async fn mark_presented(
        &self,
        task: &Task,
        requester: &Requester,
    ) -> Result<DateTime<Utc>> {
        let key = LockKey::presented(task.project_id, task.id, requester).encode();
        let now = Utc::now();
        if self
            .store
            .set_if_absent_or_expired(&key, &now.to_rfc3339(), self.presented_ttl)
            .await?
        {
            return Ok(now);
        }
        let stored = self
            .store
            .get(&key)
            .await?
            .and_then(|v| DateTime::parse_from_rfc3339(&v).ok())
            .map(|t| t.with_timezone(&Utc));
        // Expired between the two calls; the stamp we tried to write is as good as any.
        Ok(stored.unwrap_or(now))
    }

    /// Every live reservation on a task.
    pub async fn active_locks(&self, project: ProjectId, task: TaskId) -> Result<TaskLocks> {
        let prefix = LockKey::task_reservations(project, task);
        let mut locks = TaskLocks::new();
        for entry in self.store.scan(&prefix).await? {
            if let Some((_, _, requester)) = LockKey::decode_reservation(&entry.key) {
                locks.insert(requester, entry.remaining);
            }
        }
        Ok(locks)
    }

    /// Every live reservation in a project, grouped by task. One store scan.
    pub async fn project_locks(&self, project: ProjectId) -> Result<HashMap<TaskId, TaskLocks>> {
        let prefix = LockKey::project_reservations(project);
        let mut by_task: HashMap<TaskId, TaskLocks> = HashMap::new();
        for entry in self.store.scan(&prefix).await? {
            if let Some((_, task, requester)) = LockKey::decode_reservation(&entry.key) {
                by_task.entry(task).or_default().insert(requester, entry.remaining);
            }
        }
        Ok(by_task)
    }
}

fn check_ttl(ttl: Duration) -> Result<()> {
    if ttl.is_zero() {
        return Err(Error::InvalidTtl("reservation ttl must be positive".to_string()));
    }
    Ok(())
}

fn expiry_value(ttl: Duration) -> String {
    let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
    Utc::now()
        .checked_add_signed(ttl)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
        .to_rfc3339()
}
