//! Redundancy and completion tracking.
//!
//! A task's state is never stored-and-incremented. Every mutation re-reads
//! the task row and the authoritative answer count, applies its change,
//! re-derives the state, and writes back under the row's version. A version
//! mismatch means someone else got there first; the whole read-apply-write
//! is then repeated from fresh data.

use std::sync::Arc;

use opentelemetry::KeyValue;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::model::{NewAnswer, Task, TaskId, TaskState};
use crate::repo::TaskRepository;
use crate::telemetry::metrics;

/// Bound on optimistic retries for a single task row. Contention on one row
/// is short-lived, so running out means something is badly wrong.
const MAX_OCC_ATTEMPTS: u32 = 16;

/// How a redundancy edit changed a task's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedundancyEffect {
    /// Same state as before.
    Unchanged,
    /// Completed → ongoing; export invalidated.
    Reopened,
    /// Ongoing → completed by lowering the requirement.
    Completed,
}

impl RedundancyEffect {
    fn between(before: TaskState, after: TaskState) -> Self {
        match (before, after) {
            (TaskState::Completed, TaskState::Ongoing) => RedundancyEffect::Reopened,
            (TaskState::Ongoing, TaskState::Completed) => RedundancyEffect::Completed,
            _ => RedundancyEffect::Unchanged,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RedundancyEffect::Unchanged => "unchanged",
            RedundancyEffect::Reopened => "reopened",
            RedundancyEffect::Completed => "completed",
        }
    }
}

/// Apply a redundancy change to a task in memory, given its recorded count.
///
/// Raising `n_answers` past the recorded count on a completed task reopens
/// it and invalidates its export. Lowering it below the recorded count
/// completes the task and leaves `exported` alone; excess answers are kept.
pub fn apply_redundancy(task: &mut Task, recorded: u32, n_answers: u32) {
    if task.n_answers == n_answers {
        return;
    }
    if recorded < n_answers && task.state == TaskState::Completed {
        task.exported = false;
    }
    task.n_answers = n_answers;
    task.state = TaskState::derive(recorded, n_answers);
}

#[derive(Clone)]
pub struct RedundancyTracker {
    repo: Arc<dyn TaskRepository>,
}

impl RedundancyTracker {
    pub fn new(repo: Arc<dyn TaskRepository>) -> Self {
        Self { repo }
    }

    /// Append an answer. The repository re-derives the task's state in the
    /// same atomic step, so a recorded answer never leaves a stale state.
    pub async fn record_answer(&self, answer: NewAnswer) -> Result<Task> {
        let (_, task) = self.repo.append_answer(answer).await?;

        metrics::answers_recorded().add(1, &[KeyValue::new("state", task.state.as_str())]);
        debug!(task = %task.id, state = %task.state, "answer recorded");
        Ok(task)
    }

    /// Change a task's required answer count.
    pub async fn set_redundancy(
        &self,
        id: TaskId,
        n_answers: u32,
    ) -> Result<(Task, RedundancyEffect)> {
        if n_answers == 0 {
            return Err(Error::InvalidRedundancy(n_answers));
        }

        let mut before = TaskState::Ongoing;
        let task = self
            .update_with(id, |task, recorded| {
                before = task.state;
                apply_redundancy(task, recorded, n_answers);
            })
            .await?;

        let effect = RedundancyEffect::between(before, task.state);
        metrics::redundancy_changes().add(1, &[KeyValue::new("effect", effect.as_str())]);
        if effect == RedundancyEffect::Reopened {
            info!(task = %task.id, n_answers, "task reopened, export invalidated");
        }
        Ok((task, effect))
    }

    /// Change a task's priority. State is untouched.
    pub async fn set_priority(&self, id: TaskId, priority: f64) -> Result<Task> {
        if !priority.is_finite() {
            return Err(Error::InvalidPriority(priority));
        }
        self.update_with(id, |task, _| task.priority = priority).await
    }

    /// Flag a completed task as delivered downstream. Ongoing tasks are left
    /// alone; returns whether the flag was set by this call.
    pub async fn mark_exported(&self, id: TaskId) -> Result<bool> {
        let mut changed = false;
        self.update_with(id, |task, _| {
            changed = task.state == TaskState::Completed && !task.exported;
            if changed {
                task.exported = true;
            }
        })
        .await?;
        Ok(changed)
    }

    /// Re-derive a task's state without changing anything else. Repairs rows
    /// written by anything that bypassed the tracker.
    pub async fn recompute(&self, id: TaskId) -> Result<Task> {
        self.update_with(id, |_, _| {}).await
    }

    /// Optimistic read-apply-write on one task row.
    async fn update_with<F>(&self, id: TaskId, mut apply: F) -> Result<Task>
    where
        F: FnMut(&mut Task, u32) + Send,
    {
        for attempt in 1..=MAX_OCC_ATTEMPTS {
            let mut task = self.repo.get_task(id).await?;
            let recorded = self.repo.count_answers(id).await?;
            let original = task.clone();

            apply(&mut task, recorded);
            task.state = TaskState::derive(recorded, task.n_answers);

            if !differs(&original, &task) {
                return Ok(task);
            }

            match self.repo.update_task(&task).await {
                Ok(stored) => return Ok(stored),
                Err(Error::Conflict { .. }) => {
                    debug!(task = %id, attempt, "optimistic update lost, retrying");
                }
                Err(e) => return Err(e),
            }
        }
        Err(Error::Conflict { task: id })
    }
}

fn differs(a: &Task, b: &Task) -> bool {
    a.priority != b.priority
        || a.n_answers != b.n_answers
        || a.state != b.state
        || a.exported != b.exported
}
