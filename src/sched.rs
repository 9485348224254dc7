//! Task scheduler: picks the next task for a requester.
//!
//! Selection and reservation are separate steps. The scheduler reads the
//! repository and the guard's live reservations, filters and orders
//! candidates by policy, and returns at most one task. It never writes to
//! the lock store and holds no lock across the scan; racing requesters are
//! sorted out afterwards by the guard's atomic acquire.

use std::collections::HashMap;
use std::sync::Arc;

use opentelemetry::KeyValue;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tracing::{Instrument, debug};

use crate::error::{Error, Result};
use crate::guard::{ContributionGuard, TaskLocks};
use crate::model::{OpenTask, ProjectId, Requester, Task, TaskId};
use crate::repo::TaskRepository;
use crate::telemetry::{metrics, spans};

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// Task-ordering strategy, configured per project.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerPolicy {
    /// Highest priority first, ties broken by ascending id.
    #[default]
    #[serde(alias = "default")]
    PriorityFirst,
    /// Oldest submission first.
    DepthFirst,
    /// Newest submission first.
    BreadthFirst,
    /// Uniform draw among the tasks sharing the highest priority.
    Random,
    /// Only tasks on the requester's explicit assignment list, in list order.
    #[serde(alias = "locked_scheduler")]
    Locked,
}

impl SchedulerPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            SchedulerPolicy::PriorityFirst => "priority_first",
            SchedulerPolicy::DepthFirst => "depth_first",
            SchedulerPolicy::BreadthFirst => "breadth_first",
            SchedulerPolicy::Random => "random",
            SchedulerPolicy::Locked => "locked",
        }
    }

    /// Whether concurrent reservations by other requesters are capped at the
    /// task's remaining answer slots. Explicit assignment bypasses the cap.
    pub fn caps_reservations(self) -> bool {
        !matches!(self, SchedulerPolicy::Locked)
    }

    /// Order (and for `Locked`, restrict) eligible candidates, then pick the
    /// one at `offset`.
    pub fn select(
        self,
        mut candidates: Vec<OpenTask>,
        assignments: &[TaskId],
        offset: usize,
    ) -> Option<Task> {
        match self {
            SchedulerPolicy::PriorityFirst => {
                candidates.sort_by(|a, b| {
                    b.task
                        .priority
                        .total_cmp(&a.task.priority)
                        .then(a.task.id.cmp(&b.task.id))
                });
            }
            SchedulerPolicy::DepthFirst => {
                candidates.sort_by(|a, b| {
                    a.task
                        .created_at
                        .cmp(&b.task.created_at)
                        .then(a.task.id.cmp(&b.task.id))
                });
            }
            SchedulerPolicy::BreadthFirst => {
                candidates.sort_by(|a, b| {
                    b.task
                        .created_at
                        .cmp(&a.task.created_at)
                        .then(b.task.id.cmp(&a.task.id))
                });
            }
            SchedulerPolicy::Random => {
                let top = candidates
                    .iter()
                    .map(|c| c.task.priority)
                    .max_by(f64::total_cmp)?;
                let band: Vec<OpenTask> = candidates
                    .into_iter()
                    .filter(|c| c.task.priority == top)
                    .collect();
                return band.choose(&mut rand::thread_rng()).map(|c| c.task.clone());
            }
            SchedulerPolicy::Locked => {
                let mut by_id: HashMap<TaskId, OpenTask> =
                    candidates.into_iter().map(|c| (c.task.id, c)).collect();
                candidates = assignments.iter().filter_map(|id| by_id.remove(id)).collect();
            }
        }
        candidates.into_iter().nth(offset).map(|c| c.task)
    }
}

impl std::fmt::Display for SchedulerPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SchedulerPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "priority_first" | "default" => Ok(SchedulerPolicy::PriorityFirst),
            "depth_first" => Ok(SchedulerPolicy::DepthFirst),
            "breadth_first" => Ok(SchedulerPolicy::BreadthFirst),
            "random" => Ok(SchedulerPolicy::Random),
            "locked" | "locked_scheduler" => Ok(SchedulerPolicy::Locked),
            _ => Err(Error::Config(format!("unknown scheduler policy: {s}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Eligibility
// ---------------------------------------------------------------------------

/// Apply the reservation rules to one candidate. `locks` are the task's
/// live reservations, including the requester's own.
pub fn is_eligible(
    candidate: &OpenTask,
    locks: Option<&TaskLocks>,
    requester: &Requester,
    cap: bool,
) -> bool {
    let Some(locks) = locks else {
        return true;
    };
    // Already working on it inside its own reservation window.
    if locks.contains_key(requester) {
        return false;
    }
    if !cap {
        return true;
    }
    let remaining = candidate.task.n_answers.saturating_sub(candidate.recorded) as usize;
    let others = locks.keys().filter(|r| *r != requester).count();
    others < remaining
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Scheduler {
    repo: Arc<dyn TaskRepository>,
    guard: ContributionGuard,
}

impl Scheduler {
    pub fn new(repo: Arc<dyn TaskRepository>, guard: ContributionGuard) -> Self {
        Self { repo, guard }
    }

    /// Next task for `requester`, skipping `offset` eligible candidates.
    /// `Ok(None)` means nothing is eligible right now; store failures are
    /// errors, never an empty result.
    pub async fn next_task(
        &self,
        project: ProjectId,
        policy: SchedulerPolicy,
        requester: &Requester,
        offset: usize,
    ) -> Result<Option<Task>> {
        let span = spans::start_schedule_span(project.0, policy.as_str(), &requester.to_string());

        async {
            let open = self.repo.open_tasks(project, requester).await?;
            let locks = self.guard.project_locks(project).await?;
            let assignments = if policy == SchedulerPolicy::Locked {
                self.repo.assignments(project, requester).await?
            } else {
                Vec::new()
            };

            let scanned = open.len();
            let candidates: Vec<OpenTask> = open
                .into_iter()
                .filter(|c| {
                    is_eligible(c, locks.get(&c.task.id), requester, policy.caps_reservations())
                })
                .collect();

            debug!(scanned, eligible = candidates.len(), "candidate scan");

            let picked = policy.select(candidates, &assignments, offset);
            metrics::tasks_scheduled().add(
                1,
                &[
                    KeyValue::new("policy", policy.as_str()),
                    KeyValue::new("result", if picked.is_some() { "task" } else { "empty" }),
                ],
            );
            if let Some(ref task) = picked {
                spans::record_scheduled_task(&tracing::Span::current(), task.id.0);
            }
            Ok(picked)
        }
        .instrument(span)
        .await
    }
}
