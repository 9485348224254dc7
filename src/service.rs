//! Administrative and contributor API.
//!
//! `TaskService` wires the scheduler, guard, tracker and router together
//! and is what the binary (or any embedding server) talks to.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::bulk::Executor;
use crate::error::{Error, Result};
use crate::guard::ContributionGuard;
use crate::lock::LockStore;
use crate::model::*;
use crate::queue::WorkerQueue;
use crate::repo::TaskRepository;
use crate::router::{BulkRouter, RouteOutcome, RouteTable};
use crate::sched::{Scheduler, SchedulerPolicy};
use crate::telemetry::metrics;
use crate::tracker::RedundancyTracker;

/// One requester's relationship to a task, for status reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Contribution {
    Completed,
    Locked { remaining_secs: u64 },
}

#[derive(Debug, Clone, Serialize)]
pub struct ContributorStatus {
    pub requester: Requester,
    #[serde(flatten)]
    pub contribution: Contribution,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskStatus {
    pub task: Task,
    pub recorded: u32,
    pub contributors: Vec<ContributorStatus>,
}

#[derive(Clone)]
pub struct TaskService {
    repo: Arc<dyn TaskRepository>,
    guard: ContributionGuard,
    scheduler: Scheduler,
    tracker: RedundancyTracker,
    router: BulkRouter,
    require_reservation: bool,
}

impl TaskService {
    pub fn new(
        repo: Arc<dyn TaskRepository>,
        locks: Arc<dyn LockStore>,
        queue: Arc<dyn WorkerQueue>,
        routes: RouteTable,
    ) -> Self {
        let guard = ContributionGuard::new(locks);
        let tracker = RedundancyTracker::new(repo.clone());
        let executor = Executor::new(repo.clone(), tracker.clone());
        Self {
            scheduler: Scheduler::new(repo.clone(), guard.clone()),
            router: BulkRouter::new(repo.clone(), queue, executor, routes),
            repo,
            guard,
            tracker,
            require_reservation: true,
        }
    }

    /// Accept answers from requesters without a live reservation.
    pub fn require_reservation(mut self, required: bool) -> Self {
        self.require_reservation = required;
        self
    }

    pub fn guard(&self) -> &ContributionGuard {
        &self.guard
    }

    pub fn router(&self) -> &BulkRouter {
        &self.router
    }

    // -----------------------------------------------------------------------
    // Projects
    // -----------------------------------------------------------------------

    pub async fn create_project(&self, new: NewProject) -> Result<Project> {
        if new.task_timeout.is_zero() {
            return Err(Error::InvalidTtl("task timeout must be positive".to_string()));
        }
        let project = self.repo.create_project(new).await?;
        info!(
            project = %project.id,
            name = %project.short_name,
            scheduler = %project.scheduler,
            "project created"
        );
        Ok(project)
    }

    /// Change a project's scheduler and/or reservation timeout.
    pub async fn configure_project(
        &self,
        id: ProjectId,
        scheduler: Option<SchedulerPolicy>,
        task_timeout: Option<Duration>,
    ) -> Result<Project> {
        let mut project = self.repo.get_project(id).await?;
        if let Some(scheduler) = scheduler {
            project.scheduler = scheduler;
        }
        if let Some(timeout) = task_timeout {
            if timeout.is_zero() {
                return Err(Error::InvalidTtl("task timeout must be positive".to_string()));
            }
            project.task_timeout = timeout;
        }
        let project = self.repo.update_project(&project).await?;
        info!(
            project = %project.id,
            scheduler = %project.scheduler,
            timeout_secs = project.task_timeout.as_secs(),
            "project configured"
        );
        Ok(project)
    }

    /// Replace the explicit assignment list used by the locked scheduler.
    pub async fn assign(
        &self,
        project: ProjectId,
        requester: &Requester,
        tasks: &[TaskId],
    ) -> Result<()> {
        self.repo.get_project(project).await?;
        self.repo.assign(project, requester, tasks).await
    }

    // -----------------------------------------------------------------------
    // Contributors
    // -----------------------------------------------------------------------

    /// Pick a task and reserve it for `requester`.
    ///
    /// `Ok(None)` covers both "nothing eligible" and losing a race for the
    /// last slot of a task.
    pub async fn next_task(
        &self,
        project: ProjectId,
        requester: &Requester,
        offset: usize,
    ) -> Result<Option<Task>> {
        let project = self.repo.get_project(project).await?;
        let Some(task) = self
            .scheduler
            .next_task(project.id, project.scheduler, requester, offset)
            .await?
        else {
            return Ok(None);
        };

        if !self.guard.acquire(&task, requester, project.task_timeout).await? {
            debug!(task = %task.id, %requester, "reservation already held");
            self.record_contention(project.scheduler);
            return Ok(None);
        }

        if project.scheduler.caps_reservations() && !self.within_slots(&task, requester).await? {
            self.guard.release(&task, requester).await?;
            debug!(task = %task.id, %requester, "lost the race for the last slot");
            self.record_contention(project.scheduler);
            return Ok(None);
        }

        Ok(Some(task))
    }

    /// After acquiring, check this requester's reservation still fits in the
    /// task's remaining slots. Reservations are ranked oldest first (least
    /// time left), ties by requester, so every racer sees the same winners.
    async fn within_slots(&self, task: &Task, requester: &Requester) -> Result<bool> {
        let recorded = self.repo.count_answers(task.id).await?;
        let remaining = task.n_answers.saturating_sub(recorded) as usize;
        let locks = self.guard.active_locks(task.project_id, task.id).await?;

        let mut ranked: Vec<(&Requester, &Duration)> = locks.iter().collect();
        ranked.sort_by(|a, b| a.1.cmp(b.1).then_with(|| a.0.cmp(b.0)));
        let rank = ranked.iter().position(|(r, _)| *r == requester);

        Ok(rank.is_some_and(|rank| rank < remaining))
    }

    fn record_contention(&self, policy: SchedulerPolicy) {
        metrics::tasks_scheduled().add(
            1,
            &[
                KeyValue::new("policy", policy.as_str()),
                KeyValue::new("result", "contended"),
            ],
        );
    }

    /// The task is being shown to the requester: re-stamp their reservation
    /// and record first presentation. Returns the first-presentation time.
    pub async fn present_task(
        &self,
        project: ProjectId,
        task: TaskId,
        requester: &Requester,
    ) -> Result<DateTime<Utc>> {
        let project = self.repo.get_project(project).await?;
        let task = self.task_in(project.id, task).await?;
        self.guard.refresh(&task, requester, project.task_timeout).await?;
        self.guard.mark_presented(&task, requester).await
    }

    /// Record an answer and release the requester's reservation.
    pub async fn submit_answer(
        &self,
        project: ProjectId,
        task: TaskId,
        requester: &Requester,
        info: serde_json::Value,
    ) -> Result<Task> {
        let task = self.task_in(project, task).await?;

        if self.repo.has_answered(task.id, requester).await? {
            return Err(Error::AlreadyAnswered {
                task: task.id,
                requester: requester.to_string(),
            });
        }
        if self.require_reservation && !self.guard.is_reserved(&task, requester).await? {
            return Err(Error::NotReserved {
                task: task.id,
                requester: requester.to_string(),
            });
        }

        let updated = self
            .tracker
            .record_answer(NewAnswer {
                task_id: task.id,
                project_id: project,
                requester: requester.clone(),
                info,
            })
            .await?;

        // The answer is durable; a stale reservation just runs out its TTL.
        if let Err(e) = self.guard.release(&task, requester).await {
            warn!(
                task = %task.id,
                %requester,
                error = %e,
                "failed to release reservation after answer"
            );
        }
        Ok(updated)
    }

    pub async fn task_status(&self, project: ProjectId, task: TaskId) -> Result<TaskStatus> {
        let task = self.task_in(project, task).await?;
        let answers = self.repo.answers_for(task.id).await?;
        let locks = self.guard.active_locks(project, task.id).await?;

        let mut contributors: Vec<ContributorStatus> = answers
            .iter()
            .map(|a| ContributorStatus {
                requester: a.requester.clone(),
                contribution: Contribution::Completed,
            })
            .collect();
        let mut locked: Vec<ContributorStatus> = locks
            .into_iter()
            .filter(|(r, _)| !answers.iter().any(|a| &a.requester == r))
            .map(|(requester, remaining)| ContributorStatus {
                requester,
                contribution: Contribution::Locked {
                    remaining_secs: remaining.as_secs(),
                },
            })
            .collect();
        locked.sort_by(|a, b| a.requester.cmp(&b.requester));
        contributors.extend(locked);

        Ok(TaskStatus {
            recorded: answers.len() as u32,
            task,
            contributors,
        })
    }

    async fn task_in(&self, project: ProjectId, id: TaskId) -> Result<Task> {
        let task = self.repo.get_task(id).await?;
        if task.project_id != project {
            return Err(Error::WrongProject {
                task: id,
                project: project.0,
            });
        }
        Ok(task)
    }

    // -----------------------------------------------------------------------
    // Bulk administration
    // -----------------------------------------------------------------------

    pub async fn set_priority(
        &self,
        project: ProjectId,
        selector: Selector,
        priority: f64,
        requested_by: &str,
    ) -> Result<RouteOutcome> {
        self.router
            .route(BulkJob::new(
                project,
                selector,
                BulkOperation::SetPriority { priority },
                requested_by,
            ))
            .await
    }

    pub async fn set_redundancy(
        &self,
        project: ProjectId,
        selector: Selector,
        n_answers: u32,
        requested_by: &str,
    ) -> Result<RouteOutcome> {
        self.router
            .route(BulkJob::new(
                project,
                selector,
                BulkOperation::SetRedundancy { n_answers },
                requested_by,
            ))
            .await
    }

    /// Without `force`, tasks that already collected answers are kept.
    pub async fn delete_tasks(
        &self,
        project: ProjectId,
        selector: Selector,
        force: bool,
        requested_by: &str,
    ) -> Result<RouteOutcome> {
        self.router
            .route(BulkJob::new(project, selector, BulkOperation::Delete { force }, requested_by))
            .await
    }

    pub async fn export_tasks(
        &self,
        project: ProjectId,
        selector: Selector,
        requested_by: &str,
    ) -> Result<RouteOutcome> {
        self.router
            .route(BulkJob::new(project, selector, BulkOperation::Export, requested_by))
            .await
    }

    pub async fn import_tasks(
        &self,
        project: ProjectId,
        tasks: Vec<NewTask>,
        requested_by: &str,
    ) -> Result<RouteOutcome> {
        self.router.route(BulkJob::import(project, tasks, requested_by)).await
    }
}
