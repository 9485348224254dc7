//! Project configuration read by the scheduler and the guard.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::sched::SchedulerPolicy;

/// Reservation TTL used when a project does not configure its own.
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectId(pub i64);

impl std::fmt::Display for ProjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A project owns tasks and selects how they are handed out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub short_name: String,
    pub scheduler: SchedulerPolicy,
    /// How long a reservation lives before an abandoned task is re-offered.
    pub task_timeout: Duration,
    pub created_at: DateTime<Utc>,
}

/// Parameters for creating a project.
#[derive(Debug, Clone)]
pub struct NewProject {
    pub short_name: String,
    pub scheduler: SchedulerPolicy,
    pub task_timeout: Duration,
}

impl NewProject {
    pub fn new(short_name: impl Into<String>) -> Self {
        Self {
            short_name: short_name.into(),
            scheduler: SchedulerPolicy::default(),
            task_timeout: DEFAULT_TASK_TIMEOUT,
        }
    }

    pub fn scheduler(mut self, scheduler: SchedulerPolicy) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }
}
