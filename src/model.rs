//! Core data model.
//!
//! A task is a unit of work that needs `n_answers` independent answers from
//! distinct requesters. It has identity, an owning project, a priority, and a
//! lifecycle state derived from how many answers have been recorded.

pub mod filter;
pub mod job;
pub mod project;

pub use filter::{Selector, TaskFilter};
pub use job::{BulkJob, BulkOperation, JobId, OperationKind};
pub use project::{NewProject, Project, ProjectId};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// A unit of work distributed to requesters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,

    pub project_id: ProjectId,

    /// Higher = scheduled sooner.
    pub priority: f64,

    /// Redundancy: answers required before the task is complete. Always >= 1.
    pub n_answers: u32,

    /// Derived from the recorded answer count; see [`TaskState::derive`].
    pub state: TaskState,

    /// Whether the task's results were already delivered downstream.
    pub exported: bool,

    /// Opaque payload shown to the requester. Never interpreted here.
    pub info: serde_json::Value,

    /// Optimistic-concurrency version, bumped on every update.
    pub version: i64,

    pub created_at: DateTime<Utc>,
}

/// Newtype for task IDs. Ordered by submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub i64);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Still collecting answers.
    Ongoing,
    /// Recorded answers >= n_answers.
    Completed,
}

impl TaskState {
    /// The only way a state is ever computed: from the authoritative count.
    pub fn derive(recorded: u32, n_answers: u32) -> Self {
        if recorded >= n_answers {
            TaskState::Completed
        } else {
            TaskState::Ongoing
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Ongoing => "ongoing",
            TaskState::Completed => "completed",
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskState {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ongoing" => Ok(TaskState::Ongoing),
            "completed" => Ok(TaskState::Completed),
            _ => Err(crate::error::Error::Other(format!("unknown task state: {s}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Requester
// ---------------------------------------------------------------------------

/// Who is asking for work: an authenticated user or an anonymous address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Requester {
    User(i64),
    Anonymous(String),
}

impl std::fmt::Display for Requester {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Requester::User(id) => write!(f, "user:{id}"),
            Requester::Anonymous(addr) => write!(f, "ip:{addr}"),
        }
    }
}

impl std::str::FromStr for Requester {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || crate::error::Error::Other(format!("invalid requester: {s}"));
        match s.split_once(':') {
            Some(("user", id)) => id.parse().map(Requester::User).map_err(|_| bad()),
            Some(("ip", addr)) if !addr.is_empty() => Ok(Requester::Anonymous(addr.to_string())),
            _ => Err(bad()),
        }
    }
}

impl TryFrom<String> for Requester {
    type Error = crate::error::Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Requester> for String {
    fn from(r: Requester) -> Self {
        r.to_string()
    }
}

// ---------------------------------------------------------------------------
// Answers
// ---------------------------------------------------------------------------

/// One recorded answer. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Answer {
    pub id: i64,
    pub task_id: TaskId,
    pub project_id: ProjectId,
    pub requester: Requester,
    pub info: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewAnswer {
    pub task_id: TaskId,
    pub project_id: ProjectId,
    pub requester: Requester,
    pub info: serde_json::Value,
}

/// An ongoing task plus its authoritative answer count, as seen by one
/// scheduling scan.
#[derive(Debug, Clone)]
pub struct OpenTask {
    pub task: Task,
    pub recorded: u32,
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for importing tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    pub(crate) info: serde_json::Value,
    #[serde(default)]
    pub(crate) priority: f64,
    #[serde(default = "default_n_answers")]
    pub(crate) n_answers: u32,
}

fn default_n_answers() -> u32 {
    1
}

impl NewTask {
    pub fn new(info: serde_json::Value) -> Self {
        Self {
            info,
            priority: 0.0,
            n_answers: default_n_answers(),
        }
    }

    pub fn priority(mut self, priority: f64) -> Self {
        self.priority = priority;
        self
    }

    pub fn n_answers(mut self, n: u32) -> Self {
        self.n_answers = n;
        self
    }

    pub fn validate(&self) -> crate::error::Result<()> {
        if self.n_answers == 0 {
            return Err(crate::error::Error::InvalidRedundancy(self.n_answers));
        }
        if !self.priority.is_finite() {
            return Err(crate::error::Error::InvalidPriority(self.priority));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_is_derived_from_counts() {
        assert_eq!(TaskState::derive(0, 1), TaskState::Ongoing);
        assert_eq!(TaskState::derive(1, 1), TaskState::Completed);
        assert_eq!(TaskState::derive(1, 3), TaskState::Ongoing);
        assert_eq!(TaskState::derive(5, 3), TaskState::Completed);
    }

    #[test]
    fn requester_text_form() {
        assert_eq!(Requester::User(7).to_string(), "user:7");
        assert_eq!(
            "ip:10.0.0.1".parse::<Requester>().unwrap(),
            Requester::Anonymous("10.0.0.1".into())
        );
        assert!("user:abc".parse::<Requester>().is_err());
        assert!("ip:".parse::<Requester>().is_err());
        assert!("bogus".parse::<Requester>().is_err());
    }

    #[test]
    fn new_task_rejects_zero_redundancy() {
        assert!(NewTask::new(serde_json::json!({})).n_answers(0).validate().is_err());
        assert!(NewTask::new(serde_json::json!({})).n_answers(2).validate().is_ok());
    }
}
