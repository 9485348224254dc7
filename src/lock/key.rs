//! Typed lock-store keys.
//!
//! Every string that reaches the lock store is produced here. Reservations
//! and presentation stamps live in separate namespaces so that a prefix scan
//! for one never sees the other.

use crate::model::{ProjectId, Requester, TaskId};

const RESERVATION: &str = "reservation";
const PRESENTED: &str = "presented";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LockKey {
    /// A requester is working on a task.
    Reservation {
        project: ProjectId,
        task: TaskId,
        requester: Requester,
    },
    /// The task was first shown to the requester at the stored timestamp.
    Presented {
        project: ProjectId,
        task: TaskId,
        requester: Requester,
    },
}

impl LockKey {
    pub fn reservation(project: ProjectId, task: TaskId, requester: &Requester) -> Self {
        LockKey::Reservation {
            project,
            task,
            requester: requester.clone(),
        }
    }

    pub fn presented(project: ProjectId, task: TaskId, requester: &Requester) -> Self {
        LockKey::Presented {
            project,
            task,
            requester: requester.clone(),
        }
    }

    pub fn encode(&self) -> String {
        match self {
            LockKey::Reservation {
                project,
                task,
                requester,
            } => format!("{}{requester}", task_prefix(RESERVATION, *project, *task)),
            LockKey::Presented {
                project,
                task,
                requester,
            } => format!("{}{requester}", task_prefix(PRESENTED, *project, *task)),
        }
    }

    /// Prefix matching every reservation on one task.
    pub fn task_reservations(project: ProjectId, task: TaskId) -> String {
        task_prefix(RESERVATION, project, task)
    }

    /// Prefix matching every reservation in a project.
    pub fn project_reservations(project: ProjectId) -> String {
        format!("{RESERVATION}:project:{project}:task:")
    }

    /// Decode a reservation key produced by [`LockKey::encode`]. Returns
    /// `None` for anything else.
    pub fn decode_reservation(key: &str) -> Option<(ProjectId, TaskId, Requester)> {
        let rest = key.strip_prefix(RESERVATION)?.strip_prefix(":project:")?;
        let (project, rest) = rest.split_once(':')?;
        let rest = rest.strip_prefix("task:")?;
        let (task, requester) = rest.split_once(':')?;
        Some((
            ProjectId(project.parse().ok()?),
            TaskId(task.parse().ok()?),
            requester.parse().ok()?,
        ))
    }
}

impl std::fmt::Display for LockKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.encode())
    }
}

fn task_prefix(namespace: &str, project: ProjectId, task: TaskId) -> String {
    format!("{namespace}:project:{project}:task:{task}:")
}
