//! Error types for crowdsched.

use thiserror::Error;

use crate::model::TaskId;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    /// Optimistic-concurrency check failed: the task row changed underneath us.
    #[error("concurrent update on task {task}")]
    Conflict { task: TaskId },

    #[error("invalid selector: {0}")]
    InvalidSelector(String),

    #[error("invalid redundancy {0}: n_answers must be at least 1")]
    InvalidRedundancy(u32),

    #[error("invalid priority {0}")]
    InvalidPriority(f64),

    #[error("invalid reservation ttl: {0}")]
    InvalidTtl(String),

    #[error("task {task} already answered by {requester}")]
    AlreadyAnswered { task: TaskId, requester: String },

    #[error("task {task} is not reserved by {requester}")]
    NotReserved { task: TaskId, requester: String },

    #[error("task {task} does not belong to project {project}")]
    WrongProject { task: TaskId, project: i64 },

    #[error("lock store unavailable: {0}")]
    LockStore(String),

    #[error("enqueue failed: {0}")]
    Enqueue(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Store or queue unavailability. Never retried inside the crate; callers
    /// decide whether to try again.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::LockStore(_) | Error::Enqueue(_) => true,
            Error::Storage(e) => matches!(
                e,
                sqlx::Error::Io(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
            ),
            _ => false,
        }
    }

    /// Errors caused by the caller's input rather than by the system.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidSelector(_)
                | Error::InvalidRedundancy(_)
                | Error::InvalidPriority(_)
                | Error::InvalidTtl(_)
                | Error::AlreadyAnswered { .. }
                | Error::NotReserved { .. }
                | Error::WrongProject { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
