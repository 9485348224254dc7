//! Repository interface over projects, tasks and answers.
//!
//! Implementations must be strongly consistent within a single call. Task
//! updates are optimistic: [`TaskRepository::update_task`] only succeeds if
//! the stored row still carries the version the caller read.

pub mod memory;

pub use memory::InMemoryRepository;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::*;

#[async_trait]
pub trait TaskRepository: Send + Sync {
    async fn create_project(&self, new: NewProject) -> Result<Project>;

    async fn get_project(&self, id: ProjectId) -> Result<Project>;

    /// Persist scheduler and timeout changes.
    async fn update_project(&self, project: &Project) -> Result<Project>;

    async fn insert_task(&self, project: ProjectId, new: &NewTask) -> Result<Task>;

    async fn get_task(&self, id: TaskId) -> Result<Task>;

    /// Tasks of a project matching `filter`, ascending by id.
    async fn get_tasks_by(&self, project: ProjectId, filter: &TaskFilter) -> Result<Vec<Task>>;

    async fn count_tasks(&self, project: ProjectId, filter: &TaskFilter) -> Result<u64>;

    /// Write back a task read earlier. Fails with `Error::Conflict` if the
    /// row changed since (version mismatch). Returns the stored row with its
    /// new version.
    async fn update_task(&self, task: &Task) -> Result<Task>;

    /// Delete tasks of `project` by id, cascading to their answers.
    /// Ids belonging to another project are ignored. Without `force`, a task
    /// with any recorded answer is kept; the check and the delete are one
    /// atomic step.
    async fn delete_tasks(&self, project: ProjectId, ids: &[TaskId], force: bool) -> Result<u64>;

    /// Append an answer, re-derive the task's state from the new count and
    /// bump its version, all in one atomic step. A write computed from the
    /// previous count then loses its optimistic check. Returns the answer
    /// and the task as stored. `Error::AlreadyAnswered` if this requester
    /// already answered the task.
    async fn append_answer(&self, answer: NewAnswer) -> Result<(Answer, Task)>;

    async fn count_answers(&self, task: TaskId) -> Result<u32>;

    async fn answers_for(&self, task: TaskId) -> Result<Vec<Answer>>;

    async fn has_answered(&self, task: TaskId, requester: &Requester) -> Result<bool>;

    /// Ongoing tasks of a project the requester has not answered, each with
    /// its recorded answer count. Ascending by id.
    async fn open_tasks(&self, project: ProjectId, requester: &Requester) -> Result<Vec<OpenTask>>;

    /// Explicit assignment list used by the locked scheduler, in order.
    async fn assignments(&self, project: ProjectId, requester: &Requester) -> Result<Vec<TaskId>>;

    /// Replace a requester's assignment list.
    async fn assign(
        &self,
        project: ProjectId,
        requester: &Requester,
        tasks: &[TaskId],
    ) -> Result<()>;
}
