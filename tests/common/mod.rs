//! Shared test doubles.

#![allow(dead_code)]

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use crowdsched::error::{Error, Result};
use crowdsched::model::*;
use crowdsched::repo::{InMemoryRepository, TaskRepository};

/// Delegates to an in-memory repository, with switches for the failures
/// and interleavings a shared database produces.
#[derive(Default)]
pub struct FaultyRepo {
    pub inner: InMemoryRepository,
    select_failures: AtomicU32,
    reject_updates: AtomicBool,
    answer_before_delete: Mutex<Option<NewAnswer>>,
}

impl FaultyRepo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` task selections as an unreachable database would.
    pub fn fail_selects(&self, n: u32) {
        self.select_failures.store(n, Ordering::SeqCst);
    }

    /// Make every optimistic task update lose.
    pub fn reject_updates(&self, on: bool) {
        self.reject_updates.store(on, Ordering::SeqCst);
    }

    /// Record `answer` right before the next delete reaches the store.
    pub fn answer_before_delete(&self, answer: NewAnswer) {
        *self.answer_before_delete.lock().unwrap() = Some(answer);
    }
}

#[async_trait]
impl TaskRepository for FaultyRepo {
    async fn create_project(&self, new: NewProject) -> Result<Project> {
        self.inner.create_project(new).await
    }
    async fn get_project(&self, id: ProjectId) -> Result<Project> {
        self.inner.get_project(id).await
    }
    async fn update_project(&self, project: &Project) -> Result<Project> {
        self.inner.update_project(project).await
    }
    async fn insert_task(&self, project: ProjectId, new: &NewTask) -> Result<Task> {
        self.inner.insert_task(project, new).await
    }
    async fn get_task(&self, id: TaskId) -> Result<Task> {
        self.inner.get_task(id).await
    }
    async fn get_tasks_by(&self, project: ProjectId, filter: &TaskFilter) -> Result<Vec<Task>> {
        let left = self.select_failures.load(Ordering::SeqCst);
        if left > 0 {
            self.select_failures.store(left - 1, Ordering::SeqCst);
            return Err(Error::Storage(sqlx::Error::PoolTimedOut));
        }
        self.inner.get_tasks_by(project, filter).await
    }
    async fn count_tasks(&self, project: ProjectId, filter: &TaskFilter) -> Result<u64> {
        self.inner.count_tasks(project, filter).await
    }
    async fn update_task(&self, task: &Task) -> Result<Task> {
        if self.reject_updates.load(Ordering::SeqCst) {
            return Err(Error::Conflict { task: task.id });
        }
        self.inner.update_task(task).await
    }
    async fn delete_tasks(&self, project: ProjectId, ids: &[TaskId], force: bool) -> Result<u64> {
        let pending = self.answer_before_delete.lock().unwrap().take();
        if let Some(answer) = pending {
            self.inner.append_answer(answer).await?;
        }
        self.inner.delete_tasks(project, ids, force).await
    }
    async fn append_answer(&self, answer: NewAnswer) -> Result<(Answer, Task)> {
        self.inner.append_answer(answer).await
    }
    async fn count_answers(&self, task: TaskId) -> Result<u32> {
        self.inner.count_answers(task).await
    }
    async fn answers_for(&self, task: TaskId) -> Result<Vec<Answer>> {
        self.inner.answers_for(task).await
    }
    async fn has_answered(&self, task: TaskId, requester: &Requester) -> Result<bool> {
        self.inner.has_answered(task, requester).await
    }
    async fn open_tasks(&self, project: ProjectId, requester: &Requester) -> Result<Vec<OpenTask>> {
        self.inner.open_tasks(project, requester).await
    }
    async fn assignments(&self, project: ProjectId, requester: &Requester) -> Result<Vec<TaskId>> {
        self.inner.assignments(project, requester).await
    }
    async fn assign(
        &self,
        project: ProjectId,
        requester: &Requester,
        tasks: &[TaskId],
    ) -> Result<()> {
        self.inner.assign(project, requester, tasks).await
    }
}
