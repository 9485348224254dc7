//! In-memory repository for tests and local runs.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use super::TaskRepository;
use crate::error::{Error, Result};
use crate::model::*;

#[derive(Default)]
struct Inner {
    projects: BTreeMap<ProjectId, Project>,
    tasks: BTreeMap<TaskId, Task>,
    answers: Vec<Answer>,
    assignments: HashMap<(ProjectId, Requester), Vec<TaskId>>,
    next_project: i64,
    next_task: i64,
    next_answer: i64,
}

impl Inner {
    fn recorded(&self, task: TaskId) -> u32 {
        self.answers.iter().filter(|a| a.task_id == task).count() as u32
    }
}

#[derive(Default)]
pub struct InMemoryRepository {
    inner: Mutex<Inner>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskRepository for InMemoryRepository {
    async fn create_project(&self, new: NewProject) -> Result<Project> {
        let mut inner = self.inner.lock().await;
        if inner.projects.values().any(|p| p.short_name == new.short_name) {
            return Err(Error::Other(format!(
                "project short name already taken: {}",
                new.short_name
            )));
        }
        inner.next_project += 1;
        let project = Project {
            id: ProjectId(inner.next_project),
            short_name: new.short_name,
            scheduler: new.scheduler,
            task_timeout: new.task_timeout,
            created_at: Utc::now(),
        };
        inner.projects.insert(project.id, project.clone());
        Ok(project)
    }

    async fn get_project(&self, id: ProjectId) -> Result<Project> {
        self.inner
            .lock()
            .await
            .projects
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("project {id}")))
    }

    async fn update_project(&self, project: &Project) -> Result<Project> {
        let mut inner = self.inner.lock().await;
        let stored = inner
            .projects
            .get_mut(&project.id)
            .ok_or_else(|| Error::NotFound(format!("project {}", project.id)))?;
        stored.scheduler = project.scheduler;
        stored.task_timeout = project.task_timeout;
        Ok(stored.clone())
    }

    async fn insert_task(&self, project: ProjectId, new: &NewTask) -> Result<Task> {
        new.validate()?;
        let mut inner = self.inner.lock().await;
        if !inner.projects.contains_key(&project) {
            return Err(Error::NotFound(format!("project {project}")));
        }
        inner.next_task += 1;
        let task = Task {
            id: TaskId(inner.next_task),
            project_id: project,
            priority: new.priority,
            n_answers: new.n_answers,
            state: TaskState::Ongoing,
            exported: false,
            info: new.info.clone(),
            version: 0,
            created_at: Utc::now(),
        };
        inner.tasks.insert(task.id, task.clone());
        Ok(task)
    }

    async fn get_task(&self, id: TaskId) -> Result<Task> {
        self.inner
            .lock()
            .await
            .tasks
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("task {id}")))
    }

    async fn get_tasks_by(&self, project: ProjectId, filter: &TaskFilter) -> Result<Vec<Task>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .tasks
            .values()
            .filter(|t| t.project_id == project && filter.matches(t, inner.recorded(t.id)))
            .cloned()
            .collect())
    }

    async fn count_tasks(&self, project: ProjectId, filter: &TaskFilter) -> Result<u64> {
        let inner = self.inner.lock().await;
        Ok(inner
            .tasks
            .values()
            .filter(|t| t.project_id == project && filter.matches(t, inner.recorded(t.id)))
            .count() as u64)
    }

    async fn update_task(&self, task: &Task) -> Result<Task> {
        let mut inner = self.inner.lock().await;
        let stored = inner
            .tasks
            .get_mut(&task.id)
            .ok_or_else(|| Error::NotFound(format!("task {}", task.id)))?;
        if stored.version != task.version {
            return Err(Error::Conflict { task: task.id });
        }
        stored.priority = task.priority;
        stored.n_answers = task.n_answers;
        stored.state = task.state;
        stored.exported = task.exported;
        stored.info = task.info.clone();
        stored.version += 1;
        Ok(stored.clone())
    }

    async fn delete_tasks(&self, project: ProjectId, ids: &[TaskId], force: bool) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let mut deleted = 0;
        for id in ids {
            let doomed = inner.tasks.get(id).is_some_and(|t| t.project_id == project)
                && (force || inner.recorded(*id) == 0);
            if doomed {
                inner.tasks.remove(id);
                deleted += 1;
            }
        }
        let Inner {
            tasks,
            answers,
            assignments,
            ..
        } = &mut *inner;
        answers.retain(|a| tasks.contains_key(&a.task_id));
        for list in assignments.values_mut() {
            list.retain(|t| tasks.contains_key(t));
        }
        Ok(deleted)
    }

    async fn append_answer(&self, answer: NewAnswer) -> Result<(Answer, Task)> {
        let mut inner = self.inner.lock().await;
        let task = inner
            .tasks
            .get(&answer.task_id)
            .ok_or_else(|| Error::NotFound(format!("task {}", answer.task_id)))?;
        if task.project_id != answer.project_id {
            return Err(Error::WrongProject {
                task: answer.task_id,
                project: answer.project_id.0,
            });
        }
        if inner
            .answers
            .iter()
            .any(|a| a.task_id == answer.task_id && a.requester == answer.requester)
        {
            return Err(Error::AlreadyAnswered {
                task: answer.task_id,
                requester: answer.requester.to_string(),
            });
        }
        inner.next_answer += 1;
        let stored = Answer {
            id: inner.next_answer,
            task_id: answer.task_id,
            project_id: answer.project_id,
            requester: answer.requester,
            info: answer.info,
            created_at: Utc::now(),
        };
        inner.answers.push(stored.clone());

        let recorded = inner.recorded(answer.task_id);
        let task = inner
            .tasks
            .get_mut(&answer.task_id)
            .ok_or_else(|| Error::NotFound(format!("task {}", answer.task_id)))?;
        task.state = TaskState::derive(recorded, task.n_answers);
        task.version += 1;
        Ok((stored, task.clone()))
    }

    async fn count_answers(&self, task: TaskId) -> Result<u32> {
        Ok(self.inner.lock().await.recorded(task))
    }

    async fn answers_for(&self, task: TaskId) -> Result<Vec<Answer>> {
        Ok(self
            .inner
            .lock()
            .await
            .answers
            .iter()
            .filter(|a| a.task_id == task)
            .cloned()
            .collect())
    }

    async fn has_answered(&self, task: TaskId, requester: &Requester) -> Result<bool> {
        Ok(self
            .inner
            .lock()
            .await
            .answers
            .iter()
            .any(|a| a.task_id == task && &a.requester == requester))
    }

    async fn open_tasks(&self, project: ProjectId, requester: &Requester) -> Result<Vec<OpenTask>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .tasks
            .values()
            .filter(|t| t.project_id == project && t.state == TaskState::Ongoing)
            .filter(|t| {
                !inner
                    .answers
                    .iter()
                    .any(|a| a.task_id == t.id && &a.requester == requester)
            })
            .map(|t| OpenTask {
                task: t.clone(),
                recorded: inner.recorded(t.id),
            })
            .collect())
    }

    async fn assignments(&self, project: ProjectId, requester: &Requester) -> Result<Vec<TaskId>> {
        Ok(self
            .inner
            .lock()
            .await
            .assignments
            .get(&(project, requester.clone()))
            .cloned()
            .unwrap_or_default())
    }

    async fn assign(
        &self,
        project: ProjectId,
        requester: &Requester,
        tasks: &[TaskId],
    ) -> Result<()> {
        self.inner
            .lock()
            .await
            .assignments
            .insert((project, requester.clone()), tasks.to_vec());
        Ok(())
    }
}
