//! Repository on Postgres: projects, tasks, answers, assignments.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Postgres, QueryBuilder};

use crate::error::{Error, Result};
use crate::model::*;
use crate::repo::TaskRepository;

const TASK_COLUMNS: &str = "t.id, t.project_id, t.priority, t.n_answers, t.state, t.exported, \
                            t.info, t.version, t.created_at";

const RECORDED: &str = "(SELECT count(*) FROM answers a WHERE a.task_id = t.id)";

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

/// Append the filter's predicates to a query that already has a
/// `WHERE t.project_id = ...` clause.
fn push_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &TaskFilter) {
    if let Some(ref ids) = filter.ids {
        qb.push(" AND t.id = ANY(")
            .push_bind(ids.iter().map(|id| id.0).collect::<Vec<i64>>())
            .push(")");
    }
    if let Some(state) = filter.state {
        qb.push(" AND t.state = ").push_bind(state.as_str());
    }
    if let Some(exported) = filter.exported {
        qb.push(" AND t.exported = ").push_bind(exported);
    }
    if let Some(p) = filter.priority_from {
        qb.push(" AND t.priority >= ").push_bind(p);
    }
    if let Some(p) = filter.priority_to {
        qb.push(" AND t.priority <= ").push_bind(p);
    }
    if let Some(t) = filter.created_from {
        qb.push(" AND t.created_at >= ").push_bind(t);
    }
    if let Some(t) = filter.created_to {
        qb.push(" AND t.created_at <= ").push_bind(t);
    }
    if let Some(p) = filter.pcomplete_from {
        qb.push(format!(" AND {RECORDED} * 100.0 / t.n_answers >= "))
            .push_bind(p);
    }
    if let Some(p) = filter.pcomplete_to {
        qb.push(format!(" AND {RECORDED} * 100.0 / t.n_answers <= "))
            .push_bind(p);
    }
}

#[async_trait]
impl TaskRepository for super::Db {
    async fn create_project(&self, new: NewProject) -> Result<Project> {
        let row: ProjectRow = sqlx::query_as(
            "INSERT INTO projects (short_name, scheduler, task_timeout_secs)
             VALUES ($1, $2, $3)
             RETURNING id, short_name, scheduler, task_timeout_secs, created_at",
        )
        .bind(&new.short_name)
        .bind(new.scheduler.as_str())
        .bind(new.task_timeout.as_secs() as i64)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                Error::Other(format!("project short name already taken: {}", new.short_name))
            } else {
                e.into()
            }
        })?;
        row.try_into_project()
    }

    async fn get_project(&self, id: ProjectId) -> Result<Project> {
        let row: Option<ProjectRow> = sqlx::query_as(
            "SELECT id, short_name, scheduler, task_timeout_secs, created_at
             FROM projects WHERE id = $1",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.ok_or_else(|| Error::NotFound(format!("project {id}")))?
            .try_into_project()
    }

    async fn update_project(&self, project: &Project) -> Result<Project> {
        let row: Option<ProjectRow> = sqlx::query_as(
            "UPDATE projects SET scheduler = $1, task_timeout_secs = $2 WHERE id = $3
             RETURNING id, short_name, scheduler, task_timeout_secs, created_at",
        )
        .bind(project.scheduler.as_str())
        .bind(project.task_timeout.as_secs() as i64)
        .bind(project.id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.ok_or_else(|| Error::NotFound(format!("project {}", project.id)))?
            .try_into_project()
    }

    async fn insert_task(&self, project: ProjectId, new: &NewTask) -> Result<Task> {
        new.validate()?;
        let row: TaskRow = sqlx::query_as(
            "INSERT INTO tasks AS t (project_id, priority, n_answers, info)
             VALUES ($1, $2, $3, $4)
             RETURNING t.id, t.project_id, t.priority, t.n_answers, t.state, t.exported,
                       t.info, t.version, t.created_at",
        )
        .bind(project.0)
        .bind(new.priority)
        .bind(new.n_answers as i32)
        .bind(&new.info)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_foreign_key_violation() => {
                Error::NotFound(format!("project {project}"))
            }
            other => other.into(),
        })?;
        row.try_into_task()
    }

    async fn get_task(&self, id: TaskId) -> Result<Task> {
        let row: Option<TaskRow> =
            sqlx::query_as(&format!("SELECT {TASK_COLUMNS} FROM tasks t WHERE t.id = $1"))
                .bind(id.0)
                .fetch_optional(&self.pool)
                .await?;
        row.ok_or_else(|| Error::NotFound(format!("task {id}")))?
            .try_into_task()
    }

    async fn get_tasks_by(&self, project: ProjectId, filter: &TaskFilter) -> Result<Vec<Task>> {
        let mut qb =
            QueryBuilder::new(format!("SELECT {TASK_COLUMNS} FROM tasks t WHERE t.project_id = "));
        qb.push_bind(project.0);
        push_filter(&mut qb, filter);
        qb.push(" ORDER BY t.id");

        let rows: Vec<TaskRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter().map(TaskRow::try_into_task).collect()
    }

    async fn count_tasks(&self, project: ProjectId, filter: &TaskFilter) -> Result<u64> {
        let mut qb = QueryBuilder::new("SELECT count(*) FROM tasks t WHERE t.project_id = ");
        qb.push_bind(project.0);
        push_filter(&mut qb, filter);

        let (count,): (i64,) = qb.build_query_as().fetch_one(&self.pool).await?;
        Ok(count as u64)
    }

    async fn update_task(&self, task: &Task) -> Result<Task> {
        let row: Option<TaskRow> = sqlx::query_as(
            "UPDATE tasks AS t
             SET priority = $1, n_answers = $2, state = $3, exported = $4, info = $5,
                 version = t.version + 1
             WHERE t.id = $6 AND t.version = $7
             RETURNING t.id, t.project_id, t.priority, t.n_answers, t.state, t.exported,
                       t.info, t.version, t.created_at",
        )
        .bind(task.priority)
        .bind(task.n_answers as i32)
        .bind(task.state.as_str())
        .bind(task.exported)
        .bind(&task.info)
        .bind(task.id.0)
        .bind(task.version)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row.try_into_task(),
            None => {
                // Either gone or moved on since it was read.
                let exists: Option<(i64,)> = sqlx::query_as("SELECT id FROM tasks WHERE id = $1")
                    .bind(task.id.0)
                    .fetch_optional(&self.pool)
                    .await?;
                match exists {
                    Some(_) => Err(Error::Conflict { task: task.id }),
                    None => Err(Error::NotFound(format!("task {}", task.id))),
                }
            }
        }
    }

    async fn delete_tasks(&self, project: ProjectId, ids: &[TaskId], force: bool) -> Result<u64> {
        let ids: Vec<i64> = ids.iter().map(|id| id.0).collect();
        let mut tx = self.pool.begin().await?;

        // Row locks first: an answer being appended commits before the
        // delete's own snapshot is taken, and later ones wait for us.
        sqlx::query("SELECT id FROM tasks WHERE project_id = $1 AND id = ANY($2) FOR UPDATE")
            .bind(project.0)
            .bind(&ids)
            .execute(&mut *tx)
            .await?;

        let deleted = sqlx::query(
            "DELETE FROM tasks AS t
             WHERE t.project_id = $1 AND t.id = ANY($2)
               AND ($3 OR NOT EXISTS (SELECT 1 FROM answers a WHERE a.task_id = t.id))",
        )
        .bind(project.0)
        .bind(&ids)
        .bind(force)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;
        Ok(deleted)
    }

    async fn append_answer(&self, answer: NewAnswer) -> Result<(Answer, Task)> {
        let mut tx = self.pool.begin().await?;

        let owner: Option<(i64,)> =
            sqlx::query_as("SELECT project_id FROM tasks WHERE id = $1 FOR UPDATE")
                .bind(answer.task_id.0)
                .fetch_optional(&mut *tx)
                .await?;
        match owner {
            None => return Err(Error::NotFound(format!("task {}", answer.task_id))),
            Some((project,)) if project != answer.project_id.0 => {
                return Err(Error::WrongProject {
                    task: answer.task_id,
                    project: answer.project_id.0,
                });
            }
            Some(_) => {}
        }

        let requester = answer.requester.to_string();
        let (id, created_at): (i64, DateTime<Utc>) = sqlx::query_as(
            "INSERT INTO answers (task_id, project_id, requester, info)
             VALUES ($1, $2, $3, $4)
             RETURNING id, created_at",
        )
        .bind(answer.task_id.0)
        .bind(answer.project_id.0)
        .bind(&requester)
        .bind(&answer.info)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                Error::AlreadyAnswered {
                    task: answer.task_id,
                    requester: requester.clone(),
                }
            } else {
                e.into()
            }
        })?;

        // Still under the row lock: the count includes the answer just inserted.
        let row: TaskRow = sqlx::query_as(&format!(
            "UPDATE tasks AS t
             SET state = CASE WHEN {RECORDED} >= t.n_answers THEN 'completed' ELSE 'ongoing' END,
                 version = t.version + 1
             WHERE t.id = $1
             RETURNING {TASK_COLUMNS}"
        ))
        .bind(answer.task_id.0)
        .fetch_one(&mut *tx)
        .await?;
        let task = row.try_into_task()?;

        tx.commit().await?;

        let answer = Answer {
            id,
            task_id: answer.task_id,
            project_id: answer.project_id,
            requester: answer.requester,
            info: answer.info,
            created_at,
        };
        Ok((answer, task))
    }

    async fn count_answers(&self, task: TaskId) -> Result<u32> {
        let (count,): (i64,) = sqlx::query_as("SELECT count(*) FROM answers WHERE task_id = $1")
            .bind(task.0)
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u32)
    }

    async fn answers_for(&self, task: TaskId) -> Result<Vec<Answer>> {
        let rows: Vec<AnswerRow> = sqlx::query_as(
            "SELECT id, task_id, project_id, requester, info, created_at
             FROM answers WHERE task_id = $1 ORDER BY id",
        )
        .bind(task.0)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(AnswerRow::try_into_answer).collect()
    }

    async fn has_answered(&self, task: TaskId, requester: &Requester) -> Result<bool> {
        let (exists,): (bool,) =
            sqlx::query_as(
                "SELECT EXISTS (SELECT 1 FROM answers WHERE task_id = $1 AND requester = $2)",
            )
            .bind(task.0)
            .bind(requester.to_string())
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }

    async fn open_tasks(&self, project: ProjectId, requester: &Requester) -> Result<Vec<OpenTask>> {
        let rows: Vec<OpenTaskRow> = sqlx::query_as(&format!(
            "SELECT {TASK_COLUMNS}, {RECORDED} AS recorded
             FROM tasks t
             WHERE t.project_id = $1 AND t.state = 'ongoing'
               AND NOT EXISTS (SELECT 1 FROM answers a WHERE a.task_id = t.id AND a.requester = $2)
             ORDER BY t.id"
        ))
        .bind(project.0)
        .bind(requester.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(OpenTask {
                    recorded: row.recorded as u32,
                    task: row.task.try_into_task()?,
                })
            })
            .collect()
    }

    async fn assignments(&self, project: ProjectId, requester: &Requester) -> Result<Vec<TaskId>> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            "SELECT task_id FROM assignments
             WHERE project_id = $1 AND requester = $2
             ORDER BY position",
        )
        .bind(project.0)
        .bind(requester.to_string())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| TaskId(id)).collect())
    }

    async fn assign(
        &self,
        project: ProjectId,
        requester: &Requester,
        tasks: &[TaskId],
    ) -> Result<()> {
        let requester = requester.to_string();
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM assignments WHERE project_id = $1 AND requester = $2")
            .bind(project.0)
            .bind(&requester)
            .execute(&mut *tx)
            .await?;

        for (position, task) in tasks.iter().enumerate() {
            sqlx::query(
                "INSERT INTO assignments (project_id, requester, position, task_id)
                 VALUES ($1, $2, $3, $4)",
            )
            .bind(project.0)
            .bind(&requester)
            .bind(position as i32)
            .bind(task.0)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

#[derive(sqlx::FromRow)]
struct ProjectRow {
    id: i64,
    short_name: String,
    scheduler: String,
    task_timeout_secs: i64,
    created_at: DateTime<Utc>,
}

impl ProjectRow {
    fn try_into_project(self) -> Result<Project> {
        Ok(Project {
            id: ProjectId(self.id),
            short_name: self.short_name,
            scheduler: self.scheduler.parse()?,
            task_timeout: Duration::from_secs(self.task_timeout_secs.max(1) as u64),
            created_at: self.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: i64,
    project_id: i64,
    priority: f64,
    n_answers: i32,
    state: String,
    exported: bool,
    info: serde_json::Value,
    version: i64,
    created_at: DateTime<Utc>,
}

impl TaskRow {
    fn try_into_task(self) -> Result<Task> {
        Ok(Task {
            id: TaskId(self.id),
            project_id: ProjectId(self.project_id),
            priority: self.priority,
            n_answers: self.n_answers.max(1) as u32,
            state: self.state.parse()?,
            exported: self.exported,
            info: self.info,
            version: self.version,
            created_at: self.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct OpenTaskRow {
    #[sqlx(flatten)]
    task: TaskRow,
    recorded: i64,
}

#[derive(sqlx::FromRow)]
struct AnswerRow {
    id: i64,
    task_id: i64,
    project_id: i64,
    requester: String,
    info: serde_json::Value,
    created_at: DateTime<Utc>,
}

impl AnswerRow {
    fn try_into_answer(self) -> Result<Answer> {
        Ok(Answer {
            id: self.id,
            task_id: TaskId(self.task_id),
            project_id: ProjectId(self.project_id),
            requester: self.requester.parse()?,
            info: self.info,
            created_at: self.created_at,
        })
    }
}
