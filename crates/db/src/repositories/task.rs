use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;

use dona_core::domain::task::{NewTask, Task, TaskFilter, TaskId, TaskPriority, TaskStatus};
use dona_core::domain::user::UserId;
use dona_core::gateway::{GatewayError, TaskGateway};

use super::{
    column, format_timestamp, parse_date, parse_optional_timestamp, parse_timestamp,
    RepositoryError,
};
use crate::DbPool;

const TASK_COLUMNS: &str = "id, title, description, status, priority, created_by, assignee,
                            channel_id, due_date, dependencies_json, completed_at, version,
                            created_at, updated_at";

pub struct SqlTaskRepository {
    pool: DbPool,
}

impl SqlTaskRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn select_by_id(&self, id: TaskId) -> Result<Option<Task>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?"))
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_task).transpose()
    }
}

fn row_to_task(row: &SqliteRow) -> Result<Task, RepositoryError> {
    let status: String = column(row, "status")?;
    let priority: String = column(row, "priority")?;
    let due_date: Option<String> = column(row, "due_date")?;
    let dependencies_json: String = column(row, "dependencies_json")?;
    let version: i64 = column(row, "version")?;
    let created_at: String = column(row, "created_at")?;
    let updated_at: String = column(row, "updated_at")?;

    let dependencies = serde_json::from_str::<Vec<i64>>(&dependencies_json)
        .map_err(|e| RepositoryError::Decode(format!("task dependencies: {e}")))?;

    Ok(Task {
        id: TaskId(column(row, "id")?),
        title: column(row, "title")?,
        description: column(row, "description")?,
        status: TaskStatus::parse(&status)
            .ok_or_else(|| RepositoryError::Decode(format!("unknown task status `{status}`")))?,
        priority: TaskPriority::parse(&priority)
            .ok_or_else(|| RepositoryError::Decode(format!("unknown priority `{priority}`")))?,
        created_by: UserId(column(row, "created_by")?),
        assignee: UserId(column(row, "assignee")?),
        channel_id: column(row, "channel_id")?,
        due_date: due_date.as_deref().map(parse_date).transpose()?,
        dependencies: dependencies.into_iter().map(TaskId).collect(),
        completed_at: parse_optional_timestamp(column(row, "completed_at")?)?,
        version: u32::try_from(version)
            .map_err(|_| RepositoryError::Decode(format!("task version out of range: {version}")))?,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

fn encode_dependencies(dependencies: &[TaskId]) -> Result<String, GatewayError> {
    let ids: Vec<i64> = dependencies.iter().map(|id| id.0).collect();
    serde_json::to_string(&ids).map_err(|e| GatewayError::Corrupt(format!("task dependencies: {e}")))
}

#[async_trait]
impl TaskGateway for SqlTaskRepository {
    async fn insert(&self, task: NewTask, now: DateTime<Utc>) -> Result<Task, GatewayError> {
        let stamp = format_timestamp(now);
        let dependencies_json = encode_dependencies(&task.dependencies)?;
        let status = TaskStatus::Pending;

        let id = sqlx::query(
            "INSERT INTO tasks (title, description, status, priority, created_by, assignee,
                                channel_id, due_date, dependencies_json, completed_at, version,
                                created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, NULL, 1, ?, ?)",
        )
        .bind(&task.title)
        .bind(&task.description)
        .bind(status.as_str())
        .bind(task.priority.as_str())
        .bind(task.created_by.0)
        .bind(task.assignee.0)
        .bind(&task.channel_id)
        .bind(task.due_date.map(|date| date.format("%Y-%m-%d").to_string()))
        .bind(&dependencies_json)
        .bind(&stamp)
        .bind(&stamp)
        .execute(&self.pool)
        .await
        .map_err(RepositoryError::from)?
        .last_insert_rowid();

        Ok(Task {
            id: TaskId(id),
            title: task.title,
            description: task.description,
            status,
            priority: task.priority,
            created_by: task.created_by,
            assignee: task.assignee,
            channel_id: task.channel_id,
            due_date: task.due_date,
            dependencies: task.dependencies,
            completed_at: None,
            version: 1,
            created_at: now,
            updated_at: now,
        })
    }

    async fn find_by_id(&self, id: TaskId) -> Result<Option<Task>, GatewayError> {
        Ok(self.select_by_id(id).await?)
    }

    async fn list_for_user(
        &self,
        user: UserId,
        filter: &TaskFilter,
    ) -> Result<Vec<Task>, GatewayError> {
        let limit = filter.limit.map(i64::from).unwrap_or(-1);
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks
             WHERE (created_by = ?1 OR assignee = ?1)
               AND (?2 IS NULL OR status = ?2)
               AND (?3 IS NULL OR completed_at >= ?3)
             ORDER BY created_at DESC, id DESC
             LIMIT ?4"
        ))
        .bind(user.0)
        .bind(filter.status.map(|status| status.as_str()))
        .bind(filter.completed_since.map(format_timestamp))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        Ok(rows.iter().map(row_to_task).collect::<Result<Vec<_>, _>>()?)
    }

    async fn update(&self, task: &Task, expected_version: u32) -> Result<Task, GatewayError> {
        let updated_at = task.updated_at;
        let result = sqlx::query(
            "UPDATE tasks
             SET title = ?, description = ?, status = ?, priority = ?, assignee = ?,
                 channel_id = ?, due_date = ?, dependencies_json = ?, completed_at = ?,
                 version = version + 1, updated_at = ?
             WHERE id = ? AND version = ?",
        )
        .bind(&task.title)
        .bind(&task.description)
        .bind(task.status.as_str())
        .bind(task.priority.as_str())
        .bind(task.assignee.0)
        .bind(&task.channel_id)
        .bind(task.due_date.map(|date| date.format("%Y-%m-%d").to_string()))
        .bind(encode_dependencies(&task.dependencies)?)
        .bind(task.completed_at.map(format_timestamp))
        .bind(format_timestamp(updated_at))
        .bind(task.id.0)
        .bind(i64::from(expected_version))
        .execute(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        if result.rows_affected() == 0 {
            return match self.select_by_id(task.id).await? {
                Some(_) => Err(GatewayError::Conflict {
                    entity: "task",
                    id: task.id.to_string(),
                    expected: expected_version,
                }),
                None => Err(GatewayError::NotFound { entity: "task", id: task.id.to_string() }),
            };
        }

        let mut stored = task.clone();
        stored.version = expected_version + 1;
        Ok(stored)
    }
}
