use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::SqliteConnection;

use dona_core::domain::task::TaskId;
use dona_core::domain::time_entry::{NewTimeEntry, TimeEntry, TimeEntryId, TimeEntryStart};
use dona_core::domain::user::UserId;
use dona_core::gateway::{GatewayError, TimeEntryGateway};

use super::{
    column, format_timestamp, is_unique_violation, parse_optional_timestamp, parse_timestamp,
    RepositoryError,
};
use crate::DbPool;

const ENTRY_COLUMNS: &str = "id, user_id, task_id, description, start_time, end_time,
                             duration_seconds, is_active, created_at";

pub struct SqlTimeEntryRepository {
    pool: DbPool,
}

impl SqlTimeEntryRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn row_to_entry(row: &SqliteRow) -> Result<TimeEntry, RepositoryError> {
    let task_id: Option<i64> = column(row, "task_id")?;
    let start_time: String = column(row, "start_time")?;
    let created_at: String = column(row, "created_at")?;

    Ok(TimeEntry {
        id: TimeEntryId(column(row, "id")?),
        user_id: UserId(column(row, "user_id")?),
        task_id: task_id.map(TaskId),
        description: column(row, "description")?,
        start_time: parse_timestamp(&start_time)?,
        end_time: parse_optional_timestamp(column(row, "end_time")?)?,
        duration_seconds: column(row, "duration_seconds")?,
        is_active: column::<i64>(row, "is_active")? != 0,
        created_at: parse_timestamp(&created_at)?,
    })
}

async fn select_active(
    conn: &mut SqliteConnection,
    user: UserId,
) -> Result<Vec<TimeEntry>, RepositoryError> {
    let rows = sqlx::query(&format!(
        "SELECT {ENTRY_COLUMNS} FROM time_entries
         WHERE user_id = ? AND is_active = 1
         ORDER BY start_time ASC, id ASC"
    ))
    .bind(user.0)
    .fetch_all(&mut *conn)
    .await?;

    rows.iter().map(row_to_entry).collect()
}

async fn stop_all(
    conn: &mut SqliteConnection,
    user: UserId,
    at: DateTime<Utc>,
) -> Result<Vec<TimeEntry>, RepositoryError> {
    let active = select_active(&mut *conn, user).await?;
    let mut stopped = Vec::with_capacity(active.len());

    for entry in active {
        let closed = entry.stopped_at(at);
        sqlx::query(
            "UPDATE time_entries SET end_time = ?, duration_seconds = ?, is_active = 0
             WHERE id = ? AND is_active = 1",
        )
        .bind(closed.end_time.map(format_timestamp))
        .bind(closed.duration_seconds)
        .bind(closed.id.0)
        .execute(&mut *conn)
        .await?;
        stopped.push(closed);
    }

    Ok(stopped)
}

#[async_trait]
impl TimeEntryGateway for SqlTimeEntryRepository {
    async fn find_active(&self, user: UserId) -> Result<Vec<TimeEntry>, GatewayError> {
        let mut conn = self.pool.acquire().await.map_err(RepositoryError::from)?;
        Ok(select_active(&mut conn, user).await?)
    }

    async fn start_exclusive(
        &self,
        entry: NewTimeEntry,
        at: DateTime<Utc>,
    ) -> Result<TimeEntryStart, GatewayError> {
        let stamp = format_timestamp(at);
        let mut tx = self.pool.begin().await.map_err(RepositoryError::from)?;
        let stopped = stop_all(&mut tx, entry.user_id, at).await?;

        let inserted = sqlx::query(
            "INSERT INTO time_entries (user_id, task_id, description, start_time, end_time,
                                       duration_seconds, is_active, created_at)
             VALUES (?, ?, ?, ?, NULL, NULL, 1, ?)",
        )
        .bind(entry.user_id.0)
        .bind(entry.task_id.map(|id| id.0))
        .bind(&entry.description)
        .bind(&stamp)
        .bind(&stamp)
        .execute(&mut *tx)
        .await;

        let id = match inserted {
            Ok(result) => result.last_insert_rowid(),
            // another writer slipped an active entry in; the partial unique index refused ours
            Err(error) if is_unique_violation(&error) => {
                return Err(GatewayError::Conflict {
                    entity: "time_entry",
                    id: entry.user_id.to_string(),
                    expected: 0,
                });
            }
            Err(error) => return Err(RepositoryError::from(error).into()),
        };
        tx.commit().await.map_err(RepositoryError::from)?;

        Ok(TimeEntryStart {
            stopped,
            started: TimeEntry {
                id: TimeEntryId(id),
                user_id: entry.user_id,
                task_id: entry.task_id,
                description: entry.description,
                start_time: at,
                end_time: None,
                duration_seconds: None,
                is_active: true,
                created_at: at,
            },
        })
    }

    async fn stop_active(
        &self,
        user: UserId,
        at: DateTime<Utc>,
    ) -> Result<Vec<TimeEntry>, GatewayError> {
        let mut tx = self.pool.begin().await.map_err(RepositoryError::from)?;
        let stopped = stop_all(&mut tx, user, at).await?;
        tx.commit().await.map_err(RepositoryError::from)?;
        Ok(stopped)
    }

    async fn list_since(
        &self,
        user: UserId,
        since: DateTime<Utc>,
    ) -> Result<Vec<TimeEntry>, GatewayError> {
        let rows = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS} FROM time_entries
             WHERE user_id = ? AND start_time >= ?
             ORDER BY start_time ASC, id ASC"
        ))
        .bind(user.0)
        .bind(format_timestamp(since))
        .fetch_all(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        Ok(rows.iter().map(row_to_entry).collect::<Result<Vec<_>, _>>()?)
    }
}
