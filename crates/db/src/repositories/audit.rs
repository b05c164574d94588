use std::collections::BTreeMap;

use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;

use dona_core::audit::AuditLogEntry;
use dona_core::gateway::{AuditGateway, GatewayError};

use super::{column, format_timestamp, parse_timestamp, RepositoryError};
use crate::DbPool;

/// Appends to `activity_logs`. Rows are never updated or deleted.
pub struct SqlAuditRepository {
    pool: DbPool,
}

impl SqlAuditRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn row_to_entry(row: &SqliteRow) -> Result<AuditLogEntry, RepositoryError> {
    let metadata_json: String = column(row, "metadata_json")?;
    let occurred_at: String = column(row, "occurred_at")?;

    Ok(AuditLogEntry {
        user: column(row, "user_key")?,
        activity_type: column(row, "activity_type")?,
        entity_type: column(row, "entity_type")?,
        entity_id: column(row, "entity_id")?,
        correlation_id: column(row, "correlation_id")?,
        metadata: serde_json::from_str::<BTreeMap<String, String>>(&metadata_json)
            .map_err(|e| RepositoryError::Decode(format!("audit metadata: {e}")))?,
        occurred_at: parse_timestamp(&occurred_at)?,
    })
}

#[async_trait]
impl AuditGateway for SqlAuditRepository {
    async fn append(&self, entry: &AuditLogEntry) -> Result<(), GatewayError> {
        let metadata_json = serde_json::to_string(&entry.metadata)
            .map_err(|e| GatewayError::Corrupt(format!("audit metadata: {e}")))?;

        sqlx::query(
            "INSERT INTO activity_logs (user_key, activity_type, entity_type, entity_id,
                                        correlation_id, metadata_json, occurred_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&entry.user)
        .bind(&entry.activity_type)
        .bind(&entry.entity_type)
        .bind(&entry.entity_id)
        .bind(&entry.correlation_id)
        .bind(&metadata_json)
        .bind(format_timestamp(entry.occurred_at))
        .execute(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        Ok(())
    }

    async fn list_for_user(
        &self,
        user: &str,
        limit: u32,
    ) -> Result<Vec<AuditLogEntry>, GatewayError> {
        let rows = sqlx::query(
            "SELECT user_key, activity_type, entity_type, entity_id, correlation_id,
                    metadata_json, occurred_at
             FROM activity_logs WHERE user_key = ?
             ORDER BY occurred_at DESC, id DESC LIMIT ?",
        )
        .bind(user)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        Ok(rows.iter().map(row_to_entry).collect::<Result<Vec<_>, _>>()?)
    }
}
