use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;

use dona_core::domain::user::{Language, PlatformIdentity, User, UserId, UserPreferences};
use dona_core::gateway::{GatewayError, UserGateway};

use super::{column, format_timestamp, parse_timestamp, RepositoryError};
use crate::DbPool;

const USER_COLUMNS: &str = "id, platform_user_id, workspace_id, display_name, language, timezone,
                            notifications_enabled, created_at, updated_at";

pub struct SqlUserRepository {
    pool: DbPool,
}

impl SqlUserRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn select_by_identity(
        &self,
        identity: &PlatformIdentity,
    ) -> Result<Option<User>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE workspace_id = ? AND platform_user_id = ?"
        ))
        .bind(&identity.workspace_id)
        .bind(&identity.platform_user_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_user).transpose()
    }

    async fn select_by_id(&self, id: UserId) -> Result<Option<User>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?"))
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_user).transpose()
    }
}

fn row_to_user(row: &SqliteRow) -> Result<User, RepositoryError> {
    let language: String = column(row, "language")?;
    let created_at: String = column(row, "created_at")?;
    let updated_at: String = column(row, "updated_at")?;

    Ok(User {
        id: UserId(column(row, "id")?),
        identity: PlatformIdentity::new(
            column::<String>(row, "platform_user_id")?,
            column::<String>(row, "workspace_id")?,
        ),
        display_name: column(row, "display_name")?,
        preferences: UserPreferences {
            language: Language::parse(&language)
                .ok_or_else(|| RepositoryError::Decode(format!("unknown language `{language}`")))?,
            timezone: column(row, "timezone")?,
            notifications_enabled: column::<i64>(row, "notifications_enabled")? != 0,
        },
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

#[async_trait]
impl UserGateway for SqlUserRepository {
    async fn get_or_create(
        &self,
        identity: &PlatformIdentity,
        now: DateTime<Utc>,
    ) -> Result<User, GatewayError> {
        let defaults = UserPreferences::default();
        let stamp = format_timestamp(now);

        sqlx::query(
            "INSERT INTO users (platform_user_id, workspace_id, language, timezone,
                                notifications_enabled, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(workspace_id, platform_user_id) DO NOTHING",
        )
        .bind(&identity.platform_user_id)
        .bind(&identity.workspace_id)
        .bind(defaults.language.as_str())
        .bind(&defaults.timezone)
        .bind(i64::from(defaults.notifications_enabled))
        .bind(&stamp)
        .bind(&stamp)
        .execute(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        self.select_by_identity(identity).await?.ok_or_else(|| GatewayError::NotFound {
            entity: "user",
            id: identity.key(),
        })
    }

    async fn find_by_id(&self, id: UserId) -> Result<Option<User>, GatewayError> {
        Ok(self.select_by_id(id).await?)
    }

    async fn update_preferences(
        &self,
        id: UserId,
        preferences: &UserPreferences,
        now: DateTime<Utc>,
    ) -> Result<User, GatewayError> {
        let result = sqlx::query(
            "UPDATE users
             SET language = ?, timezone = ?, notifications_enabled = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(preferences.language.as_str())
        .bind(&preferences.timezone)
        .bind(i64::from(preferences.notifications_enabled))
        .bind(format_timestamp(now))
        .bind(id.0)
        .execute(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        if result.rows_affected() == 0 {
            return Err(GatewayError::NotFound { entity: "user", id: id.to_string() });
        }

        self.select_by_id(id)
            .await?
            .ok_or_else(|| GatewayError::NotFound { entity: "user", id: id.to_string() })
    }
}
