//! Persistence boundary.
//!
//! The lifecycle managers and handlers only ever talk to storage through these
//! traits. `dona-db` provides the SQLite and in-memory implementations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::audit::AuditLogEntry;
use crate::domain::conversation::{
    ContextType, Conversation, ConversationId, ConversationKey, Message, NewMessage,
};
use crate::domain::task::{NewTask, Task, TaskFilter, TaskId};
use crate::domain::time_entry::{NewTimeEntry, TimeEntry, TimeEntryStart};
use crate::domain::user::{PlatformIdentity, User, UserId, UserPreferences};
use crate::errors::ApplicationError;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum GatewayError {
    #[error("{entity} `{id}` not found")]
    NotFound { entity: &'static str, id: String },
    #[error("{entity} `{id}` is stale (expected version {expected})")]
    Conflict { entity: &'static str, id: String, expected: u32 },
    #[error("persistence unavailable: {0}")]
    Unavailable(String),
    #[error("stored record could not be decoded: {0}")]
    Corrupt(String),
}

impl GatewayError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

impl From<GatewayError> for ApplicationError {
    fn from(value: GatewayError) -> Self {
        match value {
            GatewayError::NotFound { entity, id } => Self::NotFound { entity, id },
            GatewayError::Conflict { entity, id, .. } => Self::Conflict { entity, id },
            GatewayError::Unavailable(message) => Self::TransientDependency(message),
            GatewayError::Corrupt(message) => Self::Internal(message),
        }
    }
}

#[async_trait]
pub trait UserGateway: Send + Sync {
    async fn get_or_create(
        &self,
        identity: &PlatformIdentity,
        now: DateTime<Utc>,
    ) -> Result<User, GatewayError>;

    async fn find_by_id(&self, id: UserId) -> Result<Option<User>, GatewayError>;

    async fn update_preferences(
        &self,
        id: UserId,
        preferences: &UserPreferences,
        now: DateTime<Utc>,
    ) -> Result<User, GatewayError>;
}

#[async_trait]
pub trait ConversationGateway: Send + Sync {
    async fn get_or_create(
        &self,
        key: &ConversationKey,
        context_type: ContextType,
        now: DateTime<Utc>,
    ) -> Result<Conversation, GatewayError>;

    async fn append_message(
        &self,
        message: NewMessage,
        now: DateTime<Utc>,
    ) -> Result<Message, GatewayError>;

    /// Latest `limit` messages, oldest first.
    async fn recent_messages(
        &self,
        conversation_id: ConversationId,
        limit: u32,
    ) -> Result<Vec<Message>, GatewayError>;
}

#[async_trait]
pub trait TaskGateway: Send + Sync {
    async fn insert(&self, task: NewTask, now: DateTime<Utc>) -> Result<Task, GatewayError>;

    async fn find_by_id(&self, id: TaskId) -> Result<Option<Task>, GatewayError>;

    /// Tasks created by or assigned to `user`, newest first.
    async fn list_for_user(
        &self,
        user: UserId,
        filter: &TaskFilter,
    ) -> Result<Vec<Task>, GatewayError>;

    /// Writes `task` only if the stored version still equals
    /// `expected_version`. Returns the stored row with its bumped version, or
    /// `GatewayError::Conflict` when another writer got there first.
    async fn update(&self, task: &Task, expected_version: u32) -> Result<Task, GatewayError>;
}

#[async_trait]
pub trait TimeEntryGateway: Send + Sync {
    async fn find_active(&self, user: UserId) -> Result<Vec<TimeEntry>, GatewayError>;

    /// Stops every active entry of the user at `at` and inserts the new
    /// active entry, as one atomic unit.
    async fn start_exclusive(
        &self,
        entry: NewTimeEntry,
        at: DateTime<Utc>,
    ) -> Result<TimeEntryStart, GatewayError>;

    async fn stop_active(
        &self,
        user: UserId,
        at: DateTime<Utc>,
    ) -> Result<Vec<TimeEntry>, GatewayError>;

    /// Entries started at or after `since`, oldest first.
    async fn list_since(
        &self,
        user: UserId,
        since: DateTime<Utc>,
    ) -> Result<Vec<TimeEntry>, GatewayError>;
}

#[async_trait]
pub trait AuditGateway: Send + Sync {
    async fn append(&self, entry: &AuditLogEntry) -> Result<(), GatewayError>;

    /// Most recent entries for a user key, newest first.
    async fn list_for_user(
        &self,
        user: &str,
        limit: u32,
    ) -> Result<Vec<AuditLogEntry>, GatewayError>;
}
