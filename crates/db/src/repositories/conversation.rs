use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;

use dona_core::domain::conversation::{
    ContextType, Conversation, ConversationId, ConversationKey, Message, MessageId, NewMessage,
    SenderType,
};
use dona_core::domain::user::UserId;
use dona_core::gateway::{ConversationGateway, GatewayError};

use super::{column, format_timestamp, parse_timestamp, RepositoryError};
use crate::DbPool;

pub struct SqlConversationRepository {
    pool: DbPool,
}

impl SqlConversationRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn row_to_conversation(row: &SqliteRow) -> Result<Conversation, RepositoryError> {
    let context_type: String = column(row, "context_type")?;
    let thread_ts: String = column(row, "thread_ts")?;
    let created_at: String = column(row, "created_at")?;
    let updated_at: String = column(row, "updated_at")?;

    Ok(Conversation {
        id: ConversationId(column(row, "id")?),
        user_id: UserId(column(row, "user_id")?),
        channel_id: column(row, "channel_id")?,
        thread_ts: (!thread_ts.is_empty()).then_some(thread_ts),
        context_type: ContextType::parse(&context_type).ok_or_else(|| {
            RepositoryError::Decode(format!("unknown context type `{context_type}`"))
        })?,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

fn row_to_message(row: &SqliteRow) -> Result<Message, RepositoryError> {
    let sender_type: String = column(row, "sender_type")?;
    let metadata_json: String = column(row, "metadata_json")?;
    let created_at: String = column(row, "created_at")?;

    Ok(Message {
        id: MessageId(column(row, "id")?),
        conversation_id: ConversationId(column(row, "conversation_id")?),
        sender_type: SenderType::parse(&sender_type).ok_or_else(|| {
            RepositoryError::Decode(format!("unknown sender type `{sender_type}`"))
        })?,
        content: column(row, "content")?,
        intent: column(row, "intent")?,
        metadata: serde_json::from_str::<BTreeMap<String, String>>(&metadata_json)
            .map_err(|e| RepositoryError::Decode(format!("message metadata: {e}")))?,
        created_at: parse_timestamp(&created_at)?,
    })
}

#[async_trait]
impl ConversationGateway for SqlConversationRepository {
    async fn get_or_create(
        &self,
        key: &ConversationKey,
        context_type: ContextType,
        now: DateTime<Utc>,
    ) -> Result<Conversation, GatewayError> {
        let stamp = format_timestamp(now);
        let thread_ts = key.thread_ts.as_deref().unwrap_or_default();

        sqlx::query(
            "INSERT INTO conversations (user_id, channel_id, thread_ts, context_type, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(user_id, channel_id, thread_ts) DO UPDATE SET updated_at = excluded.updated_at",
        )
        .bind(key.user_id.0)
        .bind(&key.channel_id)
        .bind(thread_ts)
        .bind(context_type.as_str())
        .bind(&stamp)
        .bind(&stamp)
        .execute(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        let row = sqlx::query(
            "SELECT id, user_id, channel_id, thread_ts, context_type, created_at, updated_at
             FROM conversations WHERE user_id = ? AND channel_id = ? AND thread_ts = ?",
        )
        .bind(key.user_id.0)
        .bind(&key.channel_id)
        .bind(thread_ts)
        .fetch_one(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        Ok(row_to_conversation(&row)?)
    }

    async fn append_message(
        &self,
        message: NewMessage,
        now: DateTime<Utc>,
    ) -> Result<Message, GatewayError> {
        let stamp = format_timestamp(now);
        let metadata_json = serde_json::to_string(&message.metadata)
            .map_err(|e| GatewayError::Corrupt(format!("message metadata: {e}")))?;

        let mut tx = self.pool.begin().await.map_err(RepositoryError::from)?;
        let id = sqlx::query(
            "INSERT INTO messages (conversation_id, sender_type, content, intent, metadata_json, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(message.conversation_id.0)
        .bind(message.sender_type.as_str())
        .bind(&message.content)
        .bind(&message.intent)
        .bind(&metadata_json)
        .bind(&stamp)
        .execute(&mut *tx)
        .await
        .map_err(RepositoryError::from)?
        .last_insert_rowid();

        sqlx::query("UPDATE conversations SET updated_at = ? WHERE id = ?")
            .bind(&stamp)
            .bind(message.conversation_id.0)
            .execute(&mut *tx)
            .await
            .map_err(RepositoryError::from)?;
        tx.commit().await.map_err(RepositoryError::from)?;

        Ok(Message {
            id: MessageId(id),
            conversation_id: message.conversation_id,
            sender_type: message.sender_type,
            content: message.content,
            intent: message.intent,
            metadata: message.metadata,
            created_at: now,
        })
    }

    async fn recent_messages(
        &self,
        conversation_id: ConversationId,
        limit: u32,
    ) -> Result<Vec<Message>, GatewayError> {
        let rows = sqlx::query(
            "SELECT id, conversation_id, sender_type, content, intent, metadata_json, created_at
             FROM messages WHERE conversation_id = ?
             ORDER BY id DESC LIMIT ?",
        )
        .bind(conversation_id.0)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        let mut messages = rows.iter().map(row_to_message).collect::<Result<Vec<_>, _>>()?;
        messages.reverse();
        Ok(messages)
    }
}
