use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::user::UserId;

/// Visibility of an interaction: shared with several people or one-to-one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextType {
    Public,
    Private,
}

impl ContextType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Private => "private",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "public" => Some(Self::Public),
            "private" => Some(Self::Private),
            _ => None,
        }
    }

    pub fn privacy_level(&self) -> &'static str {
        match self {
            Self::Private => "confidential",
            Self::Public => "team",
        }
    }

    pub fn is_private(&self) -> bool {
        matches!(self, Self::Private)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConversationId(pub i64);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub i64);

/// Identifies the thread a conversation is scoped to.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConversationKey {
    pub user_id: UserId,
    pub channel_id: String,
    pub thread_ts: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub user_id: UserId,
    pub channel_id: String,
    pub thread_ts: Option<String>,
    pub context_type: ContextType,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SenderType {
    User,
    Assistant,
    Agent,
}

impl SenderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Agent => "agent",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            "agent" => Some(Self::Agent),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewMessage {
    pub conversation_id: ConversationId,
    pub sender_type: SenderType,
    pub content: String,
    pub intent: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

impl NewMessage {
    pub fn new(
        conversation_id: ConversationId,
        sender_type: SenderType,
        content: impl Into<String>,
    ) -> Self {
        Self {
            conversation_id,
            sender_type,
            content: content.into(),
            intent: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_intent(mut self, intent: impl Into<String>) -> Self {
        self.intent = Some(intent.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// One immutable exchange turn.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_type: SenderType,
    pub content: String,
    pub intent: Option<String>,
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::{ContextType, SenderType};

    #[test]
    fn privacy_level_follows_context() {
        assert_eq!(ContextType::Private.privacy_level(), "confidential");
        assert_eq!(ContextType::Public.privacy_level(), "team");
    }

    #[test]
    fn sender_type_storage_encoding_is_stable() {
        for sender in [SenderType::User, SenderType::Assistant, SenderType::Agent] {
            assert_eq!(SenderType::parse(sender.as_str()), Some(sender));
        }
        assert_eq!(ContextType::parse("PRIVATE"), Some(ContextType::Private));
    }
}
