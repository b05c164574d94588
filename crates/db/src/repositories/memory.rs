use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use dona_core::audit::AuditLogEntry;
use dona_core::domain::conversation::{
    ContextType, Conversation, ConversationId, ConversationKey, Message, MessageId, NewMessage,
};
use dona_core::domain::task::{NewTask, Task, TaskFilter, TaskId, TaskStatus};
use dona_core::domain::time_entry::{NewTimeEntry, TimeEntry, TimeEntryId, TimeEntryStart};
use dona_core::domain::user::{PlatformIdentity, User, UserId, UserPreferences};
use dona_core::gateway::{
    AuditGateway, ConversationGateway, GatewayError, TaskGateway, TimeEntryGateway, UserGateway,
};

#[derive(Default)]
struct UserTable {
    users: HashMap<UserId, User>,
    by_key: HashMap<String, UserId>,
    next_id: i64,
}

#[derive(Default)]
pub struct InMemoryUserRepository {
    table: RwLock<UserTable>,
}

#[async_trait]
impl UserGateway for InMemoryUserRepository {
    async fn get_or_create(
        &self,
        identity: &PlatformIdentity,
        now: DateTime<Utc>,
    ) -> Result<User, GatewayError> {
        let mut table = self.table.write().await;
        if let Some(user) = table.by_key.get(&identity.key()).and_then(|id| table.users.get(id)) {
            return Ok(user.clone());
        }

        table.next_id += 1;
        let user = User {
            id: UserId(table.next_id),
            identity: identity.clone(),
            display_name: None,
            preferences: UserPreferences::default(),
            created_at: now,
            updated_at: now,
        };
        table.by_key.insert(identity.key(), user.id);
        table.users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn find_by_id(&self, id: UserId) -> Result<Option<User>, GatewayError> {
        Ok(self.table.read().await.users.get(&id).cloned())
    }

    async fn update_preferences(
        &self,
        id: UserId,
        preferences: &UserPreferences,
        now: DateTime<Utc>,
    ) -> Result<User, GatewayError> {
        let mut table = self.table.write().await;
        let user = table
            .users
            .get_mut(&id)
            .ok_or_else(|| GatewayError::NotFound { entity: "user", id: id.to_string() })?;
        user.preferences = preferences.clone();
        user.updated_at = now;
        Ok(user.clone())
    }
}

#[derive(Default)]
struct ConversationTable {
    conversations: HashMap<(UserId, String, String), Conversation>,
    messages: Vec<Message>,
    next_conversation_id: i64,
    next_message_id: i64,
}

#[derive(Default)]
pub struct InMemoryConversationRepository {
    table: RwLock<ConversationTable>,
}

#[async_trait]
impl ConversationGateway for InMemoryConversationRepository {
    async fn get_or_create(
        &self,
        key: &ConversationKey,
        context_type: ContextType,
        now: DateTime<Utc>,
    ) -> Result<Conversation, GatewayError> {
        let mut table = self.table.write().await;
        let map_key =
            (key.user_id, key.channel_id.clone(), key.thread_ts.clone().unwrap_or_default());
        if let Some(existing) = table.conversations.get_mut(&map_key) {
            existing.updated_at = now;
            return Ok(existing.clone());
        }

        table.next_conversation_id += 1;
        let conversation = Conversation {
            id: ConversationId(table.next_conversation_id),
            user_id: key.user_id,
            channel_id: key.channel_id.clone(),
            thread_ts: key.thread_ts.clone(),
            context_type,
            created_at: now,
            updated_at: now,
        };
        table.conversations.insert(map_key, conversation.clone());
        Ok(conversation)
    }

    async fn append_message(
        &self,
        message: NewMessage,
        now: DateTime<Utc>,
    ) -> Result<Message, GatewayError> {
        let mut table = self.table.write().await;
        table.next_message_id += 1;
        let stored = Message {
            id: MessageId(table.next_message_id),
            conversation_id: message.conversation_id,
            sender_type: message.sender_type,
            content: message.content,
            intent: message.intent,
            metadata: message.metadata,
            created_at: now,
        };
        table.messages.push(stored.clone());
        Ok(stored)
    }

    async fn recent_messages(
        &self,
        conversation_id: ConversationId,
        limit: u32,
    ) -> Result<Vec<Message>, GatewayError> {
        let table = self.table.read().await;
        let matching: Vec<_> =
            table.messages.iter().filter(|m| m.conversation_id == conversation_id).collect();
        let skip = matching.len().saturating_sub(limit as usize);
        Ok(matching.into_iter().skip(skip).cloned().collect())
    }
}

#[derive(Default)]
struct TaskTable {
    tasks: BTreeMap<i64, Task>,
    next_id: i64,
}

/// Version-checked task store, equivalent to the SQL repository's semantics.
#[derive(Default)]
pub struct InMemoryTaskRepository {
    table: RwLock<TaskTable>,
}

#[async_trait]
impl TaskGateway for InMemoryTaskRepository {
    async fn insert(&self, task: NewTask, now: DateTime<Utc>) -> Result<Task, GatewayError> {
        let mut table = self.table.write().await;
        table.next_id += 1;
        let stored = Task {
            id: TaskId(table.next_id),
            title: task.title,
            description: task.description,
            status: TaskStatus::Pending,
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
        };
        table.tasks.insert(stored.id.0, stored.clone());
        Ok(stored)
    }

    async fn find_by_id(&self, id: TaskId) -> Result<Option<Task>, GatewayError> {
        Ok(self.table.read().await.tasks.get(&id.0).cloned())
    }

    async fn list_for_user(
        &self,
        user: UserId,
        filter: &TaskFilter,
    ) -> Result<Vec<Task>, GatewayError> {
        let table = self.table.read().await;
        let mut tasks: Vec<Task> = table
            .tasks
            .values()
            .filter(|task| task.involves(user))
            .filter(|task| filter.status.map_or(true, |status| task.status == status))
            .filter(|task| {
                filter.completed_since.map_or(true, |since| {
                    task.completed_at.is_some_and(|completed_at| completed_at >= since)
                })
            })
            .cloned()
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.0.cmp(&a.id.0)));
        if let Some(limit) = filter.limit {
            tasks.truncate(limit as usize);
        }
        Ok(tasks)
    }

    async fn update(&self, task: &Task, expected_version: u32) -> Result<Task, GatewayError> {
        let mut table = self.table.write().await;
        let stored = table
            .tasks
            .get_mut(&task.id.0)
            .ok_or_else(|| GatewayError::NotFound { entity: "task", id: task.id.to_string() })?;
        if stored.version != expected_version {
            return Err(GatewayError::Conflict {
                entity: "task",
                id: task.id.to_string(),
                expected: expected_version,
            });
        }

        let mut next = task.clone();
        next.version = expected_version + 1;
        *stored = next.clone();
        Ok(next)
    }
}

#[derive(Default)]
struct TimeEntryTable {
    entries: Vec<TimeEntry>,
    next_id: i64,
}

impl TimeEntryTable {
    fn stop_all(&mut self, user: UserId, at: DateTime<Utc>) -> Vec<TimeEntry> {
        let mut stopped = Vec::new();
        for entry in self.entries.iter_mut().filter(|e| e.user_id == user && e.is_active) {
            *entry = entry.stopped_at(at);
            stopped.push(entry.clone());
        }
        stopped
    }
}

#[derive(Default)]
pub struct InMemoryTimeEntryRepository {
    table: RwLock<TimeEntryTable>,
}

#[async_trait]
impl TimeEntryGateway for InMemoryTimeEntryRepository {
    async fn find_active(&self, user: UserId) -> Result<Vec<TimeEntry>, GatewayError> {
        let table = self.table.read().await;
        Ok(table.entries.iter().filter(|e| e.user_id == user && e.is_active).cloned().collect())
    }

    async fn start_exclusive(
        &self,
        entry: NewTimeEntry,
        at: DateTime<Utc>,
    ) -> Result<TimeEntryStart, GatewayError> {
        let mut table = self.table.write().await;
        let stopped = table.stop_all(entry.user_id, at);
        table.next_id += 1;
        let started = TimeEntry {
            id: TimeEntryId(table.next_id),
            user_id: entry.user_id,
            task_id: entry.task_id,
            description: entry.description,
            start_time: at,
            end_time: None,
            duration_seconds: None,
            is_active: true,
            created_at: at,
        };
        table.entries.push(started.clone());
        Ok(TimeEntryStart { stopped, started })
    }

    async fn stop_active(
        &self,
        user: UserId,
        at: DateTime<Utc>,
    ) -> Result<Vec<TimeEntry>, GatewayError> {
        Ok(self.table.write().await.stop_all(user, at))
    }

    async fn list_since(
        &self,
        user: UserId,
        since: DateTime<Utc>,
    ) -> Result<Vec<TimeEntry>, GatewayError> {
        let table = self.table.read().await;
        let mut entries: Vec<TimeEntry> = table
            .entries
            .iter()
            .filter(|e| e.user_id == user && e.start_time >= since)
            .cloned()
            .collect();
        entries.sort_by_key(|e| (e.start_time, e.id.0));
        Ok(entries)
    }
}

#[derive(Default)]
pub struct InMemoryAuditRepository {
    entries: RwLock<Vec<AuditLogEntry>>,
}

impl InMemoryAuditRepository {
    pub async fn entries(&self) -> Vec<AuditLogEntry> {
        self.entries.read().await.clone()
    }
}

#[async_trait]
impl AuditGateway for InMemoryAuditRepository {
    async fn append(&self, entry: &AuditLogEntry) -> Result<(), GatewayError> {
        self.entries.write().await.push(entry.clone());
        Ok(())
    }

    async fn list_for_user(
        &self,
        user: &str,
        limit: u32,
    ) -> Result<Vec<AuditLogEntry>, GatewayError> {
        let entries = self.entries.read().await;
        Ok(entries.iter().rev().filter(|e| e.user == user).take(limit as usize).cloned().collect())
    }
}
