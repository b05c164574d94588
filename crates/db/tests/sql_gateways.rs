use chrono::{DateTime, Duration, TimeZone, Utc};

use dona_core::audit::AuditLogEntry;
use dona_core::domain::conversation::{ContextType, ConversationKey, NewMessage, SenderType};
use dona_core::domain::task::{NewTask, TaskFilter, TaskPriority, TaskStatus};
use dona_core::domain::time_entry::NewTimeEntry;
use dona_core::domain::user::{Language, PlatformIdentity, UserId, UserPreferences};
use dona_core::gateway::{
    AuditGateway, ConversationGateway, GatewayError, TaskGateway, TimeEntryGateway, UserGateway,
};
use dona_db::{
    connect_with_settings, migrations, DbPool, SqlAuditRepository, SqlConversationRepository,
    SqlTaskRepository, SqlTimeEntryRepository, SqlUserRepository,
};

type TestResult = Result<(), String>;

macro_rules! require {
    ($cond:expr, $($arg:tt)*) => {
        if !$cond {
            return Err(format!($($arg)*));
        }
    };
}

async fn setup() -> Result<DbPool, String> {
    let pool = connect_with_settings("sqlite::memory:", 1, 30)
        .await
        .map_err(|e| format!("connect: {e}"))?;
    migrations::run_pending(&pool).await.map_err(|e| format!("migrate: {e}"))?;
    Ok(pool)
}

fn at(hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, hour, minute, 0).single().unwrap_or_else(Utc::now)
}

async fn seeded_user(pool: &DbPool, platform_user_id: &str) -> Result<UserId, String> {
    SqlUserRepository::new(pool.clone())
        .get_or_create(&PlatformIdentity::new(platform_user_id, "T1"), at(8, 0))
        .await
        .map(|user| user.id)
        .map_err(|e| e.to_string())
}

#[tokio::test]
async fn users_are_created_once_and_preferences_persist() -> TestResult {
    let pool = setup().await?;
    let repo = SqlUserRepository::new(pool);
    let identity = PlatformIdentity::new("U1", "T1");

    let created = repo.get_or_create(&identity, at(9, 0)).await.map_err(|e| e.to_string())?;
    let again = repo.get_or_create(&identity, at(9, 5)).await.map_err(|e| e.to_string())?;
    require!(created.id == again.id, "second lookup should return the same user");
    require!(created.preferences.language == Language::Es, "default language should be es");
    require!(
        created.preferences.timezone == "America/Mexico_City",
        "default timezone should be America/Mexico_City"
    );

    let preferences = UserPreferences {
        language: Language::En,
        timezone: "Europe/Madrid".to_owned(),
        notifications_enabled: false,
    };
    let updated = repo
        .update_preferences(created.id, &preferences, at(10, 0))
        .await
        .map_err(|e| e.to_string())?;
    require!(updated.preferences == preferences, "preferences should round trip");
    require!(updated.updated_at == at(10, 0), "updated_at should move");

    let missing = repo.update_preferences(UserId(999), &preferences, at(10, 0)).await;
    require!(
        matches!(missing, Err(GatewayError::NotFound { .. })),
        "unknown user should be NotFound, got {missing:?}"
    );
    Ok(())
}

#[tokio::test]
async fn conversation_keeps_last_messages_in_order() -> TestResult {
    let pool = setup().await?;
    let user = seeded_user(&pool, "U1").await?;
    let repo = SqlConversationRepository::new(pool);
    let key = ConversationKey { user_id: user, channel_id: "C1".to_owned(), thread_ts: None };

    let conversation = repo
        .get_or_create(&key, ContextType::Public, at(9, 0))
        .await
        .map_err(|e| e.to_string())?;
    let same = repo
        .get_or_create(&key, ContextType::Public, at(9, 1))
        .await
        .map_err(|e| e.to_string())?;
    require!(conversation.id == same.id, "conversation should be reused");

    for n in 0..7u32 {
        let message = NewMessage::new(conversation.id, SenderType::User, format!("m{n}"))
            .with_intent("question")
            .with_metadata("n", n.to_string());
        repo.append_message(message, at(9, 2 + n)).await.map_err(|e| e.to_string())?;
    }

    let recent = repo.recent_messages(conversation.id, 5).await.map_err(|e| e.to_string())?;
    let contents: Vec<_> = recent.iter().map(|m| m.content.as_str()).collect();
    require!(contents == ["m2", "m3", "m4", "m5", "m6"], "unexpected window {contents:?}");
    require!(
        recent[0].metadata.get("n").map(String::as_str) == Some("2"),
        "metadata should round trip"
    );
    Ok(())
}

#[tokio::test]
async fn task_update_is_version_checked() -> TestResult {
    let pool = setup().await?;
    let user = seeded_user(&pool, "U1").await?;
    let repo = SqlTaskRepository::new(pool);

    let mut new_task = NewTask::for_user(user, "draft report");
    new_task.priority = TaskPriority::High;
    new_task.due_date = chrono::NaiveDate::from_ymd_opt(2026, 3, 10);
    let task = repo.insert(new_task, at(9, 0)).await.map_err(|e| e.to_string())?;
    require!(task.status == TaskStatus::Pending, "new tasks start pending");
    require!(task.completed_at.is_none(), "new tasks have no completion time");

    let started = task.transition(TaskStatus::InProgress, at(9, 30)).map_err(|e| e.to_string())?;
    let stored = repo.update(&started.task, task.version).await.map_err(|e| e.to_string())?;
    require!(stored.version == task.version + 1, "version should be bumped");

    let stale = repo.update(&started.task, task.version).await;
    require!(
        matches!(stale, Err(GatewayError::Conflict { .. })),
        "stale write should conflict, got {stale:?}"
    );

    let reloaded = repo.find_by_id(task.id).await.map_err(|e| e.to_string())?;
    let reloaded = reloaded.ok_or("task should exist")?;
    require!(reloaded.status == TaskStatus::InProgress, "stored status should be in_progress");
    require!(reloaded.due_date == task.due_date, "due date should round trip");
    require!(reloaded.priority == TaskPriority::High, "priority should round trip");
    Ok(())
}

#[tokio::test]
async fn task_listing_filters_by_status_and_completion_time() -> TestResult {
    let pool = setup().await?;
    let owner = seeded_user(&pool, "U1").await?;
    let stranger = seeded_user(&pool, "U2").await?;
    let repo = SqlTaskRepository::new(pool);

    let mut ids = Vec::new();
    for (n, title) in ["one", "two", "three"].into_iter().enumerate() {
        let task = repo
            .insert(NewTask::for_user(owner, title), at(9, n as u32))
            .await
            .map_err(|e| e.to_string())?;
        ids.push(task);
    }
    repo.insert(NewTask::for_user(stranger, "not mine"), at(9, 5))
        .await
        .map_err(|e| e.to_string())?;

    let first = &ids[0];
    let started = first.transition(TaskStatus::InProgress, at(10, 0)).map_err(|e| e.to_string())?;
    let started = repo.update(&started.task, first.version).await.map_err(|e| e.to_string())?;
    let done = started.transition(TaskStatus::Completed, at(11, 0)).map_err(|e| e.to_string())?;
    repo.update(&done.task, started.version).await.map_err(|e| e.to_string())?;

    let all = repo.list_for_user(owner, &TaskFilter::default()).await.map_err(|e| e.to_string())?;
    let titles: Vec<_> = all.iter().map(|t| t.title.as_str()).collect();
    require!(titles == ["three", "two", "one"], "newest first, own tasks only: {titles:?}");

    let pending = repo
        .list_for_user(
            owner,
            &TaskFilter { status: Some(TaskStatus::Pending), ..TaskFilter::default() },
        )
        .await
        .map_err(|e| e.to_string())?;
    require!(pending.len() == 2, "two tasks should still be pending");

    let completed_today = repo
        .list_for_user(
            owner,
            &TaskFilter { completed_since: Some(at(10, 30)), ..TaskFilter::default() },
        )
        .await
        .map_err(|e| e.to_string())?;
    require!(completed_today.len() == 1, "one task completed after 10:30");
    require!(
        completed_today[0].completed_at == Some(at(11, 0)),
        "completion time should round trip"
    );

    let limited = repo
        .list_for_user(owner, &TaskFilter { limit: Some(1), ..TaskFilter::default() })
        .await
        .map_err(|e| e.to_string())?;
    require!(limited.len() == 1, "limit should apply");
    Ok(())
}

#[tokio::test]
async fn starting_time_entry_closes_previous_in_one_transaction() -> TestResult {
    let pool = setup().await?;
    let user = seeded_user(&pool, "U1").await?;
    let repo = SqlTimeEntryRepository::new(pool);
    let entry = || NewTimeEntry { user_id: user, task_id: None, description: Some("focus".to_owned()) };

    let first = repo.start_exclusive(entry(), at(9, 0)).await.map_err(|e| e.to_string())?;
    require!(first.stopped.is_empty(), "nothing to stop on first start");
    require!(first.started.is_active, "first entry should be active");

    let second = repo.start_exclusive(entry(), at(9, 45)).await.map_err(|e| e.to_string())?;
    require!(second.stopped.len() == 1, "first entry should be stopped");
    require!(second.stopped[0].end_time == Some(at(9, 45)), "end time should be set");
    require!(second.stopped[0].duration_seconds == Some(45 * 60), "duration should be derived");

    let active = repo.find_active(user).await.map_err(|e| e.to_string())?;
    require!(active.len() == 1, "exactly one active entry, got {}", active.len());
    require!(active[0].id == second.started.id, "second entry should be the active one");

    let stopped = repo.stop_active(user, at(10, 0)).await.map_err(|e| e.to_string())?;
    require!(stopped.len() == 1, "stop should close the active entry");
    let none = repo.stop_active(user, at(10, 5)).await.map_err(|e| e.to_string())?;
    require!(none.is_empty(), "stopping twice is a no-op");

    let listed = repo.list_since(user, at(9, 30)).await.map_err(|e| e.to_string())?;
    require!(listed.len() == 1, "only entries started after 9:30");
    Ok(())
}

#[tokio::test]
async fn partial_unique_index_rejects_second_active_entry() -> TestResult {
    let pool = setup().await?;
    let user = seeded_user(&pool, "U1").await?;
    let stamp = at(9, 0).to_rfc3339();

    let insert = |pool: DbPool, stamp: String| async move {
        sqlx::query(
            "INSERT INTO time_entries (user_id, start_time, is_active, created_at) VALUES (?, ?, 1, ?)",
        )
        .bind(user.0)
        .bind(&stamp)
        .bind(&stamp)
        .execute(&pool)
        .await
    };

    insert(pool.clone(), stamp.clone()).await.map_err(|e| e.to_string())?;
    let duplicate = insert(pool.clone(), stamp).await;
    require!(duplicate.is_err(), "second active entry should violate the index");
    Ok(())
}

#[tokio::test]
async fn audit_entries_are_listed_newest_first() -> TestResult {
    let pool = setup().await?;
    let repo = SqlAuditRepository::new(pool);

    for n in 0..3 {
        let entry = AuditLogEntry::new("T1:U1", "command.received", "command", format!("req-{n}"))
            .with_entity_id("/dona-task")
            .with_metadata("context", "private")
            .occurred_at(at(9, 0) + Duration::minutes(n));
        repo.append(&entry).await.map_err(|e| e.to_string())?;
    }
    repo.append(&AuditLogEntry::new("T1:U2", "command.received", "command", "req-x"))
        .await
        .map_err(|e| e.to_string())?;

    let entries = repo.list_for_user("T1:U1", 2).await.map_err(|e| e.to_string())?;
    let ids: Vec<_> = entries.iter().map(|e| e.correlation_id.as_str()).collect();
    require!(ids == ["req-2", "req-1"], "unexpected order {ids:?}");
    require!(
        entries[0].metadata.get("context").map(String::as_str) == Some("private"),
        "metadata should round trip"
    );
    Ok(())
}
