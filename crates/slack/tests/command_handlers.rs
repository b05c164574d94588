use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

use dona_agent::{AgentRuntime, AgentSettings, ScriptedLlmClient, ScriptedOutcome};
use dona_core::audit::InMemoryAuditSink;
use dona_core::clock::{Clock, ManualClock};
use dona_core::config::{AccessConfig, Environment};
use dona_core::domain::conversation::{ContextType, ConversationKey, SenderType};
use dona_core::domain::task::{TaskId, TaskStatus};
use dona_core::domain::user::PlatformIdentity;
use dona_core::gateway::{ConversationGateway, UserGateway};
use dona_core::lifecycle::{TaskLifecycleManager, TimeEntryLifecycleManager};
use dona_core::rate_limit::RateLimiter;
use dona_core::retry::RetryPolicy;
use dona_db::{
    InMemoryConversationRepository, InMemoryTaskRepository, InMemoryTimeEntryRepository,
    InMemoryUserRepository,
};
use dona_slack::commands::{CommandRouter, RoutingContext};
use dona_slack::handlers::{build_router, Services};
use dona_slack::metrics::RequestMetrics;

fn start_of_day() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).single().expect("valid timestamp")
}

struct Fixture {
    router: CommandRouter,
    services: Arc<Services>,
    users: Arc<InMemoryUserRepository>,
    conversations: Arc<InMemoryConversationRepository>,
    clock: Arc<ManualClock>,
}

fn fixture_with(llm: ScriptedLlmClient, admin_users: Vec<String>) -> Fixture {
    let clock = Arc::new(ManualClock::new(start_of_day()));
    let users = Arc::new(InMemoryUserRepository::default());
    let conversations = Arc::new(InMemoryConversationRepository::default());
    let agent = AgentRuntime::new(
        Arc::new(llm),
        AgentSettings {
            enabled: true,
            reply_timeout: Duration::from_secs(2),
            intent_timeout: Duration::from_secs(2),
            retry: RetryPolicy::none(),
        },
    );

    let services = Arc::new(Services {
        users: users.clone(),
        conversations: conversations.clone(),
        tasks: Arc::new(TaskLifecycleManager::new(
            Arc::new(InMemoryTaskRepository::default()),
            clock.clone(),
            RetryPolicy::none(),
        )),
        time_entries: Arc::new(TimeEntryLifecycleManager::new(
            Arc::new(InMemoryTimeEntryRepository::default()),
            clock.clone(),
            RetryPolicy::none(),
        )),
        agent: Arc::new(agent),
        limiter: Arc::new(RateLimiter::default()),
        metrics: Arc::new(RequestMetrics::new()),
        audit: Arc::new(InMemoryAuditSink::default()),
        access: AccessConfig { admin_users, environment: Environment::Production },
        clock: clock.clone(),
        retry: RetryPolicy::none(),
    });

    Fixture { router: build_router(services.clone()), services, users, conversations, clock }
}

fn fixture() -> Fixture {
    fixture_with(ScriptedLlmClient::default(), Vec::new())
}

fn ctx(command: &str, user: &str, channel_id: &str) -> RoutingContext {
    RoutingContext {
        correlation_id: format!("req-{command}"),
        command: command.to_owned(),
        identity: PlatformIdentity::new(user, "T1"),
        channel_id: channel_id.to_owned(),
        thread_ts: None,
        context: if channel_id.starts_with('D') { ContextType::Private } else { ContextType::Public },
    }
}

impl Fixture {
    async fn run(&self, command: &str, args: &str, user: &str, channel_id: &str) -> String {
        self.router
            .route(command, args, &ctx(command, user, channel_id))
            .await
            .expect("handler should answer")
            .fallback_text
    }
}

#[tokio::test]
async fn task_is_created_pending_and_completed_once() {
    let fixture = fixture();

    let created = fixture.run("/dona-task", "create \"draft report\" !alta", "U1", "C1").await;
    assert!(created.contains("#1"), "unexpected reply: {created}");
    assert!(created.contains("draft report"));

    let task = fixture.services.tasks.get(TaskId(1)).await.expect("task exists");
    assert_eq!(task.status, TaskStatus::Pending);
    assert!(task.completed_at.is_none());
    assert_eq!(task.channel_id.as_deref(), Some("C1"));

    fixture.clock.advance(chrono::Duration::minutes(20));
    let completed = fixture.run("/dona-task", "completar #1", "U1", "C1").await;
    assert!(completed.contains("completada"), "unexpected reply: {completed}");

    let task = fixture.services.tasks.get(TaskId(1)).await.expect("task exists");
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.completed_at, Some(start_of_day() + chrono::Duration::minutes(20)));

    fixture.clock.advance(chrono::Duration::minutes(5));
    let again = fixture.run("/dona-task", "done #1", "U1", "C1").await;
    assert!(again.contains("ya estaba completada"), "unexpected reply: {again}");
    let task = fixture.services.tasks.get(TaskId(1)).await.expect("task exists");
    assert_eq!(task.completed_at, Some(start_of_day() + chrono::Duration::minutes(20)));
}

#[tokio::test]
async fn bare_task_text_creates_and_empty_text_lists() {
    let fixture = fixture();

    fixture.run("/dona-task", "llamar al banco due:2026-03-05", "U1", "C1").await;
    let listed = fixture.run("/dona-task", "", "U1", "C1").await;

    assert!(listed.contains("#1 llamar al banco"), "unexpected reply: {listed}");
    assert!(listed.contains("2026-03-05"));
}

#[tokio::test]
async fn tasks_of_other_users_cannot_be_changed() {
    let fixture = fixture();
    fixture.run("/dona-task", "create propuesta", "U1", "C1").await;

    let reply = fixture.run("/dona-task", "cancel #1", "U2", "C1").await;
    assert!(reply.contains("No pude hacerlo"), "unexpected reply: {reply}");

    let task = fixture.services.tasks.get(TaskId(1)).await.expect("task exists");
    assert_eq!(task.status, TaskStatus::Pending);
}

#[tokio::test]
async fn dependencies_must_name_existing_tasks_of_the_user() {
    let fixture = fixture();
    fixture.run("/dona-task", "create base", "U1", "C1").await;
    fixture.run("/dona-task", "create ajena", "U2", "C1").await;

    let missing = fixture.run("/dona-task", "create informe after:#99", "U1", "C1").await;
    assert!(missing.contains("No encontré"), "unexpected reply: {missing}");
    assert!(missing.contains("#99"), "unexpected reply: {missing}");

    let foreign = fixture.run("/dona-task", "create informe after:#2", "U1", "C1").await;
    assert!(foreign.contains("does not belong"), "unexpected reply: {foreign}");

    let accepted = fixture.run("/dona-task", "create informe after:#1", "U1", "C1").await;
    assert!(accepted.contains("#3"), "unexpected reply: {accepted}");
    let task = fixture.services.tasks.get(TaskId(3)).await.expect("task exists");
    assert_eq!(task.dependencies, vec![TaskId(1)]);
}

#[tokio::test]
async fn reminders_are_validated_and_reported_as_unscheduled() {
    let fixture = fixture();

    let usage = fixture.run("/dona-remind", "", "U1", "C1").await;
    assert!(usage.contains("/dona-remind mañana"), "unexpected reply: {usage}");

    let incomplete = fixture.run("/dona-remind", "mañana", "U1", "C1").await;
    assert!(incomplete.contains("Indica cuándo y qué recordar"), "unexpected reply: {incomplete}");

    let accepted = fixture.run("/dona-remind", "viernes enviar factura", "U1", "C1").await;
    assert!(accepted.contains("enviar factura"), "unexpected reply: {accepted}");
    assert!(accepted.contains("todavía no programo recordatorios"), "unexpected reply: {accepted}");

    let help = fixture.run("/dona-help", "", "U1", "C1").await;
    assert!(help.contains("/dona-remind"));
}

#[tokio::test]
async fn starting_a_timer_stops_the_previous_one() {
    let fixture = fixture();

    let first = fixture.run("/dona-time", "start escribir informe", "U1", "C1").await;
    assert!(first.contains("escribir informe"));

    fixture.clock.advance(chrono::Duration::minutes(45));
    let second = fixture.run("/dona-time", "iniciar revisar correo", "U1", "C1").await;
    assert!(second.contains("revisar correo"));

    let user = fixture
        .users
        .get_or_create(&PlatformIdentity::new("U1", "T1"), fixture.clock.now())
        .await
        .expect("user");
    let active = fixture.services.time_entries.active(user.id).await.expect("active");
    assert_eq!(active.and_then(|entry| entry.description), Some("revisar correo".to_owned()));

    fixture.clock.advance(chrono::Duration::minutes(15));
    let stopped = fixture.run("/dona-time", "stop", "U1", "C1").await;
    assert!(stopped.contains("15m"), "unexpected reply: {stopped}");

    let idle = fixture.run("/dona-time", "", "U1", "C1").await;
    assert!(idle.contains("No tienes un cronómetro activo"));
}

#[tokio::test]
async fn timers_can_only_reference_own_tasks() {
    let fixture = fixture();
    fixture.run("/dona-task", "create propuesta", "U1", "C1").await;

    let reply = fixture.run("/dona-time", "start #1", "U2", "C1").await;
    assert!(reply.contains("does not belong"), "unexpected reply: {reply}");
}

#[tokio::test]
async fn status_and_summary_reflect_the_day() {
    let fixture = fixture();
    fixture.run("/dona-task", "create uno", "U1", "C1").await;
    fixture.run("/dona-task", "create dos", "U1", "C1").await;
    fixture.run("/dona-task", "complete #2", "U1", "C1").await;
    fixture.run("/dona-time", "start foco", "U1", "C1").await;
    fixture.clock.advance(chrono::Duration::minutes(90));

    let status = fixture.run("/dona-status", "", "U1", "C1").await;
    assert!(status.contains("1 tareas abiertas"), "unexpected reply: {status}");

    let summary = fixture.run("/dona-summary", "hoy", "U1", "C1").await;
    assert!(summary.contains("1 tareas completadas"), "unexpected reply: {summary}");
    assert!(summary.contains("1h 30m"), "unexpected reply: {summary}");
}

#[tokio::test]
async fn language_preference_changes_reply_language() {
    let fixture = fixture();

    let updated = fixture.run("/dona-config", "idioma en", "U1", "D1").await;
    assert!(updated.contains("Preferences updated."), "unexpected reply: {updated}");

    let listed = fixture.run("/dona-task", "list", "U1", "D1").await;
    assert_eq!(listed, "📭 You have no tasks here.");

    let rejected = fixture.run("/dona-config", "timezone Mars", "U1", "D1").await;
    assert!(rejected.contains("not a timezone"), "unexpected reply: {rejected}");
}

#[tokio::test]
async fn conversation_turns_are_persisted_with_intent() {
    let llm = ScriptedLlmClient::new([
        ScriptedOutcome::Reply(r#"{"intent": "task", "confidence": 8}"#.to_owned()),
        ScriptedOutcome::Reply("Claro, lo anoto.".to_owned()),
    ]);
    let fixture = fixture_with(llm, Vec::new());

    let reply = fixture.run("/dona", "necesito preparar la demo", "U1", "D1").await;
    assert_eq!(reply, "Claro, lo anoto.");

    let user = fixture
        .users
        .get_or_create(&PlatformIdentity::new("U1", "T1"), fixture.clock.now())
        .await
        .expect("user");
    let key = ConversationKey { user_id: user.id, channel_id: "D1".to_owned(), thread_ts: None };
    let conversation = fixture
        .conversations
        .get_or_create(&key, ContextType::Private, fixture.clock.now())
        .await
        .expect("conversation");
    assert_eq!(conversation.context_type, ContextType::Private);

    let messages =
        fixture.conversations.recent_messages(conversation.id, 10).await.expect("messages");
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].sender_type, SenderType::User);
    assert_eq!(messages[0].intent.as_deref(), Some("task"));
    assert_eq!(messages[1].sender_type, SenderType::Assistant);
    assert_eq!(messages[1].metadata.get("degraded").map(String::as_str), Some("false"));
}

#[tokio::test]
async fn conversation_degrades_to_keyword_fallback() {
    let fixture = fixture();

    let reply = fixture.run("/dona", "quiero crear una tarea", "U1", "D1").await;
    assert!(reply.starts_with("Parece que quieres gestionar tareas"), "unexpected reply: {reply}");

    let greeting = fixture.run("/dona", "   ", "U1", "D1").await;
    assert!(greeting.contains("Soy Dona"));
}

#[tokio::test]
async fn metrics_require_an_admin() {
    let fixture = fixture_with(ScriptedLlmClient::default(), vec!["U9".to_owned()]);

    let denied = fixture.run("/dona-metrics", "", "U1", "D1").await;
    assert!(denied.contains("administradores"), "unexpected reply: {denied}");

    let allowed = fixture.run("/dona-metrics", "", "U9", "D9").await;
    assert!(allowed.contains("Métricas del sistema"), "unexpected reply: {allowed}");

    let personal = fixture.run("/dona-metrics", "yo", "U9", "D9").await;
    assert!(personal.contains("Tus métricas"), "unexpected reply: {personal}");
}

#[tokio::test]
async fn limits_and_help_describe_the_caller() {
    let fixture = fixture();

    let limits = fixture.run("/dona-limits", "", "U1", "C1").await;
    assert!(limits.contains("`/dona-task`: 0/10 cada 60 s"), "unexpected reply: {limits}");

    let help = fixture.run("/dona-help", "", "U1", "C1").await;
    assert!(help.contains("/dona-task"));
    assert!(!help.contains("/dona-config"));
}
