//! Command identifiers, the bilingual argument grammar and the router.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use tracing::{debug, info};

use dona_core::domain::conversation::ContextType;
use dona_core::domain::task::{TaskId, TaskPriority, TaskStatus};
use dona_core::domain::user::PlatformIdentity;
use dona_core::errors::{ApplicationError, DomainError};

use crate::blocks::{bilingual_notice, MessageTemplate};

pub const CONVERSATION_COMMAND: &str = "/dona";

const MAX_SUGGESTIONS: usize = 3;
const MAX_SUGGESTION_DISTANCE: usize = 3;

/// What a handler learns about the request besides its arguments.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoutingContext {
    pub correlation_id: String,
    pub command: String,
    pub identity: PlatformIdentity,
    pub channel_id: String,
    pub thread_ts: Option<String>,
    pub context: ContextType,
}

#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(
        &self,
        args: &str,
        ctx: &RoutingContext,
    ) -> Result<MessageTemplate, ApplicationError>;
}

/// Maps command identifiers to handlers. Routing performs no business logic.
#[derive(Default)]
pub struct CommandRouter {
    handlers: BTreeMap<String, Arc<dyn CommandHandler>>,
}

impl CommandRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, command: impl Into<String>, handler: Arc<dyn CommandHandler>) {
        self.handlers.insert(command.into(), handler);
    }

    pub fn with(mut self, command: impl Into<String>, handler: Arc<dyn CommandHandler>) -> Self {
        self.register(command, handler);
        self
    }

    pub fn commands(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    pub fn contains(&self, command: &str) -> bool {
        self.handlers.contains_key(command)
    }

    /// Nearest registered commands by edit distance, closest first and
    /// alphabetical among equals.
    pub fn suggest(&self, command: &str) -> Vec<String> {
        let wanted = command.trim().to_lowercase();
        let mut scored: Vec<(usize, &str)> = self
            .commands()
            .map(|known| (edit_distance(&wanted, known), known))
            .filter(|(distance, _)| *distance <= MAX_SUGGESTION_DISTANCE)
            .collect();
        // BTreeMap iteration is already alphabetical; a stable sort keeps it
        scored.sort_by_key(|(distance, _)| *distance);
        scored.into_iter().take(MAX_SUGGESTIONS).map(|(_, known)| known.to_owned()).collect()
    }

    pub async fn route(
        &self,
        command: &str,
        args: &str,
        ctx: &RoutingContext,
    ) -> Result<MessageTemplate, ApplicationError> {
        let Some(handler) = self.handlers.get(command) else {
            let suggestions = self.suggest(command);
            info!(
                event_name = "slack.router.unknown_command",
                correlation_id = %ctx.correlation_id,
                command,
                suggestions = ?suggestions,
                "no handler registered for command"
            );
            return Ok(unknown_command_message(command, &suggestions));
        };

        debug!(
            event_name = "slack.router.dispatched",
            correlation_id = %ctx.correlation_id,
            command,
            context = ctx.context.as_str(),
            "routing command"
        );
        handler.handle(args, ctx).await
    }
}

pub fn unknown_command_message(command: &str, suggestions: &[String]) -> MessageTemplate {
    if suggestions.is_empty() {
        return bilingual_notice(
            "dona.router.unknown.v1",
            &format!("No conozco el comando `{command}`. Usa `/dona-help` para ver los comandos."),
            &format!("Unknown command `{command}`. Use `/dona-help` to list commands."),
        );
    }

    let listed =
        suggestions.iter().map(|s| format!("`{s}`")).collect::<Vec<_>>().join(", ");
    bilingual_notice(
        "dona.router.unknown.v1",
        &format!("No conozco el comando `{command}`. ¿Quisiste decir {listed}?"),
        &format!("Unknown command `{command}`. Did you mean {listed}?"),
    )
}

fn edit_distance(a: &str, b: &str) -> usize {
    let b_chars: Vec<char> = b.chars().collect();
    let mut previous: Vec<usize> = (0..=b_chars.len()).collect();
    let mut current = vec![0; b_chars.len() + 1];

    for (i, a_char) in a.chars().enumerate() {
        current[0] = i + 1;
        for (j, b_char) in b_chars.iter().enumerate() {
            let substitution = previous[j] + usize::from(a_char != *b_char);
            current[j + 1] = substitution.min(previous[j + 1] + 1).min(current[j] + 1);
        }
        std::mem::swap(&mut previous, &mut current);
    }
    previous[b_chars.len()]
}

/// Splits an optional leading sub-action keyword off the arguments. The rest
/// is returned trimmed; without a recognised keyword it is the whole input.
pub fn split_action<A: Copy>(text: &str, keywords: &[(&str, A)]) -> (Option<A>, String) {
    let trimmed = text.trim();
    let (head, rest) = match trimmed.split_once(char::is_whitespace) {
        Some((head, rest)) => (head, rest.trim()),
        None => (trimmed, ""),
    };
    let head = head.to_lowercase();

    match keywords.iter().find(|(keyword, _)| *keyword == head) {
        Some((_, action)) => (Some(*action), rest.to_owned()),
        None => (None, trimmed.to_owned()),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskAction {
    Create,
    List,
    Start,
    Complete,
    Cancel,
}

pub const TASK_ACTIONS: &[(&str, TaskAction)] = &[
    ("create", TaskAction::Create),
    ("new", TaskAction::Create),
    ("add", TaskAction::Create),
    ("crear", TaskAction::Create),
    ("nueva", TaskAction::Create),
    ("agregar", TaskAction::Create),
    ("list", TaskAction::List),
    ("ls", TaskAction::List),
    ("listar", TaskAction::List),
    ("lista", TaskAction::List),
    ("start", TaskAction::Start),
    ("begin", TaskAction::Start),
    ("iniciar", TaskAction::Start),
    ("empezar", TaskAction::Start),
    ("complete", TaskAction::Complete),
    ("done", TaskAction::Complete),
    ("finish", TaskAction::Complete),
    ("completar", TaskAction::Complete),
    ("terminar", TaskAction::Complete),
    ("hecho", TaskAction::Complete),
    ("cancel", TaskAction::Cancel),
    ("cancelar", TaskAction::Cancel),
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeAction {
    Start,
    Stop,
    Status,
}

pub const TIME_ACTIONS: &[(&str, TimeAction)] = &[
    ("start", TimeAction::Start),
    ("iniciar", TimeAction::Start),
    ("empezar", TimeAction::Start),
    ("stop", TimeAction::Stop),
    ("parar", TimeAction::Stop),
    ("detener", TimeAction::Stop),
    ("status", TimeAction::Status),
    ("estado", TimeAction::Status),
];

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SummaryPeriod {
    #[default]
    Today,
    Week,
}

pub const SUMMARY_PERIODS: &[(&str, SummaryPeriod)] = &[
    ("today", SummaryPeriod::Today),
    ("hoy", SummaryPeriod::Today),
    ("week", SummaryPeriod::Week),
    ("semana", SummaryPeriod::Week),
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigSetting {
    Language,
    Timezone,
    Notifications,
}

pub const CONFIG_SETTINGS: &[(&str, ConfigSetting)] = &[
    ("language", ConfigSetting::Language),
    ("lang", ConfigSetting::Language),
    ("idioma", ConfigSetting::Language),
    ("timezone", ConfigSetting::Timezone),
    ("tz", ConfigSetting::Timezone),
    ("zona", ConfigSetting::Timezone),
    ("notifications", ConfigSetting::Notifications),
    ("notificaciones", ConfigSetting::Notifications),
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MetricsScope {
    Personal,
}

pub const METRICS_SCOPES: &[(&str, MetricsScope)] =
    &[("me", MetricsScope::Personal), ("yo", MetricsScope::Personal)];

pub fn parse_priority(word: &str) -> Option<TaskPriority> {
    match word.trim().to_lowercase().as_str() {
        "low" | "baja" => Some(TaskPriority::Low),
        "medium" | "media" | "normal" => Some(TaskPriority::Medium),
        "high" | "alta" => Some(TaskPriority::High),
        "urgent" | "urgente" => Some(TaskPriority::Urgent),
        _ => None,
    }
}

pub fn parse_status(word: &str) -> Option<TaskStatus> {
    match word.trim().to_lowercase().as_str() {
        "pending" | "pendiente" | "pendientes" => Some(TaskStatus::Pending),
        "in_progress" | "progress" | "started" | "en_progreso" | "progreso" => {
            Some(TaskStatus::InProgress)
        }
        "completed" | "done" | "completada" | "completadas" => Some(TaskStatus::Completed),
        "cancelled" | "canceled" | "cancelada" | "canceladas" => Some(TaskStatus::Cancelled),
        _ => None,
    }
}

pub fn parse_toggle(word: &str) -> Option<bool> {
    match word.trim().to_lowercase().as_str() {
        "on" | "yes" | "true" | "si" | "sí" | "activar" => Some(true),
        "off" | "no" | "false" | "desactivar" => Some(false),
        _ => None,
    }
}

/// Accepts `#12` or `12`.
pub fn parse_task_ref(token: &str) -> Option<TaskId> {
    token
        .trim()
        .trim_start_matches('#')
        .parse::<i64>()
        .ok()
        .filter(|id| *id > 0)
        .map(TaskId)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskDraft {
    pub title: String,
    pub priority: Option<TaskPriority>,
    pub due_date: Option<NaiveDate>,
    pub dependencies: Vec<TaskId>,
}

/// `<title> [!priority] [due:YYYY-MM-DD] [after:#id]`, with the markers
/// allowed anywhere in the text.
pub fn parse_task_draft(text: &str) -> Result<TaskDraft, DomainError> {
    let mut title_words = Vec::new();
    let mut priority = None;
    let mut due_date = None;
    let mut dependencies = Vec::new();

    for token in text.split_whitespace() {
        if let Some(word) = token.strip_prefix('!') {
            priority = Some(parse_priority(word).ok_or_else(|| {
                DomainError::Validation(format!(
                    "unknown priority `{word}` (use low, medium, high or urgent)"
                ))
            })?);
        } else if let Some(date) = token.strip_prefix("due:") {
            due_date = Some(NaiveDate::parse_from_str(date, "%Y-%m-%d").map_err(|_| {
                DomainError::Validation(format!("`{date}` is not a date (expected YYYY-MM-DD)"))
            })?);
        } else if let Some(reference) = token.strip_prefix("after:") {
            dependencies.push(parse_task_ref(reference).ok_or_else(|| {
                DomainError::Validation(format!("`{reference}` is not a task reference"))
            })?);
        } else {
            title_words.push(token);
        }
    }

    let title = title_words
        .join(" ")
        .trim_matches(|ch| matches!(ch, '"' | '\'' | '“' | '”'))
        .trim()
        .to_owned();

    Ok(TaskDraft { title, priority, due_date, dependencies })
}
