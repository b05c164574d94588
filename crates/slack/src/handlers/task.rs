use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use dona_core::domain::task::{NewTask, Task, TaskFilter, TaskPriority, TaskStatus};
use dona_core::domain::user::{Language, User};
use dona_core::errors::ApplicationError;
use dona_core::lifecycle::TaskUpdate;

use super::{or_explain, tr, Services};
use crate::blocks::{notice, MessageBuilder, MessageTemplate};
use crate::commands::{
    parse_status, parse_task_draft, parse_task_ref, split_action, CommandHandler, RoutingContext,
    TaskAction, TASK_ACTIONS,
};

const LIST_LIMIT: usize = 20;

pub struct TaskHandler {
    services: Arc<Services>,
}

impl TaskHandler {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }

    async fn create(
        &self,
        user: &User,
        text: &str,
        ctx: &RoutingContext,
    ) -> Result<MessageTemplate, ApplicationError> {
        let language = user.preferences.language;
        let draft = parse_task_draft(text)?;
        for dependency in &draft.dependencies {
            let blocker = self.services.tasks.get(*dependency).await?;
            if !blocker.involves(user.id) {
                return Err(ApplicationError::validation(format!(
                    "task {dependency} does not belong to you"
                )));
            }
        }

        let mut task = NewTask::for_user(user.id, draft.title);
        task.priority = draft.priority.unwrap_or_default();
        task.due_date = draft.due_date;
        task.dependencies = draft.dependencies;
        task.channel_id = Some(ctx.channel_id.clone());

        let created = self.services.tasks.create(task).await?;
        info!(
            event_name = "slack.task.created",
            correlation_id = %ctx.correlation_id,
            task_id = created.id.0,
            "task created from command"
        );

        let headline = match language {
            Language::Es => format!("✅ Tarea {} creada: *{}*", created.id, created.title),
            Language::En => format!("✅ Task {} created: *{}*", created.id, created.title),
        };
        Ok(MessageBuilder::new(headline.clone())
            .section("dona.task.created.v1", |section| {
                section.mrkdwn(headline);
            })
            .context("dona.task.created.details.v1", |context| {
                context.mrkdwn(details(&created, language));
            })
            .build())
    }

    async fn list(&self, user: &User, filter_text: &str) -> Result<MessageTemplate, ApplicationError> {
        let language = user.preferences.language;
        let status = match filter_text.trim() {
            "" => None,
            word => Some(parse_status(word).ok_or_else(|| {
                ApplicationError::validation(format!(
                    "`{word}` is not a task status (pending, in_progress, completed, cancelled)"
                ))
            })?),
        };

        let filter = TaskFilter { status, ..TaskFilter::default() };
        let tasks: Vec<Task> = self
            .services
            .tasks
            .list_for_user(user.id, &filter)
            .await?
            .into_iter()
            .filter(|task| status.is_some() || !task.status.is_terminal())
            .take(LIST_LIMIT)
            .collect();

        if tasks.is_empty() {
            return Ok(notice(
                "dona.task.list.empty.v1",
                tr(language, "📭 No tienes tareas aquí.", "📭 You have no tasks here."),
            ));
        }

        let heading = tr(language, "*Tus tareas*", "*Your tasks*");
        let lines: Vec<String> = tasks.iter().map(|task| task_line(task, language)).collect();
        let body = lines.join("\n");
        Ok(MessageBuilder::new(format!("{heading}\n{body}"))
            .section("dona.task.list.heading.v1", |section| {
                section.mrkdwn(heading);
            })
            .section("dona.task.list.items.v1", |section| {
                section.mrkdwn(body);
            })
            .build())
    }

    async fn change(
        &self,
        user: &User,
        action: TaskAction,
        reference: &str,
    ) -> Result<MessageTemplate, ApplicationError> {
        let language = user.preferences.language;
        let id = parse_task_ref(reference).ok_or_else(|| {
            ApplicationError::validation(format!(
                "`{}` is not a task reference (use e.g. #12)",
                reference.trim()
            ))
        })?;

        let tasks = &self.services.tasks;
        let update = match action {
            TaskAction::Start => tasks.start(id, user.id).await?,
            TaskAction::Complete => tasks.complete(id, user.id).await?,
            TaskAction::Cancel => tasks.cancel(id, user.id).await?,
            TaskAction::Create | TaskAction::List => {
                return Err(ApplicationError::Internal(format!("{action:?} is not a transition")))
            }
        };

        let task = update.task();
        let text = match (&update, language) {
            (TaskUpdate::AlreadyInState(_), Language::Es) => {
                format!("ℹ️ La tarea {} ya estaba {}.", task.id, status_label(task.status, language))
            }
            (TaskUpdate::AlreadyInState(_), Language::En) => {
                format!("ℹ️ Task {} was already {}.", task.id, status_label(task.status, language))
            }
            (TaskUpdate::Applied(_), Language::Es) => format!(
                "{} Tarea {} *{}* ahora está {}.",
                status_icon(task.status),
                task.id,
                task.title,
                status_label(task.status, language)
            ),
            (TaskUpdate::Applied(_), Language::En) => format!(
                "{} Task {} *{}* is now {}.",
                status_icon(task.status),
                task.id,
                task.title,
                status_label(task.status, language)
            ),
        };
        Ok(notice("dona.task.updated.v1", text))
    }
}

#[async_trait]
impl CommandHandler for TaskHandler {
    async fn handle(
        &self,
        args: &str,
        ctx: &RoutingContext,
    ) -> Result<MessageTemplate, ApplicationError> {
        let user = self.services.resolve_user(ctx).await?;
        let language = user.preferences.language;

        let (action, rest) = split_action(args, TASK_ACTIONS);
        let action = match action {
            Some(action) => action,
            None if rest.is_empty() => TaskAction::List,
            None => TaskAction::Create,
        };

        let result = match action {
            TaskAction::Create => self.create(&user, &rest, ctx).await,
            TaskAction::List => self.list(&user, &rest).await,
            TaskAction::Start | TaskAction::Complete | TaskAction::Cancel => {
                self.change(&user, action, &rest).await
            }
        };
        or_explain(result, language, "dona.task.rejected.v1")
    }
}

pub(crate) fn status_icon(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Pending => "⏳",
        TaskStatus::InProgress => "🔄",
        TaskStatus::Completed => "✅",
        TaskStatus::Cancelled => "❌",
    }
}

pub(crate) fn status_label(status: TaskStatus, language: Language) -> &'static str {
    match (status, language) {
        (TaskStatus::Pending, Language::Es) => "pendiente",
        (TaskStatus::InProgress, Language::Es) => "en progreso",
        (TaskStatus::Completed, Language::Es) => "completada",
        (TaskStatus::Cancelled, Language::Es) => "cancelada",
        (TaskStatus::Pending, Language::En) => "pending",
        (TaskStatus::InProgress, Language::En) => "in progress",
        (TaskStatus::Completed, Language::En) => "completed",
        (TaskStatus::Cancelled, Language::En) => "cancelled",
    }
}

fn priority_label(priority: TaskPriority, language: Language) -> &'static str {
    match (priority, language) {
        (TaskPriority::Low, Language::Es) => "baja",
        (TaskPriority::Medium, Language::Es) => "media",
        (TaskPriority::High, Language::Es) => "alta",
        (TaskPriority::Urgent, Language::Es) => "urgente",
        (priority, Language::En) => priority.as_str(),
    }
}

pub(crate) fn task_line(task: &Task, language: Language) -> String {
    let mut line = format!("{} {} {}", status_icon(task.status), task.id, task.title);
    if task.priority >= TaskPriority::High {
        line.push_str(&format!(" _({})_", priority_label(task.priority, language)));
    }
    if let Some(due) = task.due_date {
        line.push_str(&format!(" · 📅 {due}"));
    }
    line
}

fn details(task: &Task, language: Language) -> String {
    let mut parts = vec![match language {
        Language::Es => format!("Prioridad: {}", priority_label(task.priority, language)),
        Language::En => format!("Priority: {}", priority_label(task.priority, language)),
    }];
    if let Some(due) = task.due_date {
        parts.push(match language {
            Language::Es => format!("Vence: {due}"),
            Language::En => format!("Due: {due}"),
        });
    }
    if !task.dependencies.is_empty() {
        let ids: Vec<String> = task.dependencies.iter().map(ToString::to_string).collect();
        parts.push(match language {
            Language::Es => format!("Después de: {}", ids.join(", ")),
            Language::En => format!("After: {}", ids.join(", ")),
        });
    }
    parts.join(" · ")
}
