use std::sync::Arc;

use async_trait::async_trait;

use dona_core::domain::task::TaskId;
use dona_core::domain::time_entry::{format_duration, TimeEntry};
use dona_core::domain::user::{Language, User};
use dona_core::errors::ApplicationError;

use super::{or_explain, tr, Services};
use crate::blocks::{notice, MessageBuilder, MessageTemplate};
use crate::commands::{
    parse_task_ref, split_action, CommandHandler, RoutingContext, TimeAction, TIME_ACTIONS,
};

pub struct TimeHandler {
    services: Arc<Services>,
}

impl TimeHandler {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }

    /// `start [#task] [description]`
    async fn start(&self, user: &User, rest: &str) -> Result<MessageTemplate, ApplicationError> {
        let language = user.preferences.language;
        let (task_id, description) = split_task_ref(rest);

        if let Some(id) = task_id {
            let task = self.services.tasks.get(id).await?;
            if !task.involves(user.id) {
                return Err(ApplicationError::validation(format!("task {id} does not belong to you")));
            }
        }

        let outcome = self.services.time_entries.start(user.id, task_id, description).await?;
        let now = self.services.time_entries.now();
        let started = &outcome.started;

        let mut headline = tr(language, "⏱️ Cronómetro iniciado", "⏱️ Timer started");
        if let Some(label) = entry_label(started) {
            headline.push_str(&format!(": {label}"));
        }

        let mut builder = MessageBuilder::new(headline.clone()).section("dona.time.started.v1", |s| {
            s.mrkdwn(headline);
        });
        if !outcome.stopped.is_empty() {
            let tracked: i64 = outcome.stopped.iter().map(|entry| entry.elapsed_seconds(now)).sum();
            let note = match language {
                Language::Es => {
                    format!("Detuve el cronómetro anterior ({}).", format_duration(tracked))
                }
                Language::En => format!("Stopped your previous timer ({}).", format_duration(tracked)),
            };
            builder = builder.context("dona.time.auto_stopped.v1", |context| {
                context.plain(note);
            });
        }
        Ok(builder.build())
    }

    async fn stop(&self, user: &User) -> Result<MessageTemplate, ApplicationError> {
        let language = user.preferences.language;
        let stopped = self.services.time_entries.stop_active(user.id).await?;
        if stopped.is_empty() {
            return Ok(notice(
                "dona.time.idle.v1",
                tr(language, "No tienes un cronómetro activo.", "You have no active timer."),
            ));
        }

        let now = self.services.time_entries.now();
        let tracked: i64 = stopped.iter().map(|entry| entry.elapsed_seconds(now)).sum();
        let text = match language {
            Language::Es => format!("⏹️ Cronómetro detenido. Registraste {}.", format_duration(tracked)),
            Language::En => format!("⏹️ Timer stopped. You tracked {}.", format_duration(tracked)),
        };
        Ok(notice("dona.time.stopped.v1", text))
    }

    async fn status(&self, user: &User) -> Result<MessageTemplate, ApplicationError> {
        let language = user.preferences.language;
        let Some(active) = self.services.time_entries.active(user.id).await? else {
            return Ok(notice(
                "dona.time.idle.v1",
                tr(language, "No tienes un cronómetro activo.", "You have no active timer."),
            ));
        };

        let elapsed = format_duration(active.elapsed_seconds(self.services.time_entries.now()));
        let label = entry_label(&active).unwrap_or_default();
        let text = match language {
            Language::Es => format!("⏱️ Cronómetro activo desde hace {elapsed}. {label}"),
            Language::En => format!("⏱️ Timer running for {elapsed}. {label}"),
        };
        Ok(notice("dona.time.status.v1", text.trim_end().to_owned()))
    }
}

#[async_trait]
impl CommandHandler for TimeHandler {
    async fn handle(
        &self,
        args: &str,
        ctx: &RoutingContext,
    ) -> Result<MessageTemplate, ApplicationError> {
        let user = self.services.resolve_user(ctx).await?;
        let language = user.preferences.language;

        let (action, rest) = split_action(args, TIME_ACTIONS);
        let result = match action {
            Some(TimeAction::Start) => self.start(&user, &rest).await,
            Some(TimeAction::Stop) => self.stop(&user).await,
            Some(TimeAction::Status) => self.status(&user).await,
            None if rest.is_empty() => self.status(&user).await,
            None => Err(ApplicationError::validation(format!(
                "unknown time action `{rest}` (use start, stop or status)"
            ))),
        };
        or_explain(result, language, "dona.time.rejected.v1")
    }
}

fn split_task_ref(rest: &str) -> (Option<TaskId>, Option<String>) {
    let rest = rest.trim();
    let (head, tail) = match rest.split_once(char::is_whitespace) {
        Some((head, tail)) => (head, tail.trim()),
        None => (rest, ""),
    };

    let (task_id, description) = match head.starts_with('#').then(|| parse_task_ref(head)).flatten()
    {
        Some(id) => (Some(id), tail),
        None => (None, rest),
    };
    let description = Some(description.to_owned()).filter(|text| !text.is_empty());
    (task_id, description)
}

fn entry_label(entry: &TimeEntry) -> Option<String> {
    match (entry.task_id, entry.description.as_deref()) {
        (Some(id), Some(description)) => Some(format!("{id} {description}")),
        (Some(id), None) => Some(id.to_string()),
        (None, Some(description)) => Some(description.to_owned()),
        (None, None) => None,
    }
}

#[cfg(test)]
mod tests {
    use dona_core::domain::task::TaskId;

    use super::split_task_ref;

    #[test]
    fn leading_hash_reference_becomes_the_task() {
        assert_eq!(
            split_task_ref("#3 revisar contrato"),
            (Some(TaskId(3)), Some("revisar contrato".to_owned()))
        );
        assert_eq!(split_task_ref("#3"), (Some(TaskId(3)), None));
    }

    #[test]
    fn bare_numbers_stay_in_the_description() {
        assert_eq!(split_task_ref("3 llamadas"), (None, Some("3 llamadas".to_owned())));
        assert_eq!(split_task_ref(""), (None, None));
    }
}
