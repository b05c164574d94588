//! Command handlers. Each handler resolves the user, calls into the lifecycle
//! managers or the agent runtime and renders the reply in the user's language.

mod config;
mod conversation;
mod help;
mod metrics;
mod remind;
mod status;
mod task;
mod time;

use std::sync::Arc;

use dona_agent::AgentRuntime;
use dona_core::audit::AuditSink;
use dona_core::clock::Clock;
use dona_core::config::AccessConfig;
use dona_core::domain::user::{Language, User};
use dona_core::errors::{ApplicationError, DomainError};
use dona_core::gateway::{ConversationGateway, GatewayError, UserGateway};
use dona_core::lifecycle::{TaskLifecycleManager, TimeEntryLifecycleManager};
use dona_core::rate_limit::RateLimiter;
use dona_core::retry::RetryPolicy;

use crate::blocks::{notice, MessageTemplate};
use crate::commands::{CommandRouter, RoutingContext, CONVERSATION_COMMAND};
use crate::metrics::RequestMetrics;

pub use config::ConfigHandler;
pub use conversation::ConversationHandler;
pub use help::HelpHandler;
pub use metrics::{LimitsHandler, MetricsHandler};
pub use remind::RemindHandler;
pub use status::{StatusHandler, SummaryHandler};
pub use task::TaskHandler;
pub use time::TimeHandler;

pub const TASK_COMMAND: &str = "/dona-task";
pub const TIME_COMMAND: &str = "/dona-time";
pub const REMIND_COMMAND: &str = "/dona-remind";
pub const SUMMARY_COMMAND: &str = "/dona-summary";
pub const STATUS_COMMAND: &str = "/dona-status";
pub const CONFIG_COMMAND: &str = "/dona-config";
pub const HELP_COMMAND: &str = "/dona-help";
pub const METRICS_COMMAND: &str = "/dona-metrics";
pub const LIMITS_COMMAND: &str = "/dona-limits";

/// Everything the handlers reach into, built once at startup.
pub struct Services {
    pub users: Arc<dyn UserGateway>,
    pub conversations: Arc<dyn ConversationGateway>,
    pub tasks: Arc<TaskLifecycleManager>,
    pub time_entries: Arc<TimeEntryLifecycleManager>,
    pub agent: Arc<AgentRuntime>,
    pub limiter: Arc<RateLimiter>,
    pub metrics: Arc<RequestMetrics>,
    pub audit: Arc<dyn AuditSink>,
    pub access: AccessConfig,
    pub clock: Arc<dyn Clock>,
    pub retry: RetryPolicy,
}

impl Services {
    /// Maps the platform identity to the internal user, creating it on first
    /// contact.
    pub async fn resolve_user(&self, ctx: &RoutingContext) -> Result<User, ApplicationError> {
        let users = self.users.as_ref();
        let identity = &ctx.identity;
        let now = self.clock.now();
        Ok(self
            .retry
            .run("user.get_or_create", GatewayError::is_transient, move || {
                users.get_or_create(identity, now)
            })
            .await?)
    }
}

pub fn build_router(services: Arc<Services>) -> CommandRouter {
    CommandRouter::new()
        .with(CONVERSATION_COMMAND, Arc::new(ConversationHandler::new(services.clone())))
        .with(TASK_COMMAND, Arc::new(TaskHandler::new(services.clone())))
        .with(TIME_COMMAND, Arc::new(TimeHandler::new(services.clone())))
        .with(REMIND_COMMAND, Arc::new(RemindHandler::new(services.clone())))
        .with(SUMMARY_COMMAND, Arc::new(SummaryHandler::new(services.clone())))
        .with(STATUS_COMMAND, Arc::new(StatusHandler::new(services.clone())))
        .with(CONFIG_COMMAND, Arc::new(ConfigHandler::new(services.clone())))
        .with(HELP_COMMAND, Arc::new(HelpHandler::new(services.clone())))
        .with(METRICS_COMMAND, Arc::new(MetricsHandler::new(services.clone())))
        .with(LIMITS_COMMAND, Arc::new(LimitsHandler::new(services)))
}

pub(crate) fn tr(language: Language, es: &str, en: &str) -> String {
    match language {
        Language::Es => es.to_owned(),
        Language::En => en.to_owned(),
    }
}

/// User-facing explanation for errors the user can fix. Anything else is left
/// to the generic failure reply.
pub(crate) fn explain(error: &ApplicationError, language: Language) -> Option<String> {
    let text = match error {
        ApplicationError::Domain(DomainError::Validation(reason)) => match language {
            Language::Es => format!("⚠️ No pude hacerlo: {reason}"),
            Language::En => format!("⚠️ I couldn't do that: {reason}"),
        },
        ApplicationError::Domain(DomainError::InvalidTransition { from, to }) => match language {
            Language::Es => format!("⚠️ Una tarea en estado `{from}` no puede pasar a `{to}`."),
            Language::En => format!("⚠️ A task in `{from}` cannot move to `{to}`."),
        },
        ApplicationError::NotFound { entity, id } => match language {
            Language::Es => format!("🔍 No encontré {entity} `{id}`."),
            Language::En => format!("🔍 I couldn't find {entity} `{id}`."),
        },
        ApplicationError::Conflict { entity, id } => match language {
            Language::Es => {
                format!("🔁 {entity} `{id}` cambió mientras lo actualizaba. Intenta de nuevo.")
            }
            Language::En => format!("🔁 {entity} `{id}` changed while I was updating it. Try again."),
        },
        _ => return None,
    };
    Some(text)
}

/// Turns user-fixable failures into a normal reply; everything else stays an
/// error for the middleware to report.
pub(crate) fn or_explain(
    result: Result<MessageTemplate, ApplicationError>,
    language: Language,
    block_id: &str,
) -> Result<MessageTemplate, ApplicationError> {
    match result {
        Err(error) => match explain(&error, language) {
            Some(text) => Ok(notice(block_id, text)),
            None => Err(error),
        },
        answered => answered,
    }
}

#[cfg(test)]
mod tests {
    use dona_core::domain::task::TaskStatus;
    use dona_core::domain::user::Language;
    use dona_core::errors::{ApplicationError, DomainError};

    use super::explain;

    #[test]
    fn user_fixable_errors_get_an_explanation() {
        let invalid = ApplicationError::Domain(DomainError::InvalidTransition {
            from: TaskStatus::Completed,
            to: TaskStatus::InProgress,
        });
        let text = explain(&invalid, Language::En).expect("explained");
        assert!(text.contains("completed"));

        let missing = ApplicationError::NotFound { entity: "task", id: "7".to_owned() };
        assert!(explain(&missing, Language::Es).expect("explained").contains("`7`"));
    }

    #[test]
    fn infrastructure_errors_are_left_to_the_generic_reply() {
        let transient = ApplicationError::TransientDependency("db down".to_owned());
        assert_eq!(explain(&transient, Language::Es), None);
    }
}
