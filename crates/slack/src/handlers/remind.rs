use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use dona_core::domain::user::Language;
use dona_core::errors::ApplicationError;

use super::{tr, Services};
use crate::blocks::{notice, MessageTemplate};
use crate::commands::{CommandHandler, RoutingContext};

/// Accepts `/dona-remind <when> <message>`. Scheduling is not wired up, so a
/// well-formed request is acknowledged without being stored.
pub struct RemindHandler {
    services: Arc<Services>,
}

impl RemindHandler {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }
}

#[async_trait]
impl CommandHandler for RemindHandler {
    async fn handle(
        &self,
        args: &str,
        ctx: &RoutingContext,
    ) -> Result<MessageTemplate, ApplicationError> {
        let user = self.services.resolve_user(ctx).await?;
        let language = user.preferences.language;

        let Some((when, message)) = parse_reminder(args) else {
            return Ok(notice("dona.remind.usage.v1", usage(language)));
        };

        info!(
            event_name = "slack.remind.unscheduled",
            correlation_id = %ctx.correlation_id,
            when,
            "reminder requested before scheduling is available"
        );

        let text = match language {
            Language::Es => format!(
                "⏰ Entendí «{message}» para _{when}_, pero todavía no programo recordatorios. Usa `/dona-task crear` para no perderlo de vista."
            ),
            Language::En => format!(
                "⏰ I understood \"{message}\" for _{when}_, but reminders are not scheduled yet. Use `/dona-task create` to keep track of it."
            ),
        };
        Ok(notice("dona.remind.unscheduled.v1", text))
    }
}

/// Splits `<when> <message>`; both parts are required.
fn parse_reminder(args: &str) -> Option<(&str, &str)> {
    let (when, message) = args.trim().split_once(char::is_whitespace)?;
    let message = message.trim();
    if message.is_empty() {
        return None;
    }
    Some((when, message))
}

fn usage(language: Language) -> String {
    tr(
        language,
        "Indica cuándo y qué recordar. Ejemplo: `/dona-remind mañana Revisar reportes`",
        "Tell me when and what to remember. Example: `/dona-remind tomorrow Review reports`",
    )
}
