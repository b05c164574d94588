use std::sync::Arc;

use async_trait::async_trait;

use dona_core::context::is_private_only;
use dona_core::domain::conversation::ContextType;
use dona_core::domain::user::Language;
use dona_core::errors::ApplicationError;

use super::{
    tr, Services, CONFIG_COMMAND, HELP_COMMAND, LIMITS_COMMAND, METRICS_COMMAND, REMIND_COMMAND,
    STATUS_COMMAND, SUMMARY_COMMAND, TASK_COMMAND, TIME_COMMAND,
};
use crate::blocks::{MessageBuilder, MessageTemplate};
use crate::commands::{CommandHandler, RoutingContext, CONVERSATION_COMMAND};

/// (command, Spanish usage, English usage)
const COMMAND_HELP: &[(&str, &str, &str)] = &[
    (CONVERSATION_COMMAND, "<mensaje> · conversa conmigo", "<message> · talk to me"),
    (
        TASK_COMMAND,
        "crear <título> [!prioridad] [due:AAAA-MM-DD] · listar · iniciar/completar/cancelar #id",
        "create <title> [!priority] [due:YYYY-MM-DD] · list · start/complete/cancel #id",
    ),
    (
        TIME_COMMAND,
        "iniciar [#tarea] [descripción] · parar · estado",
        "start [#task] [description] · stop · status",
    ),
    (REMIND_COMMAND, "<cuándo> <mensaje>", "<when> <message>"),
    (SUMMARY_COMMAND, "hoy · semana", "today · week"),
    (STATUS_COMMAND, "tareas abiertas y cronómetro", "open tasks and timer"),
    (LIMITS_COMMAND, "tus límites de uso", "your usage limits"),
    (
        CONFIG_COMMAND,
        "idioma es|en · zona <tz> · notificaciones on|off",
        "language es|en · timezone <tz> · notifications on|off",
    ),
    (METRICS_COMMAND, "métricas del sistema · yo", "system metrics · me"),
    (HELP_COMMAND, "esta ayuda", "this help"),
];

pub struct HelpHandler {
    services: Arc<Services>,
}

impl HelpHandler {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }
}

#[async_trait]
impl CommandHandler for HelpHandler {
    async fn handle(
        &self,
        _args: &str,
        ctx: &RoutingContext,
    ) -> Result<MessageTemplate, ApplicationError> {
        let user = self.services.resolve_user(ctx).await?;
        Ok(help_message(user.preferences.language, ctx.context))
    }
}

pub(crate) fn help_message(language: Language, context: ContextType) -> MessageTemplate {
    let lines: Vec<String> = COMMAND_HELP
        .iter()
        .filter(|(command, _, _)| context.is_private() || !is_private_only(command))
        .map(|(command, es, en)| match language {
            Language::Es => format!("• `{command}` {es}"),
            Language::En => format!("• `{command}` {en}"),
        })
        .collect();

    let heading = tr(language, "👋 *Esto es lo que puedo hacer*", "👋 *Here is what I can do*");
    let footer = match context {
        ContextType::Private => tr(
            language,
            "🔒 Estás en un mensaje directo: la configuración y las métricas están disponibles aquí.",
            "🔒 This is a direct message: settings and metrics are available here.",
        ),
        ContextType::Public => tr(
            language,
            "Escríbeme por mensaje directo para la configuración y las métricas.",
            "Send me a direct message for settings and metrics.",
        ),
    };

    let body = lines.join("\n");
    MessageBuilder::new(format!("{heading}\n{body}"))
        .section("dona.help.heading.v1", |section| {
            section.mrkdwn(heading);
        })
        .section("dona.help.commands.v1", |section| {
            section.mrkdwn(body);
        })
        .context("dona.help.context.v1", |context| {
            context.plain(footer);
        })
        .build()
}

#[cfg(test)]
mod tests {
    use dona_core::domain::conversation::ContextType;
    use dona_core::domain::user::Language;

    use super::help_message;

    #[test]
    fn shared_channel_help_hides_private_only_commands() {
        let public = help_message(Language::En, ContextType::Public);
        assert!(!public.fallback_text.contains("/dona-config"));
        assert!(!public.fallback_text.contains("/dona-metrics"));
        assert!(public.fallback_text.contains("/dona-task"));

        let private = help_message(Language::Es, ContextType::Private);
        assert!(private.fallback_text.contains("/dona-config"));
        assert!(private.fallback_text.contains("/dona-metrics"));
    }
}
