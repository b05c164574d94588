use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use dona_core::domain::user::{Language, User, UserPreferences};
use dona_core::errors::ApplicationError;
use dona_core::gateway::GatewayError;

use super::{or_explain, tr, Services};
use crate::blocks::{notice, MessageBuilder, MessageTemplate};
use crate::commands::{
    parse_toggle, split_action, CommandHandler, ConfigSetting, RoutingContext, CONFIG_SETTINGS,
};

pub struct ConfigHandler {
    services: Arc<Services>,
}

impl ConfigHandler {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }

    async fn update(
        &self,
        user: &User,
        setting: ConfigSetting,
        value: &str,
        ctx: &RoutingContext,
    ) -> Result<MessageTemplate, ApplicationError> {
        let value = value.trim();
        let mut preferences = user.preferences.clone();
        match setting {
            ConfigSetting::Language => {
                preferences.language = Language::parse(value).ok_or_else(|| {
                    ApplicationError::validation(format!("`{value}` is not a language (use es or en)"))
                })?;
            }
            ConfigSetting::Timezone => preferences.timezone = value.to_owned(),
            ConfigSetting::Notifications => {
                preferences.notifications_enabled = parse_toggle(value).ok_or_else(|| {
                    ApplicationError::validation(format!("`{value}` is not on or off"))
                })?;
            }
        }
        preferences.validate()?;

        let users = self.services.users.as_ref();
        let id = user.id;
        let now = self.services.clock.now();
        let pending = &preferences;
        let updated = self
            .services
            .retry
            .run("user.update_preferences", GatewayError::is_transient, move || {
                users.update_preferences(id, pending, now)
            })
            .await?;

        info!(
            event_name = "slack.config.updated",
            correlation_id = %ctx.correlation_id,
            user_id = updated.id.0,
            setting = ?setting,
            "user preferences updated"
        );

        // answer in the language the user just picked
        let language = updated.preferences.language;
        Ok(notice(
            "dona.config.updated.v1",
            format!(
                "✅ {}\n{}",
                tr(language, "Preferencias actualizadas.", "Preferences updated."),
                describe(&updated.preferences, language)
            ),
        ))
    }
}

#[async_trait]
impl CommandHandler for ConfigHandler {
    async fn handle(
        &self,
        args: &str,
        ctx: &RoutingContext,
    ) -> Result<MessageTemplate, ApplicationError> {
        let user = self.services.resolve_user(ctx).await?;
        let language = user.preferences.language;

        let (setting, rest) = split_action(args, CONFIG_SETTINGS);
        let result = match setting {
            Some(setting) if !rest.is_empty() => self.update(&user, setting, &rest, ctx).await,
            Some(_) => Err(ApplicationError::validation("a value is required")),
            None if rest.is_empty() => Ok(show(&user.preferences, language)),
            None => Err(ApplicationError::validation(format!(
                "unknown setting `{rest}` (use language, timezone or notifications)"
            ))),
        };
        or_explain(result, language, "dona.config.rejected.v1")
    }
}

fn describe(preferences: &UserPreferences, language: Language) -> String {
    let notifications = match (preferences.notifications_enabled, language) {
        (true, Language::Es) => "activadas",
        (false, Language::Es) => "desactivadas",
        (true, Language::En) => "on",
        (false, Language::En) => "off",
    };
    match language {
        Language::Es => format!(
            "• Idioma: `{}`\n• Zona horaria: `{}`\n• Notificaciones: {notifications}",
            preferences.language.as_str(),
            preferences.timezone
        ),
        Language::En => format!(
            "• Language: `{}`\n• Timezone: `{}`\n• Notifications: {notifications}",
            preferences.language.as_str(),
            preferences.timezone
        ),
    }
}

fn show(preferences: &UserPreferences, language: Language) -> MessageTemplate {
    let heading = tr(language, "⚙️ *Tu configuración*", "⚙️ *Your settings*");
    let body = describe(preferences, language);
    MessageBuilder::new(format!("{heading}\n{body}"))
        .section("dona.config.current.v1", |section| {
            section.mrkdwn(format!("{heading}\n{body}"));
        })
        .context("dona.config.usage.v1", |context| {
            context.mrkdwn(tr(
                language,
                "Cambia algo con `/dona-config idioma en`, `/dona-config zona America/Bogota` o `/dona-config notificaciones off`.",
                "Change a setting with `/dona-config language es`, `/dona-config timezone UTC` or `/dona-config notifications off`.",
            ));
        })
        .build()
}

#[cfg(test)]
mod tests {
    use dona_core::domain::user::{Language, UserPreferences};

    use super::describe;

    #[test]
    fn description_follows_the_reply_language() {
        let preferences = UserPreferences::default();
        assert!(describe(&preferences, Language::Es).contains("Zona horaria: `America/Mexico_City`"));
        assert!(describe(&preferences, Language::En).contains("Notifications: on"));
    }
}
