use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::info;

use dona_core::domain::task::{TaskFilter, TaskStatus};
use dona_core::domain::time_entry::format_duration;
use dona_core::domain::user::{Language, User};
use dona_core::errors::ApplicationError;
use dona_core::rate_limit::RateLimitUsage;

use super::status::period_start;
use super::{
    or_explain, tr, Services, CONFIG_COMMAND, HELP_COMMAND, LIMITS_COMMAND, METRICS_COMMAND,
    REMIND_COMMAND, STATUS_COMMAND, SUMMARY_COMMAND, TASK_COMMAND, TIME_COMMAND,
};
use crate::blocks::{notice, MessageBuilder, MessageTemplate};
use crate::commands::{
    split_action, CommandHandler, MetricsScope, RoutingContext, SummaryPeriod,
    CONVERSATION_COMMAND, METRICS_SCOPES,
};
use crate::metrics::CommandMetrics;

pub struct MetricsHandler {
    services: Arc<Services>,
}

impl MetricsHandler {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }

    async fn personal(&self, user: &User) -> Result<MessageTemplate, ApplicationError> {
        let language = user.preferences.language;
        let now = self.services.clock.now();
        let tasks = self.services.tasks.list_for_user(user.id, &TaskFilter::default()).await?;
        let count = |status: TaskStatus| tasks.iter().filter(|task| task.status == status).count();
        let tracked: i64 = self
            .services
            .time_entries
            .entries_since(user.id, period_start(SummaryPeriod::Week, now))
            .await?
            .iter()
            .map(|entry| entry.elapsed_seconds(now))
            .sum();

        let text = match language {
            Language::Es => format!(
                "📈 *Tus métricas*\n• Tareas: {} pendientes, {} en progreso, {} completadas, {} canceladas\n• Tiempo registrado (7 días): {}",
                count(TaskStatus::Pending),
                count(TaskStatus::InProgress),
                count(TaskStatus::Completed),
                count(TaskStatus::Cancelled),
                format_duration(tracked)
            ),
            Language::En => format!(
                "📈 *Your metrics*\n• Tasks: {} pending, {} in progress, {} completed, {} cancelled\n• Time tracked (7 days): {}",
                count(TaskStatus::Pending),
                count(TaskStatus::InProgress),
                count(TaskStatus::Completed),
                count(TaskStatus::Cancelled),
                format_duration(tracked)
            ),
        };
        Ok(notice("dona.metrics.personal.v1", text))
    }

    fn system(&self, language: Language) -> MessageTemplate {
        let rows = self.services.metrics.snapshot();
        let totals = self.services.metrics.totals();
        let minutes = self.services.metrics.window().as_secs().div_ceil(60);
        let heading = match language {
            Language::Es => format!("📈 *Métricas del sistema* (últimos {minutes} min)"),
            Language::En => format!("📈 *System metrics* (last {minutes} min)"),
        };

        let mut lines = vec![metric_line(&totals, language)];
        lines.extend(rows.iter().map(|row| metric_line(row, language)));

        let audit = match self.services.audit.health() {
            Some(health) => match language {
                Language::Es => format!(
                    "Auditoría: {} escritas, {} fallidas, {} descartadas{}",
                    health.written,
                    health.failed,
                    health.dropped,
                    if health.degraded { " ⚠️ degradada" } else { "" }
                ),
                Language::En => format!(
                    "Audit: {} written, {} failed, {} dropped{}",
                    health.written,
                    health.failed,
                    health.dropped,
                    if health.degraded { " ⚠️ degraded" } else { "" }
                ),
            },
            None => tr(language, "Auditoría: sin datos", "Audit: no data"),
        };
        let buckets = match language {
            Language::Es => format!("Cubetas de límite activas: {}", self.services.limiter.bucket_count()),
            Language::En => format!("Active rate-limit buckets: {}", self.services.limiter.bucket_count()),
        };

        let body = lines.join("\n");
        MessageBuilder::new(format!("{heading}\n{body}"))
            .section("dona.metrics.heading.v1", |section| {
                section.mrkdwn(heading);
            })
            .section("dona.metrics.commands.v1", |section| {
                section.mrkdwn(body);
            })
            .context("dona.metrics.health.v1", |context| {
                context.plain(audit).plain(buckets);
            })
            .build()
    }
}

#[async_trait]
impl CommandHandler for MetricsHandler {
    async fn handle(
        &self,
        args: &str,
        ctx: &RoutingContext,
    ) -> Result<MessageTemplate, ApplicationError> {
        let user = self.services.resolve_user(ctx).await?;
        let language = user.preferences.language;

        if !self.services.access.metrics_allowed(&ctx.identity.platform_user_id) {
            info!(
                event_name = "slack.metrics.access_denied",
                correlation_id = %ctx.correlation_id,
                "metrics requested by a non-admin user"
            );
            return Ok(notice(
                "dona.metrics.forbidden.v1",
                tr(
                    language,
                    "🔒 Las métricas solo están disponibles para administradores.",
                    "🔒 Metrics are only available to administrators.",
                ),
            ));
        }

        let (scope, rest) = split_action(args, METRICS_SCOPES);
        let result = match scope {
            Some(MetricsScope::Personal) => self.personal(&user).await,
            None if rest.is_empty() => Ok(self.system(language)),
            None => Err(ApplicationError::validation(format!(
                "unknown metrics scope `{rest}` (use me)"
            ))),
        };
        or_explain(result, language, "dona.metrics.rejected.v1")
    }
}

fn metric_line(row: &CommandMetrics, language: Language) -> String {
    let command = if row.command == "all" {
        "*total*".to_owned()
    } else {
        format!("`{}`", row.command)
    };
    match language {
        Language::Es => format!(
            "{command}: {} solicitudes, {} errores ({:.1}%), {} rechazadas, {} lentas, {} ms prom., {} ms p95, {} ms máx.",
            row.requests,
            row.errors,
            row.error_rate(),
            row.denied,
            row.slow,
            row.mean_duration_ms,
            row.p95_duration_ms,
            row.max_duration_ms
        ),
        Language::En => format!(
            "{command}: {} requests, {} errors ({:.1}%), {} denied, {} slow, {} ms avg, {} ms p95, {} ms max",
            row.requests,
            row.errors,
            row.error_rate(),
            row.denied,
            row.slow,
            row.mean_duration_ms,
            row.p95_duration_ms,
            row.max_duration_ms
        ),
    }
}

const LIMITED_COMMANDS: &[&str] = &[
    CONVERSATION_COMMAND,
    CONFIG_COMMAND,
    HELP_COMMAND,
    LIMITS_COMMAND,
    METRICS_COMMAND,
    REMIND_COMMAND,
    STATUS_COMMAND,
    SUMMARY_COMMAND,
    TASK_COMMAND,
    TIME_COMMAND,
];

pub struct LimitsHandler {
    services: Arc<Services>,
}

impl LimitsHandler {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }
}

#[async_trait]
impl CommandHandler for LimitsHandler {
    async fn handle(
        &self,
        _args: &str,
        ctx: &RoutingContext,
    ) -> Result<MessageTemplate, ApplicationError> {
        let user = self.services.resolve_user(ctx).await?;
        let language = user.preferences.language;
        let limiter = &self.services.limiter;

        if !limiter.policy().enabled {
            return Ok(notice(
                "dona.limits.disabled.v1",
                tr(language, "Los límites de uso están desactivados.", "Usage limits are turned off."),
            ));
        }

        let key = ctx.identity.key();
        let now = Instant::now();
        let lines: Vec<String> = LIMITED_COMMANDS
            .iter()
            .map(|command| usage_line(command, &limiter.usage(&key, command, now), language))
            .collect();

        let heading = tr(language, "🚦 *Tus límites de uso*", "🚦 *Your usage limits*");
        let body = lines.join("\n");
        Ok(MessageBuilder::new(format!("{heading}\n{body}"))
            .section("dona.limits.heading.v1", |section| {
                section.mrkdwn(heading);
            })
            .section("dona.limits.commands.v1", |section| {
                section.mrkdwn(body);
            })
            .build())
    }
}

fn usage_line(command: &str, usage: &RateLimitUsage, language: Language) -> String {
    let window = usage.window.as_secs();
    let mut line = match language {
        Language::Es => {
            format!("`{command}`: {}/{} cada {window} s", usage.used, usage.limit)
        }
        Language::En => format!("`{command}`: {}/{} per {window} s", usage.used, usage.limit),
    };
    if usage.used > 0 {
        let resets = usage.resets_in.as_secs().max(1);
        line.push_str(&match language {
            Language::Es => format!(" · se libera en {resets} s"),
            Language::En => format!(" · frees up in {resets} s"),
        });
    }
    line
}
