use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Days, TimeZone, Utc};

use dona_core::domain::task::{TaskFilter, TaskStatus};
use dona_core::domain::time_entry::format_duration;
use dona_core::domain::user::Language;
use dona_core::errors::ApplicationError;

use super::task::task_line;
use super::{or_explain, tr, Services};
use crate::blocks::{MessageBuilder, MessageTemplate};
use crate::commands::{split_action, CommandHandler, RoutingContext, SummaryPeriod, SUMMARY_PERIODS};

const STATUS_TASK_LIMIT: usize = 5;

/// Start of the period in UTC. `Week` covers today and the six days before.
pub(crate) fn period_start(period: SummaryPeriod, now: DateTime<Utc>) -> DateTime<Utc> {
    let today = now.date_naive();
    let first_day = match period {
        SummaryPeriod::Today => today,
        SummaryPeriod::Week => today.checked_sub_days(Days::new(6)).unwrap_or(today),
    };
    Utc.from_utc_datetime(&first_day.and_time(chrono::NaiveTime::MIN))
}

pub struct StatusHandler {
    services: Arc<Services>,
}

impl StatusHandler {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }
}

#[async_trait]
impl CommandHandler for StatusHandler {
    async fn handle(
        &self,
        _args: &str,
        ctx: &RoutingContext,
    ) -> Result<MessageTemplate, ApplicationError> {
        let user = self.services.resolve_user(ctx).await?;
        let language = user.preferences.language;
        let now = self.services.clock.now();

        let open: Vec<_> = self
            .services
            .tasks
            .list_for_user(user.id, &TaskFilter::default())
            .await?
            .into_iter()
            .filter(|task| !task.status.is_terminal())
            .collect();
        let active = self.services.time_entries.active(user.id).await?;
        let tracked_today: i64 = self
            .services
            .time_entries
            .entries_since(user.id, period_start(SummaryPeriod::Today, now))
            .await?
            .iter()
            .map(|entry| entry.elapsed_seconds(now))
            .sum();

        let in_progress = open.iter().filter(|task| task.status == TaskStatus::InProgress).count();
        let heading = match language {
            Language::Es => format!(
                "📋 *Tu estado*: {} tareas abiertas ({} en progreso)",
                open.len(),
                in_progress
            ),
            Language::En => {
                format!("📋 *Your status*: {} open tasks ({} in progress)", open.len(), in_progress)
            }
        };
        let timer = match (&active, language) {
            (Some(entry), Language::Es) => format!(
                "⏱️ Cronómetro activo: {}",
                format_duration(entry.elapsed_seconds(now))
            ),
            (Some(entry), Language::En) => {
                format!("⏱️ Timer running: {}", format_duration(entry.elapsed_seconds(now)))
            }
            (None, _) => tr(language, "⏱️ Sin cronómetro activo", "⏱️ No timer running"),
        };
        let today = match language {
            Language::Es => format!("Tiempo registrado hoy: {}", format_duration(tracked_today)),
            Language::En => format!("Time tracked today: {}", format_duration(tracked_today)),
        };

        let mut builder = MessageBuilder::new(heading.clone())
            .section("dona.status.heading.v1", |section| {
                section.mrkdwn(heading);
            });
        if !open.is_empty() {
            let lines: Vec<String> = open
                .iter()
                .take(STATUS_TASK_LIMIT)
                .map(|task| task_line(task, language))
                .collect();
            builder = builder.section("dona.status.tasks.v1", |section| {
                section.mrkdwn(lines.join("\n"));
            });
        }
        Ok(builder
            .divider("dona.status.divider.v1")
            .context("dona.status.time.v1", |context| {
                context.mrkdwn(timer).plain(today);
            })
            .build())
    }
}

pub struct SummaryHandler {
    services: Arc<Services>,
}

impl SummaryHandler {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }

    async fn summarize(
        &self,
        period: SummaryPeriod,
        ctx: &RoutingContext,
    ) -> Result<MessageTemplate, ApplicationError> {
        let user = self.services.resolve_user(ctx).await?;
        let language = user.preferences.language;
        let now = self.services.clock.now();
        let since = period_start(period, now);

        let filter = TaskFilter {
            status: Some(TaskStatus::Completed),
            completed_since: Some(since),
            limit: None,
        };
        let completed = self.services.tasks.list_for_user(user.id, &filter).await?;
        let entries = self.services.time_entries.entries_since(user.id, since).await?;
        let tracked: i64 = entries.iter().map(|entry| entry.elapsed_seconds(now)).sum();

        let heading = match (period, language) {
            (SummaryPeriod::Today, Language::Es) => "📊 *Resumen de hoy*",
            (SummaryPeriod::Week, Language::Es) => "📊 *Resumen de los últimos 7 días*",
            (SummaryPeriod::Today, Language::En) => "📊 *Today's summary*",
            (SummaryPeriod::Week, Language::En) => "📊 *Summary for the last 7 days*",
        };
        let totals = match language {
            Language::Es => format!(
                "✅ {} tareas completadas · ⏱️ {} registrados en {} entradas",
                completed.len(),
                format_duration(tracked),
                entries.len()
            ),
            Language::En => format!(
                "✅ {} tasks completed · ⏱️ {} tracked across {} entries",
                completed.len(),
                format_duration(tracked),
                entries.len()
            ),
        };

        let mut builder = MessageBuilder::new(format!("{heading}\n{totals}"))
            .section("dona.summary.heading.v1", |section| {
                section.mrkdwn(format!("{heading}\n{totals}"));
            });
        if !completed.is_empty() {
            let lines: Vec<String> =
                completed.iter().map(|task| task_line(task, language)).collect();
            builder = builder.section("dona.summary.completed.v1", |section| {
                section.mrkdwn(lines.join("\n"));
            });
        }
        Ok(builder.build())
    }
}

#[async_trait]
impl CommandHandler for SummaryHandler {
    async fn handle(
        &self,
        args: &str,
        ctx: &RoutingContext,
    ) -> Result<MessageTemplate, ApplicationError> {
        let (period, rest) = split_action(args, SUMMARY_PERIODS);
        if period.is_none() && !rest.is_empty() {
            let user = self.services.resolve_user(ctx).await?;
            return or_explain(
                Err(ApplicationError::validation(format!(
                    "unknown period `{rest}` (use today or week)"
                ))),
                user.preferences.language,
                "dona.summary.rejected.v1",
            );
        }
        self.summarize(period.unwrap_or_default(), ctx).await
    }
}
