//! The request pipeline: correlation, context classification, rate limiting,
//! auditing, then dispatch to the router.
//!
//! Every stage before dispatch is in-memory and cheap, so the platform
//! acknowledgement goes out as soon as they have run, and always before any
//! handler touches storage or the language model. A stage either lets the
//! request continue or answers it and stops the chain; faults inside a stage or
//! a handler become a generic failure reply and never skip the ack.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use dona_core::audit::{AuditLogEntry, AuditSink};
use dona_core::config::MiddlewareConfig;
use dona_core::context::{allowed_in, classify};
use dona_core::domain::conversation::ContextType;
use dona_core::errors::{ApplicationError, InterfaceError};
use dona_core::rate_limit::{Admission, LimitTier, RateLimiter};

use crate::blocks::{bilingual_notice, error_message, MessageTemplate};
use crate::commands::{CommandRouter, RoutingContext};
use crate::events::InboundEvent;
use crate::metrics::{RequestMetrics, RequestOutcome};
use crate::socket::TransportError;

/// Per-event handle onto the transport.
#[async_trait]
pub trait EventResponder: Send + Sync {
    async fn acknowledge(&self) -> Result<(), TransportError>;
    async fn respond(&self, message: &MessageTemplate) -> Result<(), TransportError>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChainSettings {
    pub ack_deadline: Duration,
    pub slow_request: Duration,
}

impl Default for ChainSettings {
    fn default() -> Self {
        Self { ack_deadline: Duration::from_millis(2_500), slow_request: Duration::from_secs(3) }
    }
}

impl From<&MiddlewareConfig> for ChainSettings {
    fn from(config: &MiddlewareConfig) -> Self {
        Self {
            ack_deadline: config.ack_deadline(),
            slow_request: config.slow_request(),
        }
    }
}

/// State threaded through the stages.
#[derive(Clone, Debug)]
pub struct RequestState {
    pub event: InboundEvent,
    pub correlation_id: Option<String>,
    pub context: Option<ContextType>,
    pub admitted: bool,
}

impl RequestState {
    fn new(event: InboundEvent) -> Self {
        Self { event, correlation_id: None, context: None, admitted: false }
    }

    fn correlation_id(&self) -> &str {
        self.correlation_id.as_deref().unwrap_or(&self.event.event_id)
    }

    fn routing_context(&self) -> RoutingContext {
        RoutingContext {
            correlation_id: self.correlation_id().to_owned(),
            command: self.event.command.clone(),
            identity: self.event.identity.clone(),
            channel_id: self.event.origin.channel_id.clone(),
            thread_ts: self.event.thread_ts.clone(),
            context: self.context.unwrap_or(ContextType::Public),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ShortCircuit {
    Denied { tier: LimitTier, retry_after: Duration, message: MessageTemplate },
    Restricted { message: MessageTemplate },
}

pub enum StageResult {
    Continue,
    Respond(ShortCircuit),
}

pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;
    fn run(&self, state: &mut RequestState) -> StageResult;
}

struct CorrelationStage;

impl Stage for CorrelationStage {
    fn name(&self) -> &'static str {
        "correlation"
    }

    fn run(&self, state: &mut RequestState) -> StageResult {
        state.correlation_id = Some(Uuid::new_v4().to_string());
        StageResult::Continue
    }
}

struct ClassifyStage;

impl Stage for ClassifyStage {
    fn name(&self) -> &'static str {
        "classify"
    }

    fn run(&self, state: &mut RequestState) -> StageResult {
        let context = classify(&state.event.origin);
        state.context = Some(context);

        if allowed_in(context, &state.event.command) {
            return StageResult::Continue;
        }
        let command = &state.event.command;
        StageResult::Respond(ShortCircuit::Restricted {
            message: bilingual_notice(
                "dona.access.private_only.v1",
                &format!("🔒 `{command}` solo está disponible en mensajes directos conmigo."),
                &format!("`{command}` is only available in a direct message with me."),
            ),
        })
    }
}

struct RateLimitStage {
    limiter: Arc<RateLimiter>,
}

impl Stage for RateLimitStage {
    fn name(&self) -> &'static str {
        "rate_limit"
    }

    fn run(&self, state: &mut RequestState) -> StageResult {
        let key = state.event.identity.key();
        match self.limiter.try_admit(&key, &state.event.command, Instant::now()) {
            Admission::Admit { .. } => {
                state.admitted = true;
                StageResult::Continue
            }
            Admission::Deny { tier, retry_after } => StageResult::Respond(ShortCircuit::Denied {
                tier,
                retry_after,
                message: rate_limited_message(&state.event.command, tier, retry_after),
            }),
        }
    }
}

struct AuditStage {
    sink: Arc<dyn AuditSink>,
}

impl Stage for AuditStage {
    fn name(&self) -> &'static str {
        "audit"
    }

    fn run(&self, state: &mut RequestState) -> StageResult {
        let context = state.context.unwrap_or(ContextType::Public);
        let entry = AuditLogEntry::new(
            state.event.identity.key(),
            state.event.kind.as_str(),
            "command",
            state.correlation_id(),
        )
        .with_entity_id(&state.event.command)
        .with_metadata("context", context.as_str())
        .with_metadata("privacy_level", context.privacy_level())
        .with_metadata("channel_id", &state.event.origin.channel_id);

        self.sink.record(entry);
        StageResult::Continue
    }
}

/// Retry wait in whole seconds, never below one.
pub fn retry_after_secs(retry_after: Duration) -> u64 {
    let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
    secs.max(1)
}

pub fn rate_limited_message(command: &str, tier: LimitTier, retry_after: Duration) -> MessageTemplate {
    let secs = retry_after_secs(retry_after);
    let (es_wait, en_wait) = if secs >= 60 {
        let minutes = secs.div_ceil(60);
        let es_unit = if minutes == 1 { "minuto" } else { "minutos" };
        let en_unit = if minutes == 1 { "minute" } else { "minutes" };
        (
            format!("{secs} segundos (~{minutes} {es_unit})"),
            format!("{secs} seconds (~{minutes} {en_unit})"),
        )
    } else {
        (format!("{secs} segundos"), format!("{secs} seconds"))
    };

    match tier {
        LimitTier::Command => bilingual_notice(
            "dona.rate_limit.denied.v1",
            &format!("⏳ Usaste `{command}` demasiadas veces. Intenta de nuevo en {es_wait}."),
            &format!("You have used `{command}` too often. Try again in {en_wait}."),
        ),
        LimitTier::User => bilingual_notice(
            "dona.rate_limit.user.v1",
            &format!("⏳ Enviaste demasiadas solicitudes. Intenta de nuevo en {es_wait}."),
            &format!("You have sent too many requests. Try again in {en_wait}."),
        ),
        LimitTier::Global => bilingual_notice(
            "dona.rate_limit.global.v1",
            &format!("⏳ Estoy recibiendo muchas solicitudes. Intenta de nuevo en {es_wait}."),
            &format!("I am handling a lot of requests right now. Try again in {en_wait}."),
        ),
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Responded { correlation_id: String, message: MessageTemplate },
    Denied {
        correlation_id: String,
        tier: LimitTier,
        retry_after: Duration,
        message: MessageTemplate,
    },
    Restricted { correlation_id: String, message: MessageTemplate },
    Failed { correlation_id: String, error: InterfaceError, message: MessageTemplate },
}

impl Outcome {
    pub fn correlation_id(&self) -> &str {
        match self {
            Self::Responded { correlation_id, .. }
            | Self::Denied { correlation_id, .. }
            | Self::Restricted { correlation_id, .. }
            | Self::Failed { correlation_id, .. } => correlation_id,
        }
    }

    pub fn message(&self) -> &MessageTemplate {
        match self {
            Self::Responded { message, .. }
            | Self::Denied { message, .. }
            | Self::Restricted { message, .. }
            | Self::Failed { message, .. } => message,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Responded { .. } => "responded",
            Self::Denied { .. } => "denied",
            Self::Restricted { .. } => "restricted",
            Self::Failed { .. } => "failed",
        }
    }

    fn metric(&self) -> RequestOutcome {
        match self {
            Self::Responded { .. } => RequestOutcome::Succeeded,
            Self::Denied { .. } | Self::Restricted { .. } => RequestOutcome::Denied,
            Self::Failed { .. } => RequestOutcome::Failed,
        }
    }

    fn addressed_to(self, platform_user_id: &str) -> Self {
        match self {
            Self::Responded { correlation_id, message } => {
                Self::Responded { correlation_id, message: message.addressed_to(platform_user_id) }
            }
            Self::Denied { correlation_id, tier, retry_after, message } => Self::Denied {
                correlation_id,
                tier,
                retry_after,
                message: message.addressed_to(platform_user_id),
            },
            Self::Restricted { correlation_id, message } => {
                Self::Restricted { correlation_id, message: message.addressed_to(platform_user_id) }
            }
            Self::Failed { correlation_id, error, message } => Self::Failed {
                correlation_id,
                error,
                message: message.addressed_to(platform_user_id),
            },
        }
    }
}

enum Verdict {
    Continue,
    ShortCircuit(ShortCircuit),
    Fault { stage: &'static str },
}

pub struct MiddlewareChain {
    stages: Vec<Box<dyn Stage>>,
    router: Arc<CommandRouter>,
    metrics: Arc<RequestMetrics>,
    settings: ChainSettings,
}

impl MiddlewareChain {
    pub fn new(
        router: Arc<CommandRouter>,
        limiter: Arc<RateLimiter>,
        audit: Arc<dyn AuditSink>,
        metrics: Arc<RequestMetrics>,
        settings: ChainSettings,
    ) -> Self {
        let stages: Vec<Box<dyn Stage>> = vec![
            Box::new(CorrelationStage),
            Box::new(ClassifyStage),
            Box::new(RateLimitStage { limiter }),
            Box::new(AuditStage { sink: audit }),
        ];
        Self { stages, router, metrics, settings }
    }

    /// Appends a stage that runs after auditing, right before dispatch.
    pub fn with_stage(mut self, stage: Box<dyn Stage>) -> Self {
        self.stages.push(stage);
        self
    }

    /// Runs one event through the chain and delivers the final reply.
    pub async fn process(&self, event: InboundEvent, responder: &dyn EventResponder) -> Outcome {
        let started = Instant::now();
        let mut state = RequestState::new(event);
        let verdict = self.run_stages(&mut state);

        self.acknowledge(&state, responder).await;

        let correlation_id = state.correlation_id().to_owned();
        let outcome = match verdict {
            Verdict::Continue => self.dispatch(&state).await,
            Verdict::ShortCircuit(ShortCircuit::Denied { tier, retry_after, message }) => {
                info!(
                    event_name = "slack.middleware.rate_limited",
                    correlation_id = %correlation_id,
                    command = %state.event.command,
                    limit_type = tier.as_str(),
                    retry_after_secs = retry_after_secs(retry_after),
                    "request denied by rate limiter"
                );
                Outcome::Denied { correlation_id, tier, retry_after, message }
            }
            Verdict::ShortCircuit(ShortCircuit::Restricted { message }) => {
                info!(
                    event_name = "slack.middleware.restricted",
                    correlation_id = %correlation_id,
                    command = %state.event.command,
                    "private-only command used in a shared channel"
                );
                Outcome::Restricted { correlation_id, message }
            }
            Verdict::Fault { stage } => {
                let error = ApplicationError::Internal(format!("middleware stage `{stage}` failed"))
                    .into_interface(correlation_id.clone());
                failure(error)
            }
        };

        let outcome = match state.context {
            Some(ContextType::Private) => outcome.addressed_to(&state.event.identity.platform_user_id),
            _ => outcome,
        };

        if let Err(delivery_error) = responder.respond(outcome.message()).await {
            warn!(
                event_name = "slack.response.failed",
                correlation_id = %outcome.correlation_id(),
                error = %delivery_error,
                "could not deliver response"
            );
        }

        self.finish(&state, &outcome, started.elapsed());
        outcome
    }

    fn run_stages(&self, state: &mut RequestState) -> Verdict {
        for stage in &self.stages {
            match catch_unwind(AssertUnwindSafe(|| stage.run(state))) {
                Ok(StageResult::Continue) => {}
                Ok(StageResult::Respond(short_circuit)) => {
                    debug!(
                        event_name = "slack.middleware.short_circuit",
                        correlation_id = %state.correlation_id(),
                        stage = stage.name(),
                        "stage answered the request"
                    );
                    return Verdict::ShortCircuit(short_circuit);
                }
                Err(_) => {
                    error!(
                        event_name = "slack.middleware.stage_fault",
                        correlation_id = %state.correlation_id(),
                        stage = stage.name(),
                        "middleware stage panicked"
                    );
                    return Verdict::Fault { stage: stage.name() };
                }
            }
        }
        Verdict::Continue
    }

    async fn acknowledge(&self, state: &RequestState, responder: &dyn EventResponder) {
        let correlation_id = state.correlation_id();
        match tokio::time::timeout(self.settings.ack_deadline, responder.acknowledge()).await {
            Ok(Ok(())) => debug!(
                event_name = "slack.ack.sent",
                correlation_id = %correlation_id,
                event_id = %state.event.event_id,
                "acknowledged event"
            ),
            Ok(Err(ack_error)) => warn!(
                event_name = "slack.ack.failed",
                correlation_id = %correlation_id,
                event_id = %state.event.event_id,
                error = %ack_error,
                "failed to acknowledge event"
            ),
            Err(_) => error!(
                event_name = "slack.ack.deadline_missed",
                correlation_id = %correlation_id,
                event_id = %state.event.event_id,
                deadline_ms = self.settings.ack_deadline.as_millis() as u64,
                "acknowledgement did not complete within the deadline"
            ),
        }
    }

    async fn dispatch(&self, state: &RequestState) -> Outcome {
        let router = self.router.clone();
        let ctx = state.routing_context();
        let correlation_id = ctx.correlation_id.clone();
        let command = state.event.command.clone();
        let args = state.event.text.clone();

        // a panicking handler only takes down its own task
        let handled = tokio::spawn(async move { router.route(&command, &args, &ctx).await }).await;

        match handled {
            Ok(Ok(message)) => Outcome::Responded { correlation_id, message },
            Ok(Err(app_error)) => {
                let interface = app_error.clone().into_interface(correlation_id.clone());
                match &interface {
                    InterfaceError::Internal { .. } => error!(
                        event_name = "slack.handler.failed",
                        correlation_id = %correlation_id,
                        command = %state.event.command,
                        error = %app_error,
                        "handler failed"
                    ),
                    _ => warn!(
                        event_name = "slack.handler.failed",
                        correlation_id = %correlation_id,
                        command = %state.event.command,
                        error = %app_error,
                        "handler returned an error"
                    ),
                }
                failure(interface)
            }
            Err(join_error) => {
                error!(
                    event_name = "slack.handler.panicked",
                    correlation_id = %correlation_id,
                    command = %state.event.command,
                    error = %join_error,
                    "handler task aborted"
                );
                failure(
                    ApplicationError::Internal("handler task aborted".to_owned())
                        .into_interface(correlation_id),
                )
            }
        }
    }

    fn finish(&self, state: &RequestState, outcome: &Outcome, elapsed: Duration) {
        self.metrics.record(&state.event.command, outcome.metric(), elapsed);

        let elapsed_ms = elapsed.as_millis() as u64;
        if elapsed > self.settings.slow_request {
            warn!(
                event_name = "slack.request.slow",
                correlation_id = %outcome.correlation_id(),
                command = %state.event.command,
                elapsed_ms,
                threshold_ms = self.settings.slow_request.as_millis() as u64,
                "slow request"
            );
        }
        info!(
            event_name = "slack.request.completed",
            correlation_id = %outcome.correlation_id(),
            command = %state.event.command,
            kind = state.event.kind.as_str(),
            context = state.context.map(|c| c.as_str()).unwrap_or("unknown"),
            outcome = outcome.label(),
            admitted = state.admitted,
            elapsed_ms,
            "request completed"
        );
    }
}

fn failure(error: InterfaceError) -> Outcome {
    let es = match error {
        InterfaceError::BadRequest { .. } => "No pude procesar la solicitud. Revisa los datos.",
        InterfaceError::RateLimited { .. } => "Demasiadas solicitudes. Espera un momento.",
        InterfaceError::ServiceUnavailable { .. } => {
            "El servicio no está disponible por ahora. Intenta en unos momentos."
        }
        InterfaceError::Internal { .. } => "Lo siento, algo salió mal de nuestro lado.",
    };
    let correlation_id = error.correlation_id().to_owned();
    let summary = format!("{es} / {}", error.user_message());
    let message = error_message(&summary, &correlation_id);
    Outcome::Failed { correlation_id, error, message }
}
