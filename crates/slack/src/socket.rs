use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::blocks::MessageTemplate;
use crate::events::SlackEnvelope;
use crate::middleware::{EventResponder, MiddlewareChain};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport failed to connect: {0}")]
    Connect(String),
    #[error("transport read failed: {0}")]
    Receive(String),
    #[error("transport ack failed: {0}")]
    Acknowledge(String),
    #[error("transport response failed: {0}")]
    Respond(String),
    #[error("response bound of {bound} reached for envelope `{envelope_id}`")]
    ResponseBoundReached { envelope_id: String, bound: u32 },
    #[error("transport disconnect failed: {0}")]
    Disconnect(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self { max_retries: 5, base_delay_ms: 250, max_delay_ms: 5_000 }
    }
}

impl ReconnectPolicy {
    fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(16);
        let multiplier = 1_u64 << exponent;
        let delay_ms = self.base_delay_ms.saturating_mul(multiplier).min(self.max_delay_ms);
        Duration::from_millis(delay_ms)
    }
}

/// Messaging platform connection. Implementations own the wire protocol.
#[async_trait]
pub trait SocketTransport: Send + Sync {
    async fn connect(&self) -> Result<(), TransportError>;
    async fn next_envelope(&self) -> Result<Option<SlackEnvelope>, TransportError>;
    async fn acknowledge(&self, envelope_id: &str) -> Result<(), TransportError>;
    async fn respond(
        &self,
        envelope_id: &str,
        message: &MessageTemplate,
    ) -> Result<(), TransportError>;
    async fn disconnect(&self) -> Result<(), TransportError>;
}

/// Used when no platform connection is configured.
#[derive(Default)]
pub struct NoopSocketTransport;

#[async_trait]
impl SocketTransport for NoopSocketTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn next_envelope(&self) -> Result<Option<SlackEnvelope>, TransportError> {
        Ok(None)
    }

    async fn acknowledge(&self, _envelope_id: &str) -> Result<(), TransportError> {
        Ok(())
    }

    async fn respond(
        &self,
        _envelope_id: &str,
        _message: &MessageTemplate,
    ) -> Result<(), TransportError> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Binds one envelope to the transport and caps how often it may be answered.
pub struct EnvelopeResponder {
    transport: Arc<dyn SocketTransport>,
    envelope_id: String,
    response_bound: u32,
    responses: AtomicU32,
}

impl EnvelopeResponder {
    pub fn new(
        transport: Arc<dyn SocketTransport>,
        envelope_id: impl Into<String>,
        response_bound: u32,
    ) -> Self {
        Self {
            transport,
            envelope_id: envelope_id.into(),
            response_bound,
            responses: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl EventResponder for EnvelopeResponder {
    async fn acknowledge(&self) -> Result<(), TransportError> {
        self.transport.acknowledge(&self.envelope_id).await
    }

    async fn respond(&self, message: &MessageTemplate) -> Result<(), TransportError> {
        let sent = self.responses.fetch_add(1, Ordering::AcqRel);
        if sent >= self.response_bound {
            return Err(TransportError::ResponseBoundReached {
                envelope_id: self.envelope_id.clone(),
                bound: self.response_bound,
            });
        }
        self.transport.respond(&self.envelope_id, message).await
    }
}

pub struct SocketModeRunner {
    transport: Arc<dyn SocketTransport>,
    chain: Arc<MiddlewareChain>,
    reconnect_policy: ReconnectPolicy,
    response_bound: u32,
}

impl SocketModeRunner {
    pub fn new(
        transport: Arc<dyn SocketTransport>,
        chain: Arc<MiddlewareChain>,
        reconnect_policy: ReconnectPolicy,
        response_bound: u32,
    ) -> Self {
        Self { transport, chain, reconnect_policy, response_bound }
    }

    /// Pumps envelopes until the transport closes or reconnects are exhausted.
    /// In-flight events are allowed to finish before returning.
    pub async fn start(&self) -> Result<()> {
        let mut in_flight = JoinSet::new();
        let mut attempt = 0;

        loop {
            let mut pumped = 0_u64;
            match self.connect_and_pump(attempt, &mut in_flight, &mut pumped).await {
                Ok(()) => break,
                Err(transport_error) => {
                    // a session that delivered envelopes starts a fresh retry budget
                    if pumped > 0 {
                        attempt = 0;
                    }
                    warn!(
                        event_name = "slack.socket.transport_failed",
                        attempt,
                        pumped,
                        max_retries = self.reconnect_policy.max_retries,
                        error = %transport_error,
                        "socket mode transport failed"
                    );

                    if attempt >= self.reconnect_policy.max_retries {
                        warn!(
                            event_name = "slack.socket.retries_exhausted",
                            max_retries = self.reconnect_policy.max_retries,
                            "socket mode retries exhausted; continuing process without crash"
                        );
                        break;
                    }

                    let delay = self.reconnect_policy.backoff(attempt);
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    attempt += 1;
                }
            }
        }

        while let Some(joined) = in_flight.join_next().await {
            log_join_failure(joined);
        }
        Ok(())
    }

    async fn connect_and_pump(
        &self,
        attempt: u32,
        in_flight: &mut JoinSet<()>,
        pumped: &mut u64,
    ) -> Result<(), TransportError> {
        info!(event_name = "slack.socket.connecting", attempt, "opening socket mode connection");
        self.transport.connect().await?;
        info!(event_name = "slack.socket.connected", attempt, "socket mode transport connected");

        loop {
            while let Some(joined) = in_flight.try_join_next() {
                log_join_failure(joined);
            }

            let Some(envelope) = self.transport.next_envelope().await? else {
                info!(event_name = "slack.socket.closed", attempt, "socket mode stream closed");
                self.transport.disconnect().await?;
                return Ok(());
            };
            *pumped += 1;

            info!(
                event_name = "ingress.slack.envelope_received",
                envelope_id = %envelope.envelope_id,
                event_type = ?envelope.event.event_type(),
                "received slack envelope"
            );

            let Some(event) = envelope.to_inbound() else {
                // unanswered events still need an ack or the platform redelivers them
                if let Err(error) = self.transport.acknowledge(&envelope.envelope_id).await {
                    warn!(
                        event_name = "slack.ack.failed",
                        envelope_id = %envelope.envelope_id,
                        error = %error,
                        "failed to acknowledge ignored envelope"
                    );
                }
                debug!(
                    event_name = "slack.socket.envelope_ignored",
                    envelope_id = %envelope.envelope_id,
                    "envelope carries nothing to answer"
                );
                continue;
            };

            let chain = self.chain.clone();
            let responder = EnvelopeResponder::new(
                self.transport.clone(),
                envelope.envelope_id.clone(),
                self.response_bound,
            );
            in_flight.spawn(async move {
                chain.process(event, &responder).await;
            });
        }
    }
}

fn log_join_failure(joined: Result<(), tokio::task::JoinError>) {
    if let Err(join_error) = joined {
        warn!(
            event_name = "slack.socket.event_task_failed",
            error = %join_error,
            "event task ended abnormally"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Arc;

    use async_trait::async_trait;
    use tokio::sync::Mutex;

    use dona_core::audit::InMemoryAuditSink;
    use dona_core::errors::ApplicationError;
    use dona_core::rate_limit::RateLimiter;

    use super::{
        EnvelopeResponder, ReconnectPolicy, SocketModeRunner, SocketTransport, TransportError,
    };
    use crate::blocks::{notice, MessageTemplate};
    use crate::commands::{CommandHandler, CommandRouter, RoutingContext};
    use crate::events::{SlackEnvelope, SlackEvent, SlashCommandPayload};
    use crate::metrics::RequestMetrics;
    use crate::middleware::{ChainSettings, EventResponder, MiddlewareChain};

    #[derive(Default)]
    struct ScriptedTransport {
        state: Mutex<ScriptedState>,
    }

    #[derive(Default)]
    struct ScriptedState {
        connect_results: VecDeque<Result<(), TransportError>>,
        envelopes: VecDeque<Result<Option<SlackEnvelope>, TransportError>>,
        connect_attempts: usize,
        acknowledgements: Vec<String>,
        responses: Vec<(String, String)>,
        disconnect_calls: usize,
    }

    impl ScriptedTransport {
        fn with_script(
            connect_results: Vec<Result<(), TransportError>>,
            envelopes: Vec<Result<Option<SlackEnvelope>, TransportError>>,
        ) -> Self {
            Self {
                state: Mutex::new(ScriptedState {
                    connect_results: connect_results.into(),
                    envelopes: envelopes.into(),
                    ..ScriptedState::default()
                }),
            }
        }
    }

    #[async_trait]
    impl SocketTransport for ScriptedTransport {
        async fn connect(&self) -> Result<(), TransportError> {
            let mut state = self.state.lock().await;
            state.connect_attempts += 1;
            state.connect_results.pop_front().unwrap_or(Ok(()))
        }

        async fn next_envelope(&self) -> Result<Option<SlackEnvelope>, TransportError> {
            let mut state = self.state.lock().await;
            state.envelopes.pop_front().unwrap_or(Ok(None))
        }

        async fn acknowledge(&self, envelope_id: &str) -> Result<(), TransportError> {
            self.state.lock().await.acknowledgements.push(envelope_id.to_owned());
            Ok(())
        }

        async fn respond(
            &self,
            envelope_id: &str,
            message: &MessageTemplate,
        ) -> Result<(), TransportError> {
            self.state
                .lock()
                .await
                .responses
                .push((envelope_id.to_owned(), message.fallback_text.clone()));
            Ok(())
        }

        async fn disconnect(&self) -> Result<(), TransportError> {
            self.state.lock().await.disconnect_calls += 1;
            Ok(())
        }
    }

    struct Pong;

    #[async_trait]
    impl CommandHandler for Pong {
        async fn handle(
            &self,
            _args: &str,
            _ctx: &RoutingContext,
        ) -> Result<MessageTemplate, ApplicationError> {
            Ok(notice("test.pong.v1", "pong"))
        }
    }

    fn chain() -> Arc<MiddlewareChain> {
        Arc::new(MiddlewareChain::new(
            Arc::new(CommandRouter::new().with("/dona-help", Arc::new(Pong))),
            Arc::new(RateLimiter::default()),
            Arc::new(InMemoryAuditSink::default()),
            Arc::new(RequestMetrics::new()),
            ChainSettings::default(),
        ))
    }

    fn command(envelope_id: &str) -> SlackEnvelope {
        SlackEnvelope {
            envelope_id: envelope_id.to_owned(),
            event: SlackEvent::SlashCommand(SlashCommandPayload {
                command: "/dona-help".to_owned(),
                text: String::new(),
                team_id: "T1".to_owned(),
                channel_id: "C1".to_owned(),
                channel_name: Some("general".to_owned()),
                user_id: "U1".to_owned(),
                trigger_id: None,
            }),
        }
    }

    fn policy(max_retries: u32) -> ReconnectPolicy {
        ReconnectPolicy { max_retries, base_delay_ms: 0, max_delay_ms: 0 }
    }

    #[tokio::test]
    async fn reconnects_after_initial_connect_failure() {
        let transport = Arc::new(ScriptedTransport::with_script(
            vec![Err(TransportError::Connect("network down".to_owned())), Ok(())],
            vec![Ok(Some(command("env-1"))), Ok(None)],
        ));

        let runner = SocketModeRunner::new(transport.clone(), chain(), policy(2), 3);
        runner.start().await.expect("runner should not fail");

        let state = transport.state.lock().await;
        assert_eq!(state.connect_attempts, 2);
        assert_eq!(state.acknowledgements, vec!["env-1"]);
        assert_eq!(state.responses, vec![("env-1".to_owned(), "pong".to_owned())]);
        assert_eq!(state.disconnect_calls, 1);
    }

    #[tokio::test]
    async fn exhausts_retries_without_crashing() {
        let transport = Arc::new(ScriptedTransport::with_script(
            vec![
                Err(TransportError::Connect("fail-1".to_owned())),
                Err(TransportError::Connect("fail-2".to_owned())),
                Err(TransportError::Connect("fail-3".to_owned())),
            ],
            vec![],
        ));

        let runner = SocketModeRunner::new(transport.clone(), chain(), policy(2), 3);
        runner.start().await.expect("runner should degrade gracefully");

        assert_eq!(transport.state.lock().await.connect_attempts, 3);
    }

    #[tokio::test]
    async fn sessions_that_delivered_envelopes_reset_the_retry_budget() {
        let dropped = || Err(TransportError::Receive("connection reset".to_owned()));
        let transport = Arc::new(ScriptedTransport::with_script(
            vec![Ok(()), Ok(()), Ok(())],
            vec![
                Ok(Some(command("env-1"))),
                dropped(),
                Ok(Some(command("env-2"))),
                dropped(),
                Ok(Some(command("env-3"))),
                Ok(None),
            ],
        ));

        let runner = SocketModeRunner::new(transport.clone(), chain(), policy(1), 3);
        runner.start().await.expect("runner should not fail");

        let state = transport.state.lock().await;
        assert_eq!(state.connect_attempts, 3);
        let mut acks = state.acknowledgements.clone();
        acks.sort();
        assert_eq!(acks, vec!["env-1", "env-2", "env-3"]);
        assert_eq!(state.disconnect_calls, 1);
    }

    #[tokio::test]
    async fn sessions_without_envelopes_still_use_up_retries() {
        let transport = Arc::new(ScriptedTransport::with_script(
            vec![Ok(()), Ok(()), Ok(())],
            vec![
                Err(TransportError::Receive("reset-1".to_owned())),
                Err(TransportError::Receive("reset-2".to_owned())),
                Ok(Some(command("env-late"))),
            ],
        ));

        let runner = SocketModeRunner::new(transport.clone(), chain(), policy(1), 3);
        runner.start().await.expect("runner should degrade gracefully");

        let state = transport.state.lock().await;
        assert_eq!(state.connect_attempts, 2);
        assert!(state.acknowledgements.is_empty());
    }

    #[tokio::test]
    async fn ignored_envelopes_are_acknowledged_without_reply() {
        let transport = Arc::new(ScriptedTransport::with_script(
            vec![Ok(())],
            vec![
                Ok(Some(SlackEnvelope {
                    envelope_id: "env-hello".to_owned(),
                    event: SlackEvent::Unsupported { event_type: "interactive".to_owned() },
                })),
                Ok(Some(command("env-2"))),
                Ok(None),
            ],
        ));

        let runner = SocketModeRunner::new(transport.clone(), chain(), policy(0), 3);
        runner.start().await.expect("runner");

        let state = transport.state.lock().await;
        let mut acks = state.acknowledgements.clone();
        acks.sort();
        assert_eq!(acks, vec!["env-2", "env-hello"]);
        assert_eq!(state.responses.len(), 1);
        assert_eq!(state.responses[0].0, "env-2");
    }

    #[tokio::test]
    async fn responses_per_envelope_are_capped() {
        let transport = Arc::new(ScriptedTransport::default());
        let responder = EnvelopeResponder::new(transport.clone(), "env-3", 2);
        let message = notice("test.v1", "update");

        responder.respond(&message).await.expect("first");
        responder.respond(&message).await.expect("second");
        let third = responder.respond(&message).await.expect_err("bound reached");

        assert_eq!(
            third,
            TransportError::ResponseBoundReached { envelope_id: "env-3".to_owned(), bound: 2 }
        );
        assert_eq!(transport.state.lock().await.responses.len(), 2);
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let policy = ReconnectPolicy { max_retries: 5, base_delay_ms: 250, max_delay_ms: 1_000 };
        assert_eq!(policy.backoff(0).as_millis(), 250);
        assert_eq!(policy.backoff(1).as_millis(), 500);
        assert_eq!(policy.backoff(4).as_millis(), 1_000);
    }
}
