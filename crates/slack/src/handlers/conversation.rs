use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use dona_agent::runtime::CONTEXT_WINDOW;
use dona_agent::{AgentRequest, AgentReply};
use dona_core::domain::conversation::{Conversation, ConversationKey, Message, NewMessage, SenderType};
use dona_core::domain::user::{Language, User};
use dona_core::errors::ApplicationError;
use dona_core::gateway::GatewayError;

use super::{tr, Services};
use crate::blocks::{notice, MessageBuilder, MessageTemplate};
use crate::commands::{CommandHandler, RoutingContext};

/// Free-text conversation with the assistant. Persistence is best effort:
/// when the store is down the user still gets an answer.
pub struct ConversationHandler {
    services: Arc<Services>,
}

impl ConversationHandler {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }

    async fn open(&self, user: &User, ctx: &RoutingContext) -> Result<Conversation, GatewayError> {
        let conversations = self.services.conversations.as_ref();
        let key = ConversationKey {
            user_id: user.id,
            channel_id: ctx.channel_id.clone(),
            thread_ts: ctx.thread_ts.clone(),
        };
        let key = &key;
        let context = ctx.context;
        let now = self.services.clock.now();
        self.services
            .retry
            .run("conversation.get_or_create", GatewayError::is_transient, move || {
                conversations.get_or_create(key, context, now)
            })
            .await
    }

    async fn history(&self, conversation: &Conversation) -> Result<Vec<Message>, GatewayError> {
        let conversations = self.services.conversations.as_ref();
        let id = conversation.id;
        self.services
            .retry
            .run("conversation.recent_messages", GatewayError::is_transient, move || {
                conversations.recent_messages(id, CONTEXT_WINDOW as u32)
            })
            .await
    }

    async fn append(&self, message: NewMessage, ctx: &RoutingContext) {
        let conversations = self.services.conversations.as_ref();
        let now = self.services.clock.now();
        let sender = message.sender_type;
        let pending = &message;
        let appended = self
            .services
            .retry
            .run("conversation.append_message", GatewayError::is_transient, move || {
                conversations.append_message(pending.clone(), now)
            })
            .await;

        if let Err(error) = appended {
            warn!(
                event_name = "slack.conversation.persist_failed",
                correlation_id = %ctx.correlation_id,
                sender = sender.as_str(),
                error = %error,
                "could not store conversation message"
            );
        }
    }
}

#[async_trait]
impl CommandHandler for ConversationHandler {
    async fn handle(
        &self,
        args: &str,
        ctx: &RoutingContext,
    ) -> Result<MessageTemplate, ApplicationError> {
        let user = self.services.resolve_user(ctx).await?;
        let language = user.preferences.language;
        let text = args.trim();
        if text.is_empty() {
            return Ok(greeting(language));
        }

        let conversation = match self.open(&user, ctx).await {
            Ok(conversation) => Some(conversation),
            Err(error) => {
                warn!(
                    event_name = "slack.conversation.unavailable",
                    correlation_id = %ctx.correlation_id,
                    error = %error,
                    "conversation store unavailable; answering without history"
                );
                None
            }
        };

        let history = match &conversation {
            Some(conversation) => self.history(conversation).await.unwrap_or_else(|error| {
                warn!(
                    event_name = "slack.conversation.history_failed",
                    correlation_id = %ctx.correlation_id,
                    error = %error,
                    "could not load conversation history"
                );
                Vec::new()
            }),
            None => Vec::new(),
        };

        let agent = &self.services.agent;
        let classification = agent.detect_intent(text, &ctx.correlation_id).await;
        if let Some(conversation) = &conversation {
            let incoming = NewMessage::new(conversation.id, SenderType::User, text)
                .with_intent(classification.intent.as_str());
            self.append(incoming, ctx).await;
        }

        let request = AgentRequest {
            text,
            history: &history,
            language,
            correlation_id: &ctx.correlation_id,
        };
        let reply = agent.respond(request, classification).await;

        if let Some(conversation) = &conversation {
            let outgoing = NewMessage::new(conversation.id, SenderType::Assistant, reply.text.clone())
                .with_intent(reply.classification.intent.as_str())
                .with_metadata("degraded", reply.degraded.to_string())
                .with_metadata("correlation_id", ctx.correlation_id.clone());
            self.append(outgoing, ctx).await;
        }

        info!(
            event_name = "slack.conversation.replied",
            correlation_id = %ctx.correlation_id,
            intent = reply.classification.intent.as_str(),
            confidence = reply.classification.confidence,
            degraded = reply.degraded,
            history = history.len(),
            "conversation reply sent"
        );
        Ok(render(&reply, language))
    }
}

fn greeting(language: Language) -> MessageTemplate {
    notice(
        "dona.conversation.greeting.v1",
        tr(
            language,
            "👋 ¡Hola! Soy Dona. Cuéntame en qué te ayudo, o usa `/dona-help` para ver mis comandos.",
            "👋 Hi! I'm Dona. Tell me what you need, or use `/dona-help` to see my commands.",
        ),
    )
}

fn render(reply: &AgentReply, language: Language) -> MessageTemplate {
    let mut builder = MessageBuilder::new(reply.text.clone())
        .section("dona.conversation.reply.v1", |section| {
            section.mrkdwn(reply.text.clone());
        });

    // only point at a command the reply doesn't already mention
    if let Some(command) = reply
        .classification
        .suggested_command
        .as_deref()
        .filter(|command| !reply.text.contains(command))
    {
        let hint = match language {
            Language::Es => format!("💡 Prueba `{command}`"),
            Language::En => format!("💡 Try `{command}`"),
        };
        builder = builder.context("dona.conversation.hint.v1", |context| {
            context.mrkdwn(hint);
        });
    }
    builder.build()
}

#[cfg(test)]
mod tests {
    use dona_agent::{AgentReply, Intent, IntentClassification};
    use dona_core::domain::user::Language;

    use super::render;
    use crate::blocks::Block;

    fn reply(text: &str, suggested: Option<&str>) -> AgentReply {
        AgentReply {
            text: text.to_owned(),
            classification: IntentClassification {
                intent: Intent::Task,
                confidence: 7,
                suggested_command: suggested.map(str::to_owned),
            },
            degraded: false,
        }
    }

    #[test]
    fn suggested_command_becomes_a_hint() {
        let message = render(&reply("Claro, anótalo.", Some("/dona-task create")), Language::Es);
        assert!(matches!(
            &message.blocks[1],
            Block::Context { elements, .. } if elements[0].text() == "💡 Prueba `/dona-task create`"
        ));
    }

    #[test]
    fn hint_is_skipped_when_the_reply_already_names_the_command() {
        let message =
            render(&reply("Usa `/dona-task create` para eso.", Some("/dona-task create")), Language::En);
        assert_eq!(message.blocks.len(), 1);
    }
}
