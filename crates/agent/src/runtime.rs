use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use dona_core::domain::conversation::{Message, SenderType};
use dona_core::domain::user::Language;
use dona_core::retry::RetryPolicy;

use crate::intent::{classify, fallback_response, parse_model_verdict, IntentClassification};
use crate::llm::{ChatMessage, ChatRole, CompletionRequest, LlmClient, LlmError};

/// Messages of prior conversation passed to the model.
pub const CONTEXT_WINDOW: usize = 5;

#[derive(Clone, Debug)]
pub struct AgentSettings {
    pub enabled: bool,
    pub reply_timeout: Duration,
    pub intent_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            reply_timeout: Duration::from_secs(30),
            intent_timeout: Duration::from_secs(15),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct AgentRequest<'a> {
    pub text: &'a str,
    pub history: &'a [Message],
    pub language: Language,
    pub correlation_id: &'a str,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AgentReply {
    pub text: String,
    pub classification: IntentClassification,
    /// True when the reply came from the deterministic fallback.
    pub degraded: bool,
}

/// Talks to the language model with a bounded timeout and retry, and falls
/// back to rule-based answers so a conversation never hangs on the provider.
pub struct AgentRuntime {
    client: Arc<dyn LlmClient>,
    settings: AgentSettings,
}

impl AgentRuntime {
    pub fn new(client: Arc<dyn LlmClient>, settings: AgentSettings) -> Self {
        Self { client, settings }
    }

    pub fn is_enabled(&self) -> bool {
        self.settings.enabled
    }

    pub async fn detect_intent(&self, text: &str, correlation_id: &str) -> IntentClassification {
        if !self.settings.enabled {
            return classify(text);
        }

        let request = CompletionRequest {
            messages: vec![ChatMessage::new(ChatRole::User, intent_prompt(text))],
            max_tokens: 200,
            temperature: 0.3,
        };

        match self.call(&request, self.settings.intent_timeout).await {
            Ok(content) => parse_model_verdict(&content).unwrap_or_else(|| classify(text)),
            Err(error) => {
                warn!(
                    event_name = "agent.intent.fallback",
                    correlation_id,
                    error = %error,
                    "intent detection fell back to keyword rules"
                );
                classify(text)
            }
        }
    }

    pub async fn reply(&self, request: AgentRequest<'_>) -> AgentReply {
        let classification = self.detect_intent(request.text, request.correlation_id).await;
        self.respond(request, classification).await
    }

    /// Answers with an intent the caller has already detected.
    pub async fn respond(
        &self,
        request: AgentRequest<'_>,
        classification: IntentClassification,
    ) -> AgentReply {
        if !self.settings.enabled {
            return fallback(classification, request.language);
        }

        let completion = CompletionRequest {
            messages: build_messages(&request),
            max_tokens: 1_000,
            temperature: 0.7,
        };

        match self.call(&completion, self.settings.reply_timeout).await {
            Ok(text) => {
                info!(
                    event_name = "agent.reply.generated",
                    correlation_id = request.correlation_id,
                    intent = classification.intent.as_str(),
                    "language model reply generated"
                );
                AgentReply { text, classification, degraded: false }
            }
            Err(error) => {
                warn!(
                    event_name = "agent.reply.fallback",
                    correlation_id = request.correlation_id,
                    intent = classification.intent.as_str(),
                    error = %error,
                    "language model unavailable; answering with fallback"
                );
                fallback(classification, request.language)
            }
        }
    }

    async fn call(&self, request: &CompletionRequest, limit: Duration) -> Result<String, LlmError> {
        let client = self.client.as_ref();
        let attempts = self.settings.retry.run("llm.complete", LlmError::is_transient, move || {
            client.complete(request)
        });

        match tokio::time::timeout(limit, attempts).await {
            Ok(result) => result,
            Err(_) => Err(LlmError::Timeout),
        }
    }
}

fn fallback(classification: IntentClassification, language: Language) -> AgentReply {
    AgentReply {
        text: fallback_response(classification.intent, language).to_owned(),
        classification,
        degraded: true,
    }
}

fn system_prompt(language: Language) -> String {
    let reply_language = match language {
        Language::Es => "Spanish",
        Language::En => "English",
    };
    format!(
        "You are Dona, an executive assistant working inside Slack for a small founding team. \
         Be concise, friendly and action oriented. Reply in {reply_language} unless the user \
         writes in another language. When the user wants to do something a command covers, \
         point to it: /dona-task for tasks, /dona-time for time tracking, /dona-summary for \
         activity summaries, /dona-status for current status and /dona-help for everything else."
    )
}

fn intent_prompt(text: &str) -> String {
    format!(
        "Classify the message below. Answer with JSON only, in the form \
         {{\"intent\": \"task|reminder|question|help|summary|status|config\", \
         \"confidence\": 1-10, \"suggested_command\": \"/dona-...\" or null}}.\n\nMessage: {text:?}"
    )
}

fn build_messages(request: &AgentRequest<'_>) -> Vec<ChatMessage> {
    let skip = request.history.len().saturating_sub(CONTEXT_WINDOW);
    let history = request.history.iter().skip(skip).map(|message| {
        let role = match message.sender_type {
            SenderType::User => ChatRole::User,
            SenderType::Assistant | SenderType::Agent => ChatRole::Assistant,
        };
        ChatMessage::new(role, message.content.clone())
    });

    std::iter::once(ChatMessage::new(ChatRole::System, system_prompt(request.language)))
        .chain(history)
        .chain(std::iter::once(ChatMessage::new(ChatRole::User, request.text)))
        .collect()
}
