//! Socket Mode envelopes and the typed event the middleware chain works on.

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use dona_core::context::ChannelOrigin;
use dona_core::domain::user::PlatformIdentity;

use crate::commands::CONVERSATION_COMMAND;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SlackEnvelope {
    pub envelope_id: String,
    pub event: SlackEvent,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SlackEvent {
    SlashCommand(SlashCommandPayload),
    Message(MessageEvent),
    AppMention(MessageEvent),
    Unsupported { event_type: String },
}

impl SlackEvent {
    pub fn event_type(&self) -> SlackEventType {
        match self {
            Self::SlashCommand(_) => SlackEventType::SlashCommand,
            Self::Message(_) => SlackEventType::Message,
            Self::AppMention(_) => SlackEventType::AppMention,
            Self::Unsupported { .. } => SlackEventType::Unsupported,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SlackEventType {
    SlashCommand,
    Message,
    AppMention,
    Unsupported,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct SlashCommandPayload {
    pub command: String,
    #[serde(default)]
    pub text: String,
    pub team_id: String,
    pub channel_id: String,
    #[serde(default)]
    pub channel_name: Option<String>,
    pub user_id: String,
    #[serde(default)]
    pub trigger_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageEvent {
    pub team_id: String,
    pub channel_id: String,
    pub channel_type: Option<String>,
    pub user_id: Option<String>,
    pub text: String,
    pub ts: String,
    pub thread_ts: Option<String>,
    /// Set for messages posted by bots, including Dona itself.
    pub bot_id: Option<String>,
    pub subtype: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("envelope is not valid JSON: {0}")]
    Json(String),
    #[error("`{0}` frame carries no envelope id")]
    MissingEnvelopeId(String),
    #[error("`{kind}` payload is malformed: {reason}")]
    Payload { kind: String, reason: String },
}

#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(default)]
    envelope_id: Option<String>,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
}

#[derive(Deserialize)]
struct RawEventCallback {
    #[serde(default)]
    team_id: Option<String>,
    event: RawEvent,
}

#[derive(Deserialize)]
struct RawEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    team: Option<String>,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    channel_type: Option<String>,
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    ts: Option<String>,
    #[serde(default)]
    thread_ts: Option<String>,
    #[serde(default)]
    bot_id: Option<String>,
    #[serde(default)]
    subtype: Option<String>,
}

/// Decodes one Socket Mode frame. Control frames such as `hello` and
/// `disconnect` have no envelope id and are reported as
/// `EnvelopeError::MissingEnvelopeId` for the transport to handle.
pub fn parse_envelope(raw: &str) -> Result<SlackEnvelope, EnvelopeError> {
    let envelope: RawEnvelope =
        serde_json::from_str(raw).map_err(|e| EnvelopeError::Json(e.to_string()))?;
    let envelope_id = envelope
        .envelope_id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| EnvelopeError::MissingEnvelopeId(envelope.kind.clone()))?;
    let malformed = |reason: String| EnvelopeError::Payload { kind: envelope.kind.clone(), reason };

    let event = match envelope.kind.as_str() {
        "slash_commands" => SlackEvent::SlashCommand(
            serde_json::from_value(envelope.payload).map_err(|e| malformed(e.to_string()))?,
        ),
        "events_api" => {
            let callback: RawEventCallback =
                serde_json::from_value(envelope.payload).map_err(|e| malformed(e.to_string()))?;
            decode_callback(callback).map_err(malformed)?
        }
        other => SlackEvent::Unsupported { event_type: other.to_owned() },
    };

    Ok(SlackEnvelope { envelope_id, event })
}

fn decode_callback(callback: RawEventCallback) -> Result<SlackEvent, String> {
    let raw = callback.event;
    if raw.kind != "message" && raw.kind != "app_mention" {
        return Ok(SlackEvent::Unsupported { event_type: raw.kind });
    }

    let team_id = raw
        .team
        .or(callback.team_id)
        .ok_or_else(|| format!("{} event has no team id", raw.kind))?;
    let channel_id = raw.channel.ok_or_else(|| format!("{} event has no channel", raw.kind))?;
    let ts = raw.ts.ok_or_else(|| format!("{} event has no ts", raw.kind))?;
    let message = MessageEvent {
        team_id,
        channel_id,
        channel_type: raw.channel_type,
        user_id: raw.user,
        text: raw.text.unwrap_or_default(),
        ts,
        thread_ts: raw.thread_ts,
        bot_id: raw.bot_id,
        subtype: raw.subtype,
    };

    Ok(if raw.kind == "app_mention" {
        SlackEvent::AppMention(message)
    } else {
        SlackEvent::Message(message)
    })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    SlashCommand,
    DirectMessage,
    Mention,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SlashCommand => "slash_command",
            Self::DirectMessage => "direct_message",
            Self::Mention => "mention",
        }
    }
}

/// Everything the pipeline needs about one interaction. Every field is
/// resolved up front; nothing is inspected later.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundEvent {
    pub event_id: String,
    pub kind: EventKind,
    pub command: String,
    pub text: String,
    pub identity: PlatformIdentity,
    pub origin: ChannelOrigin,
    pub thread_ts: Option<String>,
}

impl SlackEnvelope {
    /// `None` for events Dona does not answer: bot traffic, message edits,
    /// channel chatter that does not mention the bot and unsupported types.
    pub fn to_inbound(&self) -> Option<InboundEvent> {
        match &self.event {
            SlackEvent::SlashCommand(payload) => {
                let mut origin = ChannelOrigin::new(&payload.channel_id);
                origin.channel_name = payload.channel_name.clone();
                Some(InboundEvent {
                    event_id: self.envelope_id.clone(),
                    kind: EventKind::SlashCommand,
                    command: payload.command.trim().to_lowercase(),
                    text: payload.text.trim().to_owned(),
                    identity: PlatformIdentity::new(&payload.user_id, &payload.team_id),
                    origin,
                    thread_ts: None,
                })
            }
            SlackEvent::Message(message) => {
                if message.channel_type.as_deref() != Some("im") {
                    return None;
                }
                let user_id = human_author(message)?;
                Some(InboundEvent {
                    event_id: self.envelope_id.clone(),
                    kind: EventKind::DirectMessage,
                    command: CONVERSATION_COMMAND.to_owned(),
                    text: message.text.trim().to_owned(),
                    identity: PlatformIdentity::new(user_id, &message.team_id),
                    origin: origin_of(message),
                    thread_ts: message.thread_ts.clone(),
                })
            }
            SlackEvent::AppMention(message) => {
                let user_id = human_author(message)?;
                Some(InboundEvent {
                    event_id: self.envelope_id.clone(),
                    kind: EventKind::Mention,
                    command: CONVERSATION_COMMAND.to_owned(),
                    text: strip_mentions(&message.text),
                    identity: PlatformIdentity::new(user_id, &message.team_id),
                    origin: origin_of(message),
                    // mentions are answered in a thread under the message
                    thread_ts: message.thread_ts.clone().or_else(|| Some(message.ts.clone())),
                })
            }
            SlackEvent::Unsupported { .. } => None,
        }
    }
}

fn human_author(message: &MessageEvent) -> Option<&str> {
    if message.bot_id.is_some() || message.subtype.is_some() {
        return None;
    }
    message.user_id.as_deref().filter(|user| !user.is_empty())
}

fn origin_of(message: &MessageEvent) -> ChannelOrigin {
    let mut origin = ChannelOrigin::new(&message.channel_id);
    origin.channel_type = message.channel_type.clone();
    origin
}

fn strip_mentions(text: &str) -> String {
    text.split_whitespace()
        .filter(|token| !(token.starts_with("<@") && token.ends_with('>')))
        .collect::<Vec<_>>()
        .join(" ")
}
