//! Language-model boundary for Dona.
//!
//! - `llm`: the `LlmClient` trait and an OpenAI-compatible HTTP client.
//! - `intent`: keyword intent rules and deterministic fallback replies.
//! - `runtime`: `AgentRuntime`, which bounds every model call with a timeout
//!   and degrades to the fallback instead of failing the request.
//!
//! The model only phrases answers. Task and time state changes always go
//! through the lifecycle managers in `dona-core`.

pub mod intent;
pub mod llm;
pub mod runtime;

pub use intent::{classify, Intent, IntentClassification};
pub use llm::{
    DisabledLlmClient, LlmClient, LlmError, OpenAiCompatibleClient, ScriptedLlmClient,
    ScriptedOutcome,
};
pub use runtime::{AgentReply, AgentRequest, AgentRuntime, AgentSettings};
