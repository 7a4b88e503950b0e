//! Invocation trait: the abstraction over streaming model calls.
//!
//! A `ChatService` sends the turn's messages to an LLM and reports progress
//! as a sequence of `StreamEvent`s on a channel the caller creates. Because
//! the caller owns the receiving end before `chat()` is called, no event can
//! be emitted before the subscription exists.
//!
//! Event contract:
//! - `Reading` deltas arrive in generation order and are appended, never replaced
//! - `Complete` carries the final content (possibly with an error if the stream
//!   broke after producing output)
//! - `Error` reports a failure; `aborted` is true when the caller cancelled
//!
//! Cancellation belongs to the call: every `chat()` receives its own
//! `CancellationToken`, so aborting one turn never touches another call on
//! the same service.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::InvocationError;

/// Sending half handed to the service for one call.
pub type EventSender = mpsc::Sender<StreamEvent>;

/// Role of a message sent to the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// One message of the model request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Model parameters the service will use for the next call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationContext {
    pub model: String,
    pub temperature: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

/// Final outcome of a model call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatResult {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ChatResult {
    /// The call failed before producing any content or reasoning.
    pub fn is_empty_failure(&self) -> bool {
        self.error.is_some()
            && self.content.trim().is_empty()
            && self
                .reasoning
                .as_deref()
                .is_none_or(|r| r.trim().is_empty())
    }
}

/// Progress reported by a `ChatService` during one call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Incremental text and reasoning deltas.
    Reading { content: String, reasoning: String },

    /// The model is running a tool.
    ToolCalls { name: String },

    /// The call finished.
    Complete(ChatResult),

    /// The call failed.
    Error { message: String, aborted: bool },
}

impl StreamEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Reading { .. } => "reading",
            Self::ToolCalls { .. } => "tool_calls",
            Self::Complete(_) => "complete",
            Self::Error { .. } => "error",
        }
    }
}

/// The core model-invocation trait.
#[async_trait]
pub trait ChatService: Send + Sync {
    /// A human-readable provider name (e.g., "openai", "ollama").
    fn provider_name(&self) -> &str;

    /// Whether the service is configured well enough to accept a call.
    fn is_ready(&self) -> bool;

    /// Model, temperature and max tokens for the next call.
    fn context(&self) -> InvocationContext;

    /// Run one call, reporting progress on `events`.
    ///
    /// Returns once the call has finished and every event has been sent.
    /// Cancelling `cancel` aborts this call only; the service then reports
    /// `StreamEvent::Error { aborted: true, .. }`. A token that is already
    /// cancelled fails the call before any request goes out.
    async fn chat(
        &self,
        messages: Vec<ChatMessage>,
        events: EventSender,
        cancel: CancellationToken,
    ) -> Result<(), InvocationError>;
}
