//! OpenAI-compatible chat service.
//!
//! Works with: OpenAI, OpenRouter, Ollama, vLLM, DeepSeek, and any endpoint
//! exposing `/v1/chat/completions` with SSE streaming.
//!
//! Supports:
//! - Streaming content and `reasoning_content` deltas
//! - Tool-call announcements (the first delta naming a tool)
//! - Usage reporting via `stream_options.include_usage`
//! - Cancellation of the call in flight

use std::collections::HashSet;
use std::sync::RwLock;

use async_trait::async_trait;
use colloquy_config::AppConfig;
use colloquy_core::error::InvocationError;
use colloquy_core::invocation::{
    ChatMessage, ChatResult, ChatService, EventSender, InvocationContext, Role, StreamEvent,
};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// A chat service for any OpenAI-compatible endpoint.
pub struct OpenAiCompatChatService {
    name: String,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
    context: RwLock<InvocationContext>,
}

impl OpenAiCompatChatService {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        context: InvocationContext,
    ) -> Result<Self, InvocationError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(300))
            .build()
            .map_err(|e| InvocationError::Network(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            client,
            context: RwLock::new(context),
        })
    }

    /// Create an OpenAI service (convenience constructor).
    pub fn openai(api_key: impl Into<String>, context: InvocationContext) -> Result<Self, InvocationError> {
        Self::new("openai", "https://api.openai.com/v1", api_key, context)
    }

    /// Create an Ollama service (convenience constructor).
    pub fn ollama(base_url: Option<&str>, context: InvocationContext) -> Result<Self, InvocationError> {
        Self::new(
            "ollama",
            base_url.unwrap_or("http://localhost:11434/v1"),
            "ollama", // Ollama doesn't need a real key
            context,
        )
    }

    /// Build the service described by the application config.
    pub fn from_config(config: &AppConfig) -> Result<Self, InvocationError> {
        let context = InvocationContext {
            model: config.default_model.clone(),
            temperature: config.default_temperature,
            max_tokens: Some(config.default_max_tokens),
        };
        match config.default_provider.as_str() {
            "ollama" => Self::ollama(None, context),
            "openrouter" => Self::new(
                "openrouter",
                "https://openrouter.ai/api/v1",
                config.api_key.clone().unwrap_or_default(),
                context,
            ),
            name => Self::new(
                name,
                config.api_url.as_str(),
                config.api_key.clone().unwrap_or_default(),
                context,
            ),
        }
    }

    /// Switch the model used by later calls.
    pub fn set_model(&self, model: impl Into<String>) {
        self.context
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .model = model.into();
    }

    fn request_body(&self, messages: &[ChatMessage]) -> serde_json::Value {
        let context = self.context();
        let mut body = serde_json::json!({
            "model": context.model,
            "messages": to_api_messages(messages),
            "temperature": context.temperature,
            "stream": true,
            "stream_options": { "include_usage": true },
        });
        if let Some(max_tokens) = context.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }
        body
    }

    async fn run(
        &self,
        messages: &[ChatMessage],
        token: &CancellationToken,
        events: &EventSender,
    ) -> Result<(), InvocationError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.request_body(messages);

        debug!(provider = %self.name, model = %body["model"], "Sending streaming request");

        let request = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .header("Accept", "text/event-stream")
            .json(&body)
            .send();

        let response = tokio::select! {
            biased;
            _ = token.cancelled() => return report_abort(events).await,
            response = request => response.map_err(|e| InvocationError::Network(e.to_string())),
        };
        let response = match response {
            Ok(response) => response,
            Err(e) => return report_failure(events, e).await,
        };

        let status = response.status().as_u16();
        if status == 429 {
            return report_failure(events, InvocationError::RateLimited { retry_after_secs: 5 }).await;
        }
        if status == 401 || status == 403 {
            return report_failure(
                events,
                InvocationError::AuthenticationFailed(
                    "Invalid API key or insufficient permissions".into(),
                ),
            )
            .await;
        }
        if status != 200 {
            let error_body = response.text().await.unwrap_or_default();
            warn!(status, body = %error_body, "Provider streaming error");
            return report_failure(
                events,
                InvocationError::ApiError {
                    status_code: status,
                    message: error_body,
                },
            )
            .await;
        }

        pump_events(&self.name, response.bytes_stream(), token, events).await
    }
}

#[async_trait]
impl ChatService for OpenAiCompatChatService {
    fn provider_name(&self) -> &str {
        &self.name
    }

    fn is_ready(&self) -> bool {
        !self.api_key.is_empty() && !self.context().model.is_empty()
    }

    fn context(&self) -> InvocationContext {
        self.context
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    async fn chat(
        &self,
        messages: Vec<ChatMessage>,
        events: EventSender,
        cancel: CancellationToken,
    ) -> Result<(), InvocationError> {
        if cancel.is_cancelled() {
            debug!(provider = %self.name, "Call cancelled before sending");
            return report_abort(&events).await;
        }
        self.run(&messages, &cancel, &events).await
    }
}

async fn report_abort(events: &EventSender) -> Result<(), InvocationError> {
    let error = InvocationError::Aborted;
    let _ = events
        .send(StreamEvent::Error {
            message: error.to_string(),
            aborted: true,
        })
        .await;
    Err(error)
}

async fn report_failure(events: &EventSender, error: InvocationError) -> Result<(), InvocationError> {
    let _ = events
        .send(StreamEvent::Error {
            message: error.to_string(),
            aborted: false,
        })
        .await;
    Err(error)
}

/// Read an SSE byte stream to its end, translating chunks into events.
///
/// Ends with exactly one `Complete` or `Error` event.
async fn pump_events<S, B, E>(
    provider: &str,
    stream: S,
    token: &CancellationToken,
    events: &EventSender,
) -> Result<(), InvocationError>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    let mut stream = std::pin::pin!(stream);
    let mut lines = SseLines::default();
    let mut state = StreamState::default();

    loop {
        let next = tokio::select! {
            biased;
            _ = token.cancelled() => return report_abort(events).await,
            next = stream.next() => next,
        };
        let bytes = match next {
            Some(Ok(bytes)) => bytes,
            Some(Err(e)) => {
                let error = InvocationError::StreamInterrupted(e.to_string());
                if state.has_output() {
                    // Partial output survives: complete it with the error attached
                    let _ = events
                        .send(StreamEvent::Complete(state.finish(Some(error.to_string()))))
                        .await;
                    return Err(error);
                }
                return report_failure(events, error).await;
            }
            // Stream ended without [DONE]
            None => break,
        };

        for item in lines.push(bytes.as_ref()) {
            let data = match item {
                SseItem::Done => {
                    let _ = events.send(StreamEvent::Complete(state.finish(None))).await;
                    return Ok(());
                }
                SseItem::Data(data) => data,
            };
            match serde_json::from_str::<StreamResponse>(&data) {
                Ok(chunk) => {
                    for event in state.apply(chunk) {
                        if events.send(event).await.is_err() {
                            return Ok(()); // receiver dropped
                        }
                    }
                }
                Err(e) => {
                    trace!(provider = %provider, data = %data, error = %e, "Ignoring unparseable SSE chunk");
                }
            }
        }
    }

    let _ = events.send(StreamEvent::Complete(state.finish(None))).await;
    Ok(())
}

fn to_api_messages(messages: &[ChatMessage]) -> Vec<ApiMessage> {
    messages
        .iter()
        .map(|m| ApiMessage {
            role: match m.role {
                Role::User => "user".into(),
                Role::Assistant => "assistant".into(),
                Role::System => "system".into(),
            },
            content: m.content.clone(),
        })
        .collect()
}

// --- SSE framing ---

#[derive(Debug, PartialEq)]
enum SseItem {
    Data(String),
    /// The `[DONE]` sentinel
    Done,
}

/// Splits a byte stream into SSE `data:` payloads. Bytes are buffered until
/// a full line arrives, so multi-byte characters may straddle chunks.
#[derive(Default)]
struct SseLines {
    buffer: Vec<u8>,
}

impl SseLines {
    fn push(&mut self, bytes: &[u8]) -> Vec<SseItem> {
        self.buffer.extend_from_slice(bytes);
        let mut items = Vec::new();

        while let Some(line_end) = self.buffer.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=line_end).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);

            // Skip empty lines and SSE comments
            if line.is_empty() || line.starts_with(':') {
                continue;
            }
            if let Some(data) = line.strip_prefix("data:") {
                let data = data.trim();
                if data == "[DONE]" {
                    items.push(SseItem::Done);
                } else if !data.is_empty() {
                    items.push(SseItem::Data(data.to_string()));
                }
            }
        }
        items
    }
}

// --- Stream accumulation ---

#[derive(Default)]
struct StreamState {
    content: String,
    reasoning: String,
    input_tokens: Option<u32>,
    output_tokens: Option<u32>,
    /// Tool-call indices already announced
    announced: HashSet<u32>,
}

impl StreamState {
    /// Fold one chunk in and return the events it produces.
    fn apply(&mut self, chunk: StreamResponse) -> Vec<StreamEvent> {
        let mut events = Vec::new();

        if let Some(choice) = chunk.choices.into_iter().next() {
            let delta = choice.delta;
            let content = delta.content.unwrap_or_default();
            let reasoning = delta
                .reasoning_content
                .or(delta.reasoning)
                .unwrap_or_default();

            for tool_call in delta.tool_calls.unwrap_or_default() {
                let name = tool_call.function.and_then(|f| f.name).unwrap_or_default();
                if !name.is_empty() && self.announced.insert(tool_call.index) {
                    events.push(StreamEvent::ToolCalls { name });
                }
            }

            if !content.is_empty() || !reasoning.is_empty() {
                self.content.push_str(&content);
                self.reasoning.push_str(&reasoning);
                events.push(StreamEvent::Reading { content, reasoning });
            }
        }

        if let Some(usage) = chunk.usage {
            self.input_tokens = Some(usage.prompt_tokens);
            self.output_tokens = Some(usage.completion_tokens);
        }
        events
    }

    fn has_output(&self) -> bool {
        !self.content.trim().is_empty() || !self.reasoning.trim().is_empty()
    }

    fn finish(&mut self, error: Option<String>) -> ChatResult {
        ChatResult {
            content: std::mem::take(&mut self.content),
            reasoning: Some(std::mem::take(&mut self.reasoning)).filter(|r| !r.is_empty()),
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            error,
        }
    }
}

// --- OpenAI API types (internal) ---

#[derive(Debug, Serialize, Deserialize)]
struct ApiMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

/// A single SSE `data: {...}` chunk from a streaming response.
#[derive(Debug, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    /// DeepSeek and vLLM
    #[serde(default)]
    reasoning_content: Option<String>,
    /// OpenRouter
    #[serde(default)]
    reasoning: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<StreamToolCallDelta>>,
}

/// A tool call delta: arrives incrementally across chunks.
#[derive(Debug, Deserialize)]
struct StreamToolCallDelta {
    index: u32,
    #[serde(default)]
    function: Option<StreamFunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct StreamFunctionDelta {
    #[serde(default)]
    name: Option<String>,
}
