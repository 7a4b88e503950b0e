//! Message (turn) domain types.
//!
//! One `Message` holds one user prompt and the model reply to it.
//! The flow: user submits a prompt → a placeholder message is created with
//! `is_active = true` → streamed deltas are appended → the message is
//! finalized with `is_active = false` exactly once.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::chat::ChatId;

/// Unique identifier for a message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A knowledge chunk the reply actually cited, renumbered for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CitedChunk {
    /// 1-based position among the cited chunks
    #[serde(rename = "seqNo")]
    pub seq_no: usize,
    pub content: String,
    pub id: String,
}

/// A single turn: the prompt and the model's reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub chat_id: ChatId,

    /// Raw user text
    pub prompt: String,

    /// Normal-form model output
    pub reply: String,

    /// Secondary output channel (chain-of-thought)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u32>,

    /// Set while the turn is streaming and not yet finalized
    pub is_active: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cited_files: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cited_chunks: Vec<CitedChunk>,

    pub model: String,
    pub temperature: f32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Build a message row from creation fields.
    pub fn from_new(id: MessageId, fields: NewMessage) -> Self {
        Self {
            id,
            chat_id: fields.chat_id,
            prompt: fields.prompt,
            reply: fields.reply,
            reasoning: None,
            input_tokens: None,
            output_tokens: None,
            is_active: fields.is_active,
            cited_files: Vec::new(),
            cited_chunks: Vec::new(),
            model: fields.model,
            temperature: fields.temperature,
            max_tokens: fields.max_tokens,
            created_at: Utc::now(),
        }
    }

    /// Append a streamed delta. Deltas are applied in delivery order.
    pub fn append(&mut self, content: &str, reasoning: &str) {
        self.reply.push_str(content);
        if !reasoning.is_empty() {
            self.reasoning
                .get_or_insert_with(String::new)
                .push_str(reasoning);
        }
    }
}

/// Fields for creating a message row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMessage {
    pub chat_id: ChatId,
    pub prompt: String,
    pub reply: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    pub is_active: bool,
}

/// Partial update of a message. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageUpdate {
    pub id: Option<MessageId>,
    pub reply: Option<String>,
    pub reasoning: Option<String>,
    pub input_tokens: Option<u32>,
    pub output_tokens: Option<u32>,
    pub is_active: Option<bool>,
    pub cited_files: Option<Vec<String>>,
    pub cited_chunks: Option<Vec<CitedChunk>>,
}

impl MessageUpdate {
    /// An update that only clears the active flag.
    pub fn deactivate(id: MessageId) -> Self {
        Self {
            id: Some(id),
            is_active: Some(false),
            ..Self::default()
        }
    }

    /// Apply the set fields onto a message.
    pub fn apply_to(&self, message: &mut Message) {
        if let Some(reply) = &self.reply {
            message.reply = reply.clone();
        }
        if let Some(reasoning) = &self.reasoning {
            message.reasoning = Some(reasoning.clone());
        }
        if let Some(tokens) = self.input_tokens {
            message.input_tokens = Some(tokens);
        }
        if let Some(tokens) = self.output_tokens {
            message.output_tokens = Some(tokens);
        }
        if let Some(active) = self.is_active {
            message.is_active = active;
        }
        if let Some(files) = &self.cited_files {
            message.cited_files = files.clone();
        }
        if let Some(chunks) = &self.cited_chunks {
            message.cited_chunks = chunks.clone();
        }
    }
}

/// Query for listing the messages of a chat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageQuery {
    pub chat_id: ChatId,

    /// Case-insensitive filter over prompt and reply; empty means no filter
    #[serde(default)]
    pub keyword: String,
}

impl MessageQuery {
    pub fn new(chat_id: ChatId, keyword: impl Into<String>) -> Self {
        Self {
            chat_id,
            keyword: keyword.into(),
        }
    }

    pub fn matches(&self, message: &Message) -> bool {
        if message.chat_id != self.chat_id {
            return false;
        }
        let keyword = self.keyword.trim().to_lowercase();
        keyword.is_empty()
            || message.prompt.to_lowercase().contains(&keyword)
            || message.reply.to_lowercase().contains(&keyword)
    }
}
