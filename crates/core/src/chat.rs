//! Chat domain types.
//!
//! A chat is one conversation. Before the first submission it exists only as
//! the temporary chat, identified by a reserved sentinel id, and is promoted
//! to a persisted chat exactly once.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Sentinel id reserved for the unsaved, transient chat.
pub const TEMP_CHAT_ID: &str = "temp";

/// Unique identifier for a chat.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChatId(pub String);

impl ChatId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from(s: &str) -> Self {
        Self(s.to_string())
    }

    /// The temporary chat sentinel.
    pub fn temporary() -> Self {
        Self(TEMP_CHAT_ID.to_string())
    }

    pub fn is_temporary(&self) -> bool {
        self.0 == TEMP_CHAT_ID
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ChatId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ChatId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A persisted conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chat {
    pub id: ChatId,

    /// Short label derived from the latest prompt
    pub summary: String,

    /// Folder the chat lives in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder_id: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields for creating a chat.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewChat {
    pub summary: String,
    #[serde(default)]
    pub folder_id: Option<String>,
}

/// Partial update of a chat. `None` leaves a field unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatUpdate {
    pub id: ChatId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder_id: Option<Option<String>>,
}

impl ChatUpdate {
    pub fn summary(id: ChatId, summary: impl Into<String>) -> Self {
        Self {
            id,
            summary: Some(summary.into()),
            folder_id: None,
        }
    }
}

/// Take at most `max_chars` characters of a prompt as a chat summary.
///
/// Counts `char`s rather than bytes so multi-byte text never splits a code point.
pub fn summarize(prompt: &str, max_chars: usize) -> String {
    prompt.chars().take(max_chars).collect()
}
