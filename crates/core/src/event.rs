//! Domain event system: how the presentation layer learns about turns.
//!
//! The controller publishes an event whenever view-relevant state changes.
//! UI components subscribe and re-render without the controller knowing them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::chat::ChatId;
use crate::message::MessageId;

/// All domain events in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DomainEvent {
    /// The active view switched to another chat
    ChatActivated {
        chat_id: ChatId,
        timestamp: DateTime<Utc>,
    },

    /// A turn was accepted and its placeholder message created
    TurnStarted {
        chat_id: ChatId,
        message_id: MessageId,
        model: String,
        timestamp: DateTime<Utc>,
    },

    /// Streamed text was appended to a message
    ReplyAppended {
        chat_id: ChatId,
        message_id: MessageId,
        content: String,
        reasoning: String,
    },

    /// The model started running a tool
    ToolRunning {
        chat_id: ChatId,
        tool_name: String,
    },

    /// A message left the active state
    TurnFinalized {
        chat_id: ChatId,
        message_id: MessageId,
        produced_output: bool,
        timestamp: DateTime<Utc>,
    },

    /// Loading flag or running tool of a chat changed
    ChatStateChanged {
        chat_id: ChatId,
        loading: bool,
        running_tool: Option<String>,
    },

    /// The message list of a chat was (re)loaded
    MessagesLoaded { chat_id: ChatId, count: usize },

    /// Loading the message list of a chat failed; the view keeps what it had
    MessagesLoadFailed { chat_id: ChatId, error: String },
}

/// A broadcast-based event bus for domain events.
///
/// Uses `tokio::sync::broadcast` for multi-consumer pub/sub.
pub struct EventBus {
    sender: broadcast::Sender<Arc<DomainEvent>>,
}

impl EventBus {
    /// Create a new event bus with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: DomainEvent) {
        // No subscribers is fine
        let _ = self.sender.send(Arc::new(event));
    }

    /// Subscribe to receive events.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<DomainEvent>> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
