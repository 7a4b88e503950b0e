//! In-memory chat store: useful for testing and ephemeral sessions.

use async_trait::async_trait;
use chrono::Utc;
use colloquy_core::chat::{Chat, ChatId, ChatUpdate, NewChat};
use colloquy_core::error::PersistenceError;
use colloquy_core::message::{Message, MessageId, MessageQuery, MessageUpdate, NewMessage};
use colloquy_core::store::ChatStore;
use std::sync::Arc;
use tokio::sync::RwLock;

/// A chat store that keeps chats and messages in Vecs, in creation order.
pub struct InMemoryChatStore {
    chats: Arc<RwLock<Vec<Chat>>>,
    messages: Arc<RwLock<Vec<Message>>>,
}

impl InMemoryChatStore {
    pub fn new() -> Self {
        Self {
            chats: Arc::new(RwLock::new(Vec::new())),
            messages: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// All chats, oldest first.
    pub async fn chats(&self) -> Vec<Chat> {
        self.chats.read().await.clone()
    }

    /// Look up one message by id.
    pub async fn message(&self, id: &MessageId) -> Option<Message> {
        self.messages
            .read()
            .await
            .iter()
            .find(|m| &m.id == id)
            .cloned()
    }
}

impl Default for InMemoryChatStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatStore for InMemoryChatStore {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn create_chat(&self, fields: NewChat) -> Result<Chat, PersistenceError> {
        let now = Utc::now();
        let chat = Chat {
            id: ChatId::new(),
            summary: fields.summary,
            folder_id: fields.folder_id,
            created_at: now,
            updated_at: now,
        };
        self.chats.write().await.push(chat.clone());
        Ok(chat)
    }

    async fn update_chat(&self, update: ChatUpdate) -> Result<(), PersistenceError> {
        let mut chats = self.chats.write().await;
        let chat = chats
            .iter_mut()
            .find(|c| c.id == update.id)
            .ok_or_else(|| PersistenceError::ChatNotFound(update.id.to_string()))?;
        if let Some(summary) = update.summary {
            chat.summary = summary;
        }
        if let Some(folder_id) = update.folder_id {
            chat.folder_id = folder_id;
        }
        chat.updated_at = Utc::now();
        Ok(())
    }

    async fn get_chat(&self, id: &ChatId) -> Result<Option<Chat>, PersistenceError> {
        Ok(self.chats.read().await.iter().find(|c| &c.id == id).cloned())
    }

    async fn create_message(&self, fields: NewMessage) -> Result<Message, PersistenceError> {
        let message = Message::from_new(MessageId::new(), fields);
        self.messages.write().await.push(message.clone());
        Ok(message)
    }

    async fn update_message(&self, update: MessageUpdate) -> Result<(), PersistenceError> {
        let id = update
            .id
            .clone()
            .ok_or_else(|| PersistenceError::QueryFailed("message update without id".into()))?;
        let mut messages = self.messages.write().await;
        let message = messages
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or_else(|| PersistenceError::MessageNotFound(id.to_string()))?;
        update.apply_to(message);
        Ok(())
    }

    async fn fetch_messages(&self, query: MessageQuery) -> Result<Vec<Message>, PersistenceError> {
        let messages = self.messages.read().await;
        Ok(messages.iter().filter(|m| query.matches(m)).cloned().collect())
    }
}
