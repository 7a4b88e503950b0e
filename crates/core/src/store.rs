//! Persistence trait: chat and message CRUD.
//!
//! The controller never touches storage directly; it calls a `ChatStore`.
//! Implementations: in-memory (for testing), SQLite.

use async_trait::async_trait;

use crate::chat::{Chat, ChatId, ChatUpdate, NewChat};
use crate::error::PersistenceError;
use crate::message::{Message, MessageQuery, MessageUpdate, NewMessage};

#[async_trait]
pub trait ChatStore: Send + Sync {
    /// The backend name (e.g., "sqlite", "in_memory").
    fn name(&self) -> &str;

    async fn create_chat(&self, fields: NewChat) -> Result<Chat, PersistenceError>;

    async fn update_chat(&self, update: ChatUpdate) -> Result<(), PersistenceError>;

    async fn get_chat(&self, id: &ChatId) -> Result<Option<Chat>, PersistenceError>;

    async fn create_message(&self, fields: NewMessage) -> Result<Message, PersistenceError>;

    /// Apply a partial update. The update must carry a message id.
    async fn update_message(&self, update: MessageUpdate) -> Result<(), PersistenceError>;

    /// Messages of one chat, oldest first, filtered by the query keyword.
    async fn fetch_messages(&self, query: MessageQuery) -> Result<Vec<Message>, PersistenceError>;
}
