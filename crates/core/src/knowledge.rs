//! Knowledge trait: semantic search over document collections.
//!
//! Chunks and files are owned by the knowledge subsystem and cached there by
//! id; the controller only reads them. Chats reference collections through
//! associations that also live in the knowledge subsystem.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::chat::ChatId;
use crate::error::RetrievalError;

/// A retrieved passage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeChunk {
    pub id: String,
    pub file_id: String,
    pub content: String,
}

/// Metadata for a chunk's source document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnowledgeFile {
    pub id: String,
    pub name: String,
}

/// A named group of documents that can be attached to a chat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnowledgeCollection {
    pub id: String,
    pub name: String,
}

#[async_trait]
pub trait KnowledgeService: Send + Sync {
    /// Chunks relevant to `query`, most relevant first.
    async fn search(
        &self,
        collection_ids: &[String],
        query: &str,
    ) -> Result<Vec<KnowledgeChunk>, RetrievalError>;

    /// Remember chunks by id so citation views can show them later.
    fn cache_chunks(&self, chunks: &[KnowledgeChunk]);

    /// Resolve file metadata. Unknown ids are left out of the result; only a
    /// failing backend fails the lookup.
    async fn get_files(&self, file_ids: &[String]) -> Result<Vec<KnowledgeFile>, RetrievalError>;

    /// Collections attached to a chat.
    async fn list_chat_collections(
        &self,
        chat_id: &ChatId,
    ) -> Result<Vec<KnowledgeCollection>, RetrievalError>;

    /// Replace the collections attached to a chat.
    async fn set_chat_collections(
        &self,
        chat_id: &ChatId,
        collection_ids: &[String],
    ) -> Result<(), RetrievalError>;

    /// Atomically re-point every association of `from` to `to`, leaving
    /// `from` with none. Returns the moved collections.
    async fn move_chat_collections(
        &self,
        from: &ChatId,
        to: &ChatId,
    ) -> Result<Vec<KnowledgeCollection>, RetrievalError>;
}
