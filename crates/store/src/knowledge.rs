//! In-memory knowledge store.
//!
//! Holds collections of file chunks, the shared chunk cache, file metadata,
//! and the chat-to-collection associations. Search is keyword based: a chunk
//! scores one point per distinct query term it contains.

use async_trait::async_trait;
use colloquy_core::chat::ChatId;
use colloquy_core::error::RetrievalError;
use colloquy_core::knowledge::{
    KnowledgeChunk, KnowledgeCollection, KnowledgeFile, KnowledgeService,
};
use std::collections::HashMap;
use std::sync::RwLock;

const DEFAULT_SEARCH_LIMIT: usize = 5;

#[derive(Default)]
struct KnowledgeState {
    collections: Vec<KnowledgeCollection>,
    /// Chunks per collection id, in insertion order
    chunks: HashMap<String, Vec<KnowledgeChunk>>,
    files: HashMap<String, KnowledgeFile>,
    /// Chunks handed to the controller, keyed by chunk id
    cache: HashMap<String, KnowledgeChunk>,
    /// Collection ids attached to each chat
    associations: HashMap<ChatId, Vec<String>>,
}

pub struct InMemoryKnowledgeStore {
    state: RwLock<KnowledgeState>,
    limit: usize,
}

impl InMemoryKnowledgeStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(KnowledgeState::default()),
            limit: DEFAULT_SEARCH_LIMIT,
        }
    }

    /// Maximum number of chunks a search returns.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn add_collection(&self, collection: KnowledgeCollection) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.chunks.entry(collection.id.clone()).or_default();
        state.collections.push(collection);
    }

    /// Register a file and its chunks under a collection.
    pub fn add_file(&self, collection_id: &str, file: KnowledgeFile, chunks: Vec<KnowledgeChunk>) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.files.insert(file.id.clone(), file);
        state
            .chunks
            .entry(collection_id.to_string())
            .or_default()
            .extend(chunks);
    }

    /// Attach a collection to a chat. Attaching twice is a no-op.
    pub fn attach(&self, chat_id: &ChatId, collection_id: &str) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let ids = state.associations.entry(chat_id.clone()).or_default();
        if !ids.iter().any(|id| id == collection_id) {
            ids.push(collection_id.to_string());
        }
    }

    /// A chunk previously passed to `cache_chunks`.
    pub fn cached_chunk(&self, id: &str) -> Option<KnowledgeChunk> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.cache.get(id).cloned()
    }

    fn collections_by_id(state: &KnowledgeState, ids: &[String]) -> Vec<KnowledgeCollection> {
        state
            .collections
            .iter()
            .filter(|c| ids.contains(&c.id))
            .cloned()
            .collect()
    }
}

impl Default for InMemoryKnowledgeStore {
    fn default() -> Self {
        Self::new()
    }
}

fn query_terms(query: &str) -> Vec<String> {
    let mut terms: Vec<String> = Vec::new();
    for term in query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() > 2)
        .map(str::to_lowercase)
    {
        if !terms.contains(&term) {
            terms.push(term);
        }
    }
    terms
}

#[async_trait]
impl KnowledgeService for InMemoryKnowledgeStore {
    async fn search(
        &self,
        collection_ids: &[String],
        query: &str,
    ) -> Result<Vec<KnowledgeChunk>, RetrievalError> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        for id in collection_ids {
            if !state.chunks.contains_key(id) {
                return Err(RetrievalError::SearchFailed(format!(
                    "unknown collection: {id}"
                )));
            }
        }

        let terms = query_terms(query);
        let mut scored: Vec<(usize, KnowledgeChunk)> = collection_ids
            .iter()
            .filter_map(|id| state.chunks.get(id))
            .flatten()
            .filter_map(|chunk| {
                let content = chunk.content.to_lowercase();
                let score = terms.iter().filter(|t| content.contains(t.as_str())).count();
                (score > 0).then(|| (score, chunk.clone()))
            })
            .collect();

        // Stable sort keeps insertion order among equal scores
        scored.sort_by(|a, b| b.0.cmp(&a.0));
        scored.truncate(self.limit);
        tracing::debug!(
            collections = collection_ids.len(),
            hits = scored.len(),
            "Knowledge search"
        );
        Ok(scored.into_iter().map(|(_, chunk)| chunk).collect())
    }

    fn cache_chunks(&self, chunks: &[KnowledgeChunk]) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        for chunk in chunks {
            state.cache.insert(chunk.id.clone(), chunk.clone());
        }
    }

    async fn get_files(&self, file_ids: &[String]) -> Result<Vec<KnowledgeFile>, RetrievalError> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        let files: Vec<KnowledgeFile> = file_ids
            .iter()
            .filter_map(|id| state.files.get(id).cloned())
            .collect();
        if files.len() < file_ids.len() {
            tracing::debug!(
                requested = file_ids.len(),
                found = files.len(),
                "Skipping unknown knowledge files"
            );
        }
        Ok(files)
    }

    async fn list_chat_collections(
        &self,
        chat_id: &ChatId,
    ) -> Result<Vec<KnowledgeCollection>, RetrievalError> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        let ids = state.associations.get(chat_id).cloned().unwrap_or_default();
        Ok(Self::collections_by_id(&state, &ids))
    }

    async fn set_chat_collections(
        &self,
        chat_id: &ChatId,
        collection_ids: &[String],
    ) -> Result<(), RetrievalError> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<String> = Vec::with_capacity(collection_ids.len());
        for id in collection_ids {
            if !ids.contains(id) {
                ids.push(id.clone());
            }
        }
        state.associations.insert(chat_id.clone(), ids);
        Ok(())
    }

    async fn move_chat_collections(
        &self,
        from: &ChatId,
        to: &ChatId,
    ) -> Result<Vec<KnowledgeCollection>, RetrievalError> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let moved = state.associations.remove(from).unwrap_or_default();
        let target = state.associations.entry(to.clone()).or_default();
        for id in &moved {
            if !target.contains(id) {
                target.push(id.clone());
            }
        }
        Ok(Self::collections_by_id(&state, &moved))
    }
}
