//! Per-chat turn state and the state of the current view.

use std::collections::{HashMap, HashSet};

use colloquy_core::chat::ChatId;
use colloquy_core::message::Message;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::SessionError;

/// Where a chat is in its turn lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnPhase {
    #[default]
    Idle,
    /// Chat resolution, message creation and retrieval
    Submitting,
    /// The model call is running
    Streaming,
}

/// Transient UI state of one chat.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatState {
    pub loading: bool,
    pub running_tool: Option<String>,
    pub phase: TurnPhase,
}

/// Turn state of every chat that has had a turn.
#[derive(Debug, Default)]
pub struct StateBoard {
    chats: HashMap<ChatId, ChatState>,
    /// Cancellation of the turn each busy chat is running
    cancels: HashMap<ChatId, CancellationToken>,
}

impl StateBoard {
    pub fn get(&self, chat_id: &ChatId) -> ChatState {
        self.chats.get(chat_id).cloned().unwrap_or_default()
    }

    /// Claim a chat for a new turn. Fails unless the chat is idle.
    ///
    /// Returns the token that cancels this turn and no other.
    pub fn begin(&mut self, chat_id: &ChatId) -> Result<CancellationToken, SessionError> {
        let state = self.chats.entry(chat_id.clone()).or_default();
        if state.phase != TurnPhase::Idle {
            return Err(SessionError::TurnInProgress {
                chat_id: chat_id.clone(),
            });
        }
        state.phase = TurnPhase::Submitting;
        let token = CancellationToken::new();
        self.cancels.insert(chat_id.clone(), token.clone());
        Ok(token)
    }

    /// Move the claim of a promoted temporary chat to its persisted id.
    pub fn transfer(&mut self, from: &ChatId, to: &ChatId) {
        let state = self.chats.remove(from).unwrap_or_default();
        self.chats.insert(to.clone(), state);
        if let Some(token) = self.cancels.remove(from) {
            self.cancels.insert(to.clone(), token);
        }
    }

    /// Cancel the turn a chat is running. Returns false for an idle chat.
    pub fn cancel(&mut self, chat_id: &ChatId) -> bool {
        match self.cancels.get(chat_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn set_phase(&mut self, chat_id: &ChatId, phase: TurnPhase) {
        self.chats.entry(chat_id.clone()).or_default().phase = phase;
    }

    pub fn set_loading(&mut self, chat_id: &ChatId, loading: bool) -> ChatState {
        let state = self.chats.entry(chat_id.clone()).or_default();
        state.loading = loading;
        state.clone()
    }

    pub fn set_running_tool(&mut self, chat_id: &ChatId, tool: Option<String>) -> ChatState {
        let state = self.chats.entry(chat_id.clone()).or_default();
        state.running_tool = tool;
        state.clone()
    }

    /// End a turn: not loading, no tool, idle.
    pub fn finish(&mut self, chat_id: &ChatId) -> ChatState {
        self.cancels.remove(chat_id);
        let state = self.chats.entry(chat_id.clone()).or_default();
        *state = ChatState::default();
        state.clone()
    }
}

/// A folder groups chats and carries settings for new chats created in it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Folder {
    pub id: String,
    pub name: String,
    /// Knowledge collections a new chat in this folder starts with
    #[serde(default)]
    pub collection_ids: Vec<String>,
}

/// What the user is looking at.
#[derive(Debug, Clone)]
pub struct ViewState {
    pub active_chat: ChatId,
    /// Folder selected in the sidebar
    pub folder: Option<Folder>,
    pub open_folders: HashSet<String>,
    /// Search keyword per chat
    pub keywords: HashMap<ChatId, String>,
    /// Messages of the active chat, as last loaded
    pub messages: Vec<Message>,
    /// Message to reveal once the active chat's messages load
    pub anchor: Option<String>,
}

impl ViewState {
    pub fn keyword(&self, chat_id: &ChatId) -> String {
        self.keywords.get(chat_id).cloned().unwrap_or_default()
    }

    pub fn is_active(&self, chat_id: &ChatId) -> bool {
        &self.active_chat == chat_id
    }
}

impl Default for ViewState {
    fn default() -> Self {
        Self {
            active_chat: ChatId::temporary(),
            folder: None,
            open_folders: HashSet::new(),
            keywords: HashMap::new(),
            messages: Vec::new(),
            anchor: None,
        }
    }
}
