//! Errors returned by the session controller.

use colloquy_core::ChatId;
use colloquy_core::error::{Error, InvocationError, PersistenceError, RetrievalError};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The chat already has a turn that is submitting or streaming.
    #[error("a turn is already in progress for chat {chat_id}")]
    TurnInProgress { chat_id: ChatId },

    /// The model-invocation service is not configured.
    #[error("chat service is not ready")]
    ServiceNotReady,

    #[error(transparent)]
    Core(#[from] Error),
}

impl From<PersistenceError> for SessionError {
    fn from(e: PersistenceError) -> Self {
        Self::Core(e.into())
    }
}

impl From<RetrievalError> for SessionError {
    fn from(e: RetrievalError) -> Self {
        Self::Core(e.into())
    }
}

impl From<InvocationError> for SessionError {
    fn from(e: InvocationError) -> Self {
        Self::Core(e.into())
    }
}
