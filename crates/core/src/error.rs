//! Error types for the Colloquy domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each collaborator boundary has its own error enum.

use thiserror::Error;

/// The top-level error type for all Colloquy operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Persistence errors ---
    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    // --- Model invocation errors ---
    #[error("Invocation error: {0}")]
    Invocation(#[from] InvocationError),

    // --- Knowledge retrieval errors ---
    #[error("Retrieval error: {0}")]
    Retrieval(#[from] RetrievalError),

    // --- Telemetry errors ---
    #[error("Telemetry error: {0}")]
    Telemetry(#[from] TelemetryError),

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Boundary errors ---

#[derive(Debug, Clone, Error)]
pub enum PersistenceError {
    #[error("Chat not found: {0}")]
    ChatNotFound(String),

    #[error("Message not found: {0}")]
    MessageNotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),
}

#[derive(Debug, Clone, Error)]
pub enum InvocationError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError { status_code: u16, message: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("Service not ready: {0}")]
    NotReady(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Aborted by user")]
    Aborted,
}

impl InvocationError {
    /// Whether this error was caused by a user-initiated abort.
    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted)
    }
}

#[derive(Debug, Clone, Error)]
pub enum RetrievalError {
    #[error("Knowledge search failed: {0}")]
    SearchFailed(String),

    #[error("Malformed chunk payload: {0}")]
    MalformedPayload(String),

    #[error("File lookup failed: {0}")]
    FileLookup(String),
}

#[derive(Debug, Clone, Error)]
pub enum TelemetryError {
    #[error("Telemetry sink unavailable: {0}")]
    Unavailable(String),

    #[error("Event rejected: {0}")]
    Rejected(String),
}
