//! Persistence and knowledge store implementations for Colloquy.

pub mod in_memory;
pub mod knowledge;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use in_memory::InMemoryChatStore;
pub use knowledge::InMemoryKnowledgeStore;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteChatStore;
