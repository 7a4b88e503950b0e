//! # Colloquy Core
//!
//! Domain types, collaborator traits, and error definitions for the Colloquy
//! chat client. This crate has **no UI or storage dependencies**: it defines
//! the model every other crate implements against.
//!
//! ## Design Philosophy
//!
//! Every collaborator of the chat controller (persistence, model invocation,
//! knowledge retrieval, usage, analytics, presentation) is a trait here.
//! Implementations live in their own crates and are injected explicitly.

pub mod chat;
pub mod error;
pub mod event;
pub mod invocation;
pub mod knowledge;
pub mod message;
pub mod presentation;
pub mod store;
pub mod usage;

// Re-export key types at crate root for ergonomics
pub use chat::{Chat, ChatId, ChatUpdate, NewChat, TEMP_CHAT_ID};
pub use error::{Error, Result};
pub use event::{DomainEvent, EventBus};
pub use invocation::{
    ChatMessage, ChatResult, ChatService, EventSender, InvocationContext, Role, StreamEvent,
};
pub use knowledge::{KnowledgeChunk, KnowledgeCollection, KnowledgeFile, KnowledgeService};
pub use message::{CitedChunk, Message, MessageId, MessageQuery, MessageUpdate, NewMessage};
pub use presentation::{Notifier, ScrollMetrics, Viewport};
pub use store::ChatStore;
pub use usage::{TelemetryEvent, TelemetrySink, UsageRecord, UsageSink};
