//! Model-invocation services for Colloquy.
//!
//! All services implement the `colloquy_core::ChatService` trait.
//! `OpenAiCompatChatService::from_config` picks the endpoint from configuration.

pub mod openai_compat;

pub use openai_compat::OpenAiCompatChatService;
