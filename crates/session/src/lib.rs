//! The chat session controller: one prompt in, one persisted turn out.
//!
//! A turn flows through five parts:
//!
//! 1. **Resolve** the chat, promoting the temporary chat on first submit
//! 2. **Augment** the prompt with the chat's knowledge collections
//! 3. **Stream** the model call, appending deltas as they arrive
//! 4. **Finalize** the message: reply, reasoning, tokens, citations
//! 5. **Account** usage and emit best-effort analytics
//!
//! Meanwhile the scroll-follow controller keeps the view pinned to new
//! content unless the user scrolls away.

pub mod augment;
pub mod citation;
pub mod coalesce;
pub mod content;
pub mod error;
pub mod scroll;
pub mod session;
pub mod state;
pub mod token;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use augment::{Augmentation, augment, build_prompt};
pub use citation::{Citations, extract_citation_ids, resolve};
pub use coalesce::{CoalescePolicy, Coalescer};
pub use content::{normal_content, reasoning_content};
pub use error::SessionError;
pub use scroll::{ScrollChange, ScrollController, ScrollFollow};
pub use session::{ChatSession, ChatSessionBuilder, Services, TurnOutcome, TurnStatus};
pub use state::{ChatState, Folder, StateBoard, TurnPhase, ViewState};
#[cfg(feature = "tiktoken")]
pub use token::BpeCounter;
pub use token::{HeuristicCounter, TokenCounter, estimate_tokens};
