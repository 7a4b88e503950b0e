//! Token accounting.
//!
//! Used only when the invocation result does not carry its own counts.
//! The default counter uses a character heuristic (~4 bytes per token);
//! the `tiktoken` feature adds a BPE counter for OpenAI-family models.

/// Per-message overhead for role name and delimiters in the wire format.
const MESSAGE_OVERHEAD: u32 = 4;

pub trait TokenCounter: Send + Sync {
    /// Tokens consumed by a user prompt sent as one message.
    fn count_input(&self, text: &str) -> u32;

    /// Tokens produced in a reply.
    fn count_output(&self, text: &str) -> u32;
}

/// Estimate the token count for a string. Rounds up, 0 for empty text.
pub fn estimate_tokens(text: &str) -> u32 {
    if text.is_empty() {
        return 0;
    }
    u32::try_from(text.len().div_ceil(4)).unwrap_or(u32::MAX)
}

/// Deterministic character-based counter.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicCounter;

impl TokenCounter for HeuristicCounter {
    fn count_input(&self, text: &str) -> u32 {
        match estimate_tokens(text) {
            0 => 0,
            n => n.saturating_add(MESSAGE_OVERHEAD),
        }
    }

    fn count_output(&self, text: &str) -> u32 {
        estimate_tokens(text)
    }
}

#[cfg(feature = "tiktoken")]
pub use bpe::BpeCounter;

#[cfg(feature = "tiktoken")]
mod bpe {
    use super::{MESSAGE_OVERHEAD, TokenCounter};
    use tiktoken_rs::CoreBPE;

    /// Exact counter backed by a tiktoken encoding.
    pub struct BpeCounter {
        bpe: CoreBPE,
    }

    impl BpeCounter {
        /// Encoding for a model name, falling back to `cl100k_base`.
        pub fn for_model(model: &str) -> Option<Self> {
            tiktoken_rs::get_bpe_from_model(model)
                .or_else(|_| tiktoken_rs::cl100k_base())
                .ok()
                .map(|bpe| Self { bpe })
        }

        fn count(&self, text: &str) -> u32 {
            if text.is_empty() {
                return 0;
            }
            let n = self.bpe.encode_with_special_tokens(text).len();
            u32::try_from(n).unwrap_or(u32::MAX)
        }
    }

    impl TokenCounter for BpeCounter {
        fn count_input(&self, text: &str) -> u32 {
            match self.count(text) {
                0 => 0,
                n => n.saturating_add(MESSAGE_OVERHEAD),
            }
        }

        fn count_output(&self, text: &str) -> u32 {
            self.count(text)
        }
    }
}
