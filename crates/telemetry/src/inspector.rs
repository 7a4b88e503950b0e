//! Per-chat inspection traces.
//!
//! Each chat has at most one trace. Traces are per-turn: the orchestrator
//! clears a chat's trace before starting a new turn.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::model::{Span, Trace};

/// Thread-safe store of the latest trace of every chat.
#[derive(Default)]
pub struct Inspector {
    traces: RwLock<HashMap<String, Trace>>,
}

impl Inspector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop the trace of a chat.
    pub fn clear_trace(&self, chat_id: &str) {
        let mut traces = self.traces.write().unwrap_or_else(|e| e.into_inner());
        if traces.remove(chat_id).is_some() {
            tracing::debug!(chat_id, "Cleared inspection trace");
        }
    }

    /// Record a finished span, creating the chat's trace on first use.
    pub fn record_span(&self, chat_id: &str, span: Span) {
        let mut traces = self.traces.write().unwrap_or_else(|e| e.into_inner());
        traces
            .entry(chat_id.to_string())
            .or_insert_with(|| Trace::new(chat_id))
            .add_span(span);
    }

    /// Snapshot of a chat's current trace.
    pub fn trace(&self, chat_id: &str) -> Option<Trace> {
        let traces = self.traces.read().unwrap_or_else(|e| e.into_inner());
        traces.get(chat_id).cloned()
    }

    /// Number of chats with a live trace.
    pub fn trace_count(&self) -> usize {
        self.traces.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}
