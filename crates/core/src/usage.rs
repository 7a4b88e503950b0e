//! Usage records and analytics events.
//!
//! A `UsageRecord` is written once per completed turn to an append-only sink.
//! Analytics events are best-effort: a failing sink never affects a turn.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{PersistenceError, TelemetryError};

/// Token usage of one completed turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub provider: String,
    pub model: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub recorded_at: DateTime<Utc>,
}

impl UsageRecord {
    pub fn new(
        provider: impl Into<String>,
        model: impl Into<String>,
        input_tokens: u32,
        output_tokens: u32,
    ) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            input_tokens,
            output_tokens,
            recorded_at: Utc::now(),
        }
    }

    pub fn total_tokens(&self) -> u32 {
        self.input_tokens.saturating_add(self.output_tokens)
    }
}

/// Append-only destination for usage records.
#[async_trait::async_trait]
pub trait UsageSink: Send + Sync {
    async fn create(&self, record: UsageRecord) -> Result<(), PersistenceError>;
}

/// A single analytics attribute, e.g. `{"app": "chat"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub key: String,
    pub value: String,
}

impl TelemetryEvent {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Fire-and-forget analytics destination. Implementations must not block.
pub trait TelemetrySink: Send + Sync {
    fn ingest_event(&self, events: Vec<TelemetryEvent>) -> Result<(), TelemetryError>;
}
