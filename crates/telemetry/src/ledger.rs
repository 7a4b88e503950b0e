//! Append-only usage ledger with per-model aggregation.

use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;
use colloquy_core::error::PersistenceError;
use colloquy_core::usage::{UsageRecord, UsageSink};

use crate::model::UsageTotals;

/// In-process usage sink. Records are never modified once written.
#[derive(Default)]
pub struct UsageLedger {
    records: RwLock<Vec<UsageRecord>>,
}

impl UsageLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// All records in write order.
    pub fn records(&self) -> Vec<UsageRecord> {
        self.records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Totals per (provider, model), sorted by provider then model.
    pub fn totals(&self) -> Vec<UsageTotals> {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        summarize(&records)
    }
}

#[async_trait]
impl UsageSink for UsageLedger {
    async fn create(&self, record: UsageRecord) -> Result<(), PersistenceError> {
        tracing::debug!(
            provider = %record.provider,
            model = %record.model,
            input_tokens = record.input_tokens,
            output_tokens = record.output_tokens,
            "Usage recorded"
        );
        self.records
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(record);
        Ok(())
    }
}

/// Fold usage records into totals per (provider, model).
pub fn summarize(records: &[UsageRecord]) -> Vec<UsageTotals> {
    let mut by_model: BTreeMap<(String, String), UsageTotals> = BTreeMap::new();
    for record in records {
        let entry = by_model
            .entry((record.provider.clone(), record.model.clone()))
            .or_insert_with(|| UsageTotals {
                provider: record.provider.clone(),
                model: record.model.clone(),
                ..UsageTotals::default()
            });
        entry.turns += 1;
        entry.input_tokens += u64::from(record.input_tokens);
        entry.output_tokens += u64::from(record.output_tokens);
    }
    by_model.into_values().collect()
}
