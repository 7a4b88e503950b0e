//! Log-backed analytics sink.

use std::collections::VecDeque;
use std::sync::Mutex;

use colloquy_core::error::TelemetryError;
use colloquy_core::usage::{TelemetryEvent, TelemetrySink};

const MAX_BUFFERED_BATCHES: usize = 256;

/// Writes analytics batches to the `tracing` log and keeps the most recent
/// ones in memory. A disabled sink accepts and drops everything.
pub struct LogTelemetrySink {
    enabled: bool,
    recent: Mutex<VecDeque<Vec<TelemetryEvent>>>,
}

impl LogTelemetrySink {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            recent: Mutex::new(VecDeque::new()),
        }
    }

    /// Most recent batches, oldest first.
    pub fn recent(&self) -> Vec<Vec<TelemetryEvent>> {
        self.recent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }
}

impl TelemetrySink for LogTelemetrySink {
    fn ingest_event(&self, events: Vec<TelemetryEvent>) -> Result<(), TelemetryError> {
        if !self.enabled {
            return Ok(());
        }
        if events.is_empty() {
            return Err(TelemetryError::Rejected("empty event batch".into()));
        }

        let rendered = events
            .iter()
            .map(|e| format!("{}={}", e.key, e.value))
            .collect::<Vec<_>>()
            .join(" ");
        tracing::info!(target: "colloquy::analytics", events = %rendered, "Analytics event");

        let mut recent = self.recent.lock().unwrap_or_else(|e| e.into_inner());
        if recent.len() == MAX_BUFFERED_BATCHES {
            recent.pop_front();
        }
        recent.push_back(events);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat_event(model: &str) -> Vec<TelemetryEvent> {
        vec![
            TelemetryEvent::new("app", "chat"),
            TelemetryEvent::new("model", model),
        ]
    }

    #[test]
    fn enabled_sink_buffers_batches() {
        let sink = LogTelemetrySink::new(true);
        sink.ingest_event(chat_event("gpt-4o")).unwrap();
        let recent = sink.recent();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0][1].value, "gpt-4o");
    }

    #[test]
    fn disabled_sink_drops_silently() {
        let sink = LogTelemetrySink::new(false);
        assert!(sink.ingest_event(chat_event("gpt-4o")).is_ok());
        assert!(sink.recent().is_empty());
    }

    #[test]
    fn empty_batch_rejected() {
        let sink = LogTelemetrySink::new(true);
        assert!(matches!(
            sink.ingest_event(Vec::new()),
            Err(TelemetryError::Rejected(_))
        ));
    }

    #[test]
    fn buffer_is_bounded() {
        let sink = LogTelemetrySink::new(true);
        for i in 0..(MAX_BUFFERED_BATCHES + 5) {
            sink.ingest_event(chat_event(&format!("m{i}"))).unwrap();
        }
        let recent = sink.recent();
        assert_eq!(recent.len(), MAX_BUFFERED_BATCHES);
        assert_eq!(recent[0][1].value, "m5");
    }
}
