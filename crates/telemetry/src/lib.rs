//! Inspection traces, usage accounting, and analytics for Colloquy.
//!
//! Provides per-chat span traces that are reset on every turn, an
//! append-only usage ledger aggregated per provider and model, and a
//! best-effort analytics sink backed by the `tracing` log.

pub mod inspector;
pub mod ledger;
pub mod model;
pub mod sink;

pub use inspector::Inspector;
pub use ledger::{UsageLedger, summarize};
pub use model::{Span, SpanKind, Trace, UsageTotals};
pub use sink::LogTelemetrySink;
