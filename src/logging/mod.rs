//! Structured facts and human-readable audit output.

pub mod audit;
pub mod facts;

pub use audit::{now_iso, AuditCtx, StageLogger};
pub use facts::{AuditSink, FactsEmitter, JsonlSink, StderrAudit};
