//! Emitter traits for structured facts and leveled audit lines.

use log::Level;
use serde_json::Value;

/// Receives one structured JSON fact per pipeline event.
pub trait FactsEmitter {
    fn emit(&self, subsystem: &str, event: &str, decision: &str, fields: Value);
}

/// Receives human-readable audit lines.
pub trait AuditSink {
    fn log(&self, level: Level, msg: &str);
}

/// No-op sink, the default for library embedding and tests that only assert
/// on behavior.
#[derive(Default, Debug, Copy, Clone)]
pub struct JsonlSink;

impl FactsEmitter for JsonlSink {
    fn emit(&self, _subsystem: &str, _event: &str, _decision: &str, _fields: Value) {}
}

impl AuditSink for JsonlSink {
    fn log(&self, _level: Level, _msg: &str) {}
}

/// Audit sink for the CLI: leveled lines on stderr.
#[derive(Default, Debug, Copy, Clone)]
pub struct StderrAudit;

impl AuditSink for StderrAudit {
    fn log(&self, level: Level, msg: &str) {
        eprintln!("[{level}] {msg}");
    }
}
