//! Per-stage structured event emission.
//!
//! Every fact carries a minimal envelope: `schema_version`, `ts`, `run_id`,
//! `event_id`, and a monotonic per-run `seq`, so downstream collectors can
//! order and deduplicate events without trusting wall clocks.

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{json, Value};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use uuid::Uuid;

use super::facts::FactsEmitter;

pub(crate) const SCHEMA_VERSION: i64 = 1;
const SUBSYSTEM: &str = "atomic-shell";

/// Current UTC time as RFC3339, falling back to the epoch on formatting
/// failure.
#[must_use]
pub fn now_iso() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

/// Emission context for one transaction (or one recovery pass).
pub struct AuditCtx<'a> {
    facts: &'a dyn FactsEmitter,
    run_id: String,
    seq: Cell<u64>,
}

impl<'a> AuditCtx<'a> {
    #[must_use]
    pub fn new(facts: &'a dyn FactsEmitter, run_id: String) -> Self {
        Self {
            facts,
            run_id,
            seq: Cell::new(0),
        }
    }
}

/// Pipeline stages that emit facts.
#[derive(Clone, Copy, Debug)]
pub enum Stage {
    ScriptRun,
    DiffScan,
    PlanBuild,
    ConflictCheck,
    CommitAttempt,
    CommitResult,
    Rollback,
    Recover,
}

impl Stage {
    fn as_event(self) -> &'static str {
        match self {
            Stage::ScriptRun => "script.run",
            Stage::DiffScan => "diff.scan",
            Stage::PlanBuild => "plan.build",
            Stage::ConflictCheck => "conflict.check",
            Stage::CommitAttempt => "commit.attempt",
            Stage::CommitResult => "commit.result",
            Stage::Rollback => "rollback",
            Stage::Recover => "recover",
        }
    }
}

/// Builder facade over fact emission with a centralized envelope.
pub struct StageLogger<'a> {
    ctx: &'a AuditCtx<'a>,
}

impl<'a> StageLogger<'a> {
    #[must_use]
    pub fn new(ctx: &'a AuditCtx<'a>) -> Self {
        Self { ctx }
    }

    pub fn script_run(&'a self) -> EventBuilder<'a> {
        EventBuilder::new(self.ctx, Stage::ScriptRun)
    }
    pub fn diff_scan(&'a self) -> EventBuilder<'a> {
        EventBuilder::new(self.ctx, Stage::DiffScan)
    }
    pub fn plan_build(&'a self) -> EventBuilder<'a> {
        EventBuilder::new(self.ctx, Stage::PlanBuild)
    }
    pub fn conflict_check(&'a self) -> EventBuilder<'a> {
        EventBuilder::new(self.ctx, Stage::ConflictCheck)
    }
    pub fn commit_attempt(&'a self) -> EventBuilder<'a> {
        EventBuilder::new(self.ctx, Stage::CommitAttempt)
    }
    pub fn commit_result(&'a self) -> EventBuilder<'a> {
        EventBuilder::new(self.ctx, Stage::CommitResult)
    }
    pub fn rollback(&'a self) -> EventBuilder<'a> {
        EventBuilder::new(self.ctx, Stage::Rollback)
    }
    pub fn recover(&'a self) -> EventBuilder<'a> {
        EventBuilder::new(self.ctx, Stage::Recover)
    }
}

pub struct EventBuilder<'a> {
    ctx: &'a AuditCtx<'a>,
    stage: Stage,
    fields: serde_json::Map<String, Value>,
}

impl<'a> EventBuilder<'a> {
    fn new(ctx: &'a AuditCtx<'a>, stage: Stage) -> Self {
        let mut fields = serde_json::Map::new();
        fields.insert("stage".to_string(), json!(stage.as_event()));
        Self { ctx, stage, fields }
    }

    #[must_use]
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.fields.insert("path".into(), json!(path.into()));
        self
    }

    #[must_use]
    pub fn field(mut self, key: &str, value: Value) -> Self {
        self.fields.insert(key.to_string(), value);
        self
    }

    pub fn emit(self, decision: &str) {
        let mut fields = Value::Object(self.fields);
        if let Some(obj) = fields.as_object_mut() {
            obj.entry("decision").or_insert(json!(decision));
            obj.entry("schema_version").or_insert(json!(SCHEMA_VERSION));
            obj.entry("ts").or_insert(json!(now_iso()));
            obj.entry("run_id").or_insert(json!(self.ctx.run_id));
            obj.entry("event_id").or_insert(json!(new_event_id()));
            let cur = self.ctx.seq.get();
            obj.entry("seq").or_insert(json!(cur));
            self.ctx.seq.set(cur.saturating_add(1));
        }
        self.ctx
            .facts
            .emit(SUBSYSTEM, self.stage.as_event(), decision, fields);
    }

    pub fn emit_success(self) {
        self.emit("success");
    }

    pub fn emit_failure(self) {
        self.emit("failure");
    }
}

fn new_event_id() -> String {
    // (nanos, counter) keeps ids unique even when the clock stalls.
    static NEXT: AtomicU64 = AtomicU64::new(0);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let c = NEXT.fetch_add(1, Ordering::Relaxed);
    let name = format!("{nanos}:{c}:event");
    Uuid::new_v5(&Uuid::NAMESPACE_URL, name.as_bytes()).to_string()
}
