//! The per-transaction pipeline.
//!
//! `run` drives one transaction end to end: preflight → recovery → lock →
//! staged script execution → diff scan → sequencing → baselines → conflict
//! check → journaled commit → cleanup. The engine is single-transaction:
//! a second concurrent run is refused with a busy signal, and recovery runs
//! exclusively before any transaction is accepted.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use log::Level;
use serde_json::json;

use crate::adapters::lock::{FileLockManager, LockManager};
use crate::commit::{finalize, CommitEngine};
use crate::conflict;
use crate::constants::{
    DEFAULT_JOURNAL_DIR, DEFAULT_STATE_DIR, DEFAULT_WORK_DIR, LOCK_FILE_NAME,
};
use crate::diff;
use crate::journal::{Journal, State};
use crate::logging::{AuditCtx, AuditSink, FactsEmitter, StageLogger};
use crate::overlay::{self, RunConfig};
use crate::plan;
use crate::preflight;
use crate::recover;
use crate::types::errors::{EngineError, Result};
use crate::types::Operation;

/// One transaction request.
pub struct RunRequest {
    pub script_path: PathBuf,
    pub script_args: Vec<String>,
    /// Working directory for the script; defaults to the script's parent.
    pub cwd: PathBuf,
    pub run_as_uid: u32,
    pub run_as_gid: u32,
    pub keep_artifacts: bool,
    /// Overrides the generated `<unix-nanos>-<pid>` id; tests use this.
    pub run_id: Option<String>,
    pub stdout: Option<Stdio>,
    pub stderr: Option<Stdio>,
    pub stdin: Option<Stdio>,
}

impl RunRequest {
    #[must_use]
    pub fn new(script_path: PathBuf) -> Self {
        Self {
            script_path,
            script_args: Vec::new(),
            cwd: PathBuf::new(),
            run_as_uid: 0,
            run_as_gid: 0,
            keep_artifacts: false,
            run_id: None,
            stdout: None,
            stderr: None,
            stdin: None,
        }
    }
}

/// Outcome of a committed transaction.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: String,
    pub ops_applied: usize,
}

/// Transaction engine wired to a facts emitter and an audit sink.
pub struct Engine<E: FactsEmitter, A: AuditSink> {
    facts: E,
    audit: A,
    state_dir: PathBuf,
    work_dir: PathBuf,
    journal_dir: PathBuf,
    root_prefix: PathBuf,
    lock: Option<Box<dyn LockManager>>,
}

impl<E: FactsEmitter, A: AuditSink> Engine<E, A> {
    pub fn new(facts: E, audit: A) -> Self {
        Self {
            facts,
            audit,
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
            work_dir: PathBuf::from(DEFAULT_WORK_DIR),
            journal_dir: PathBuf::from(DEFAULT_JOURNAL_DIR),
            root_prefix: PathBuf::new(),
            lock: None,
        }
    }

    #[must_use]
    pub fn with_state_dir(mut self, dir: PathBuf) -> Self {
        self.state_dir = dir;
        self
    }

    #[must_use]
    pub fn with_work_dir(mut self, dir: PathBuf) -> Self {
        self.work_dir = dir;
        self
    }

    #[must_use]
    pub fn with_journal_dir(mut self, dir: PathBuf) -> Self {
        self.journal_dir = dir;
        self
    }

    /// Rewrite `/` for every commit-phase target; test-only in production
    /// deployments, where the prefix stays empty.
    #[must_use]
    pub fn with_root_prefix(mut self, prefix: PathBuf) -> Self {
        self.root_prefix = prefix;
        self
    }

    #[must_use]
    pub fn with_lock_manager(mut self, lock: Box<dyn LockManager>) -> Self {
        self.lock = Some(lock);
        self
    }

    /// Run startup recovery without accepting a transaction.
    pub fn recover(&self) -> Result<()> {
        preflight::check()?;
        let ctx = AuditCtx::new(&self.facts, "recover".to_string());
        let slog = StageLogger::new(&ctx);
        match recover::run(&self.journal_dir, &self.root_prefix) {
            Ok(outcomes) => {
                slog.recover()
                    .field("journals", json!(outcomes.len()))
                    .emit_success();
                Ok(())
            }
            Err(e) => {
                slog.recover().field("error", json!(e.to_string())).emit_failure();
                Err(e)
            }
        }
    }

    /// Execute one transaction. Success means every staged mutation is
    /// durably visible; any error means the live filesystem is unchanged
    /// (subject to the rollback-failure caveat of the commit engine).
    pub fn run(&self, req: RunRequest) -> Result<RunReport> {
        preflight::check()?;
        recover::run(&self.journal_dir, &self.root_prefix)?;

        let default_lock;
        let lock: &dyn LockManager = match &self.lock {
            Some(l) => l.as_ref(),
            None => {
                default_lock = FileLockManager::new(self.state_dir.join(LOCK_FILE_NAME));
                &default_lock
            }
        };
        let _guard = lock.try_acquire()?;

        let run_id = req.run_id.clone().unwrap_or_else(new_run_id);
        let ctx = AuditCtx::new(&self.facts, run_id.clone());
        let slog = StageLogger::new(&ctx);

        if req.script_path.as_os_str().is_empty() {
            return Err(EngineError::Unsupported("script path is required".to_string()));
        }
        let cwd = if req.cwd.as_os_str().is_empty() {
            req.script_path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("/"))
        } else {
            req.cwd.clone()
        };

        // The single reference time for conflict detection; fixed before
        // the script is launched.
        let txn_start = time::OffsetDateTime::now_utc();

        self.audit.log(Level::Info, &format!("run {run_id}: staging script"));
        let res = overlay::run_script(RunConfig {
            run_id: run_id.clone(),
            work_root: self.work_dir.clone(),
            script_path: req.script_path,
            script_args: req.script_args,
            cwd,
            run_as_uid: req.run_as_uid,
            run_as_gid: req.run_as_gid,
            stdout: req.stdout,
            stderr: req.stderr,
            stdin: req.stdin,
        })?;

        if res.exit_code != 0 {
            slog.script_run()
                .field("exit_code", json!(res.exit_code))
                .emit_failure();
            self.audit
                .log(Level::Warn, &format!("run {run_id}: script failed, discarding staging"));
            if !req.keep_artifacts {
                let _ = crate::fs::remove_all(&res.run_dir);
            }
            return Err(EngineError::ScriptFailed { code: res.exit_code });
        }
        slog.script_run().field("exit_code", json!(0)).emit_success();

        let mut ops: Vec<Operation> = Vec::new();
        for mount in &res.upper_dirs {
            let scanned = diff::scan_upper_dir(&mount.upper_dir, &mount.mount_point)
                .map_err(|e| EngineError::Scan(format!("scan {}: {e}", mount.upper_dir.display())))?;
            ops.extend(scanned);
        }
        slog.diff_scan().field("ops", json!(ops.len())).emit_success();

        let ops = plan::sequence(ops);
        slog.plan_build().field("ops", json!(ops.len())).emit_success();

        let ops = conflict::attach_baselines(ops)?;
        if let Err(e) = conflict::check(&ops, txn_start.unix_timestamp_nanos()) {
            if let EngineError::Conflict { path } = &e {
                slog.conflict_check().path(path.clone()).emit_failure();
            }
            self.audit
                .log(Level::Warn, &format!("run {run_id}: conflict, refusing to commit"));
            return Err(e);
        }
        slog.conflict_check().emit_success();

        let backup_dir = self.state_dir.join("backups").join(&run_id);
        let mut journal = Journal {
            run_id: run_id.clone(),
            state: State::Committing,
            ops,
            applied_index: -1,
            backup_refs: Default::default(),
            txn_start,
            run_dir: res.run_dir.clone(),
            backup_dir,
            keep_artifacts: req.keep_artifacts,
        };
        let journal_path = Journal::file_path(&self.journal_dir, &run_id);

        slog.commit_attempt().field("ops", json!(journal.ops.len())).emit_success();
        let engine = CommitEngine::new(self.root_prefix.clone());
        match engine.apply(&journal_path, &mut journal) {
            Ok(()) => {}
            Err(e) => {
                slog.commit_result().field("error", json!(e.to_string())).emit_failure();
                if matches!(journal.state, State::RolledBack) {
                    slog.rollback().emit_success();
                    finalize(&journal_path, &journal)?;
                } else {
                    slog.rollback().emit_failure();
                }
                return Err(e);
            }
        }
        slog.commit_result().field("ops", json!(journal.ops.len())).emit_success();

        finalize(&journal_path, &journal)?;
        self.audit.log(Level::Info, &format!("run {run_id}: committed"));
        Ok(RunReport {
            run_id,
            ops_applied: journal.ops.len(),
        })
    }
}

/// Monotone, process-unique run id.
#[must_use]
pub fn new_run_id() -> String {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("{nanos}-{}", std::process::id())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_ids_are_unique_and_sortable() {
        let a = new_run_id();
        let b = new_run_id();
        assert_ne!(a, b);
        assert!(a.contains('-'));
    }
}
