//! Startup recovery driver.
//!
//! Runs before any new transaction is accepted. Every pending journal is
//! resumed from `applied_index + 1`; a journal that cannot be driven to
//! `Committed` is rolled back instead. Either terminal outcome is finalized
//! (artifacts and journal file removed). A journal that can neither commit
//! nor roll back poisons the engine: recovery fails and no new transactions
//! may start.

use std::path::Path;

use crate::commit::{finalize, CommitEngine};
use crate::journal;
use crate::types::errors::{EngineError, Result};

/// Outcome of recovering a single journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Resumed,
    RolledBack,
}

/// Recover every pending journal under `journal_dir`, lexically ordered.
/// Returns one outcome per journal processed.
pub fn run(journal_dir: &Path, root_prefix: &Path) -> Result<Vec<Outcome>> {
    let pending = journal::list_pending(journal_dir)
        .map_err(|e| EngineError::Recovery(format!("enumerate journals: {e}")))?;
    let engine = CommitEngine::new(root_prefix.to_path_buf());
    let mut outcomes = Vec::with_capacity(pending.len());

    for path in pending {
        let mut j = journal::load(&path)
            .map_err(|e| EngineError::Recovery(format!("load {}: {e}", path.display())))?;
        match engine.apply(&path, &mut j) {
            Ok(()) => outcomes.push(Outcome::Resumed),
            Err(EngineError::Commit { msg, rolled_back: true }) => {
                // Pre-image restored; the failed transaction is closed out
                // below and recovery proceeds.
                log::warn!("resume of {} failed and was rolled back: {msg}", j.run_id);
                outcomes.push(Outcome::RolledBack);
            }
            Err(EngineError::Commit { msg, rolled_back: false }) => {
                return Err(EngineError::Recovery(format!(
                    "resume of {} failed and rollback also failed: {msg}",
                    j.run_id
                )));
            }
            Err(other) => return Err(EngineError::Recovery(other.to_string())),
        }
        finalize(&path, &j)?;
    }
    Ok(outcomes)
}
