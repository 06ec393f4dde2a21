//! Journaled commit engine: backup, apply, rollback.
//!
//! Apply walks the sequenced operations from `applied_index + 1`, and for
//! each index strictly interleaves journal persistence with the mutation:
//! persist(state=Committing) → backup(i) → persist(backup_refs) → apply(i) →
//! persist(applied_index=i). A crash therefore always leaves a
//! prefix-consistent journal for the recovery driver.
//!
//! Rollback walks every recorded backup deepest-first, removing the live
//! target and restoring the pre-image when one existed. A `BackupRef` with
//! `exists = false` is a tombstone: the target must not exist afterwards.

use std::fs;
use std::io;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use crate::fs::copy::{chown_like, copy_dir_contents_filtered, copy_path, copy_regular_file};
use crate::fs::paths::{backup_location, clean_abs, depth, staging_path};
use crate::fs::{ensure_dir, fsync_file, fsync_parent_dir, remove_all};
use crate::journal::{self, Journal, State};
use crate::types::errors::{EngineError, Result};
use crate::types::{BackupRef, NodeType, OpKind, Operation};

/// Applies and rolls back journals against the live filesystem.
///
/// `root_prefix` is prepended to every target path; production uses the
/// empty prefix, tests rewrite `/` into a scratch root.
#[derive(Debug, Clone, Default)]
pub struct CommitEngine {
    pub root_prefix: PathBuf,
}

impl CommitEngine {
    #[must_use]
    pub fn new(root_prefix: PathBuf) -> Self {
        Self { root_prefix }
    }

    /// Drive `journal` from its current position to `Committed`.
    ///
    /// On any backup or apply failure, rolls the whole transaction back and
    /// surfaces the originating error; `rolled_back` in the returned
    /// `EngineError::Commit` records whether that rollback succeeded.
    pub fn apply(&self, journal_path: &Path, journal: &mut Journal) -> Result<()> {
        let start = usize::try_from(journal.applied_index + 1)
            .map_err(|_| EngineError::Internal("applied_index below -1".to_string()))?;
        for op in &journal.ops[start.min(journal.ops.len())..] {
            validate_op(op)?;
        }

        journal.state = State::Committing;
        self.persist(journal_path, journal)?;

        for idx in start..journal.ops.len() {
            let op = journal.ops[idx].clone();
            let step = self
                .backup_once(journal, &op.path)
                .map_err(|e| format!("backup {}: {e}", op.path.display()))
                .and_then(|()| {
                    self.persist(journal_path, journal)
                        .map_err(|e| e.to_string())
                })
                .and_then(|()| {
                    self.apply_operation(&op)
                        .map_err(|e| format!("apply {}: {e}", op.path.display()))
                });
            if let Err(msg) = step {
                let rolled_back = self.rollback(journal_path, journal).is_ok();
                return Err(EngineError::Commit { msg, rolled_back });
            }
            journal.applied_index = idx as i64;
            if let Err(e) = self.persist(journal_path, journal) {
                let rolled_back = self.rollback(journal_path, journal).is_ok();
                return Err(EngineError::Commit { msg: e.to_string(), rolled_back });
            }
        }

        journal.state = State::Committed;
        self.persist(journal_path, journal)
    }

    /// Restore every backed-up path to its pre-image, deepest-first, and
    /// drive the journal to `RolledBack`. Errors here leave the journal
    /// non-terminal and require operator intervention.
    pub fn rollback(&self, journal_path: &Path, journal: &mut Journal) -> Result<()> {
        journal.state = State::RollingBack;
        self.persist(journal_path, journal)?;

        let mut paths: Vec<PathBuf> = journal.backup_refs.keys().cloned().collect();
        paths.sort_by(|a, b| depth(b).cmp(&depth(a)).then_with(|| a.cmp(b)));

        for path in paths {
            let backup = journal.backup_refs[&path].clone();
            let target = self.target_path(&path);
            remove_all(&target).map_err(|e| {
                EngineError::Recovery(format!(
                    "remove target during rollback {}: {e}",
                    target.display()
                ))
            })?;
            if backup.exists {
                copy_path(&backup.path, &target, &[]).map_err(|e| {
                    EngineError::Recovery(format!("restore target {}: {e}", target.display()))
                })?;
            }
        }

        journal.state = State::RolledBack;
        self.persist(journal_path, journal)
    }

    /// Record a pre-image for `op_path` unless one exists already. Backups
    /// are taken once per path, before its first mutation, and never
    /// overwritten within a transaction.
    fn backup_once(&self, journal: &mut Journal, op_path: &Path) -> io::Result<()> {
        if journal.backup_refs.contains_key(op_path) {
            return Ok(());
        }
        ensure_dir(&journal.backup_dir)?;
        let target = self.target_path(op_path);

        match fs::symlink_metadata(&target) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                journal
                    .backup_refs
                    .insert(op_path.to_path_buf(), BackupRef::default());
                Ok(())
            }
            Err(e) => Err(e),
            Ok(_) => {
                let backup = backup_location(&journal.backup_dir, op_path);
                // The backup area must never recurse into its own output
                // when an op targets one of its ancestors.
                copy_path(&target, &backup, &[journal.backup_dir.clone()])?;
                journal.backup_refs.insert(
                    op_path.to_path_buf(),
                    BackupRef { exists: true, path: backup },
                );
                Ok(())
            }
        }
    }

    fn apply_operation(&self, op: &Operation) -> io::Result<()> {
        let target = self.target_path(&op.path);
        match op.kind {
            OpKind::Delete => {
                remove_all(&target)?;
                fsync_parent_dir(&target)
            }
            OpKind::Upsert => self.apply_upsert(op, &target),
        }
    }

    fn apply_upsert(&self, op: &Operation, target: &Path) -> io::Result<()> {
        // validate_op ran before the loop; a missing source here is a race
        // on the workspace, which is an ordinary I/O failure.
        let source = op.source_path.as_deref().unwrap_or(Path::new(""));
        let source_meta = fs::symlink_metadata(source)?;

        match op.node_type {
            NodeType::Directory => {
                if op.opaque {
                    remove_all(target)?;
                }
                ensure_dir(target)?;
                fs::set_permissions(target, perms_of(&source_meta))?;
                copy_dir_contents_filtered(source, target)?;
                chown_like(target, &source_meta)?;
                fsync_parent_dir(target)
            }
            NodeType::File => {
                if let Some(parent) = target.parent() {
                    ensure_dir(parent)?;
                }
                remove_all(target)?;
                let tmp = staging_path(target);
                copy_regular_file(source, &tmp)?;
                fs::rename(&tmp, target)?;
                chown_like(target, &source_meta)?;
                fsync_file(target)?;
                fsync_parent_dir(target)
            }
            NodeType::Symlink => {
                if let Some(parent) = target.parent() {
                    ensure_dir(parent)?;
                }
                remove_all(target)?;
                let link = fs::read_link(source)?;
                std::os::unix::fs::symlink(link, target)?;
                fsync_parent_dir(target)
            }
            NodeType::Unknown => Err(io::Error::other(format!(
                "unknown node type for upsert {}",
                op.path.display()
            ))),
        }
    }

    /// Rewrite an absolute target path under `root_prefix`.
    #[must_use]
    pub fn target_path(&self, path: &Path) -> PathBuf {
        let clean = clean_abs(path);
        if self.root_prefix.as_os_str().is_empty() {
            return clean;
        }
        match clean.strip_prefix("/") {
            Ok(rel) if !rel.as_os_str().is_empty() => self.root_prefix.join(rel),
            _ => self.root_prefix.clone(),
        }
    }

    fn persist(&self, journal_path: &Path, journal: &Journal) -> Result<()> {
        journal::save(journal_path, journal)
            .map_err(|e| EngineError::Recovery(format!("persist journal: {e}")))
    }
}

/// Reject operations that violate the data model before anything mutates.
fn validate_op(op: &Operation) -> Result<()> {
    if op.kind == OpKind::Upsert {
        let empty = op
            .source_path
            .as_deref()
            .map_or(true, |p| p.as_os_str().is_empty());
        if empty {
            return Err(EngineError::Internal(format!(
                "empty source path for upsert {}",
                op.path.display()
            )));
        }
        if op.node_type == NodeType::Unknown {
            return Err(EngineError::Internal(format!(
                "unknown node type for upsert {}",
                op.path.display()
            )));
        }
    }
    Ok(())
}

fn perms_of(meta: &fs::Metadata) -> fs::Permissions {
    fs::Permissions::from_mode(meta.mode() & 0o7777)
}

/// Remove run artifacts and the journal file once `journal` has reached a
/// terminal state.
pub fn finalize(journal_path: &Path, journal: &Journal) -> Result<()> {
    if !journal.keep_artifacts {
        if !journal.run_dir.as_os_str().is_empty() {
            remove_all(&journal.run_dir)
                .map_err(|e| EngineError::Recovery(format!("remove run dir: {e}")))?;
        }
        if !journal.backup_dir.as_os_str().is_empty() {
            remove_all(&journal.backup_dir)
                .map_err(|e| EngineError::Recovery(format!("remove backup dir: {e}")))?;
        }
    }
    match fs::remove_file(journal_path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(EngineError::Recovery(format!("remove journal: {e}"))),
    }
}
