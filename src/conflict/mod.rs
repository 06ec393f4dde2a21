//! Baseline collection and commit-time conflict detection.
//!
//! The conflict predicate compares each target's inode change time against
//! the transaction start: any conflict path that exists with a `ctime`
//! strictly after `txn_start` means an external actor touched it while the
//! script was staging, and the transaction must not commit. The conflict
//! path set closes over ancestors because a rename of a parent directory
//! silently invalidates every path below it.
//!
//! The window between this check and the first backup is an accepted TOCTOU
//! residue; freezing the whole filesystem is rejected as too invasive.

use std::collections::BTreeSet;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use crate::fs::paths::{ancestor_chain, clean_abs};
use crate::types::errors::{EngineError, Result};
use crate::types::{Baseline, Operation};

/// Minimal view of a conflict path used by the predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileState {
    pub exists: bool,
    pub ctime_ns: i128,
}

impl FileState {
    pub const ABSENT: Self = Self { exists: false, ctime_ns: 0 };
}

/// `lstat` each operation target and attach its metadata snapshot.
pub fn attach_baselines(mut ops: Vec<Operation>) -> Result<Vec<Operation>> {
    for op in &mut ops {
        op.baseline = baseline_for_path(&op.path).map_err(|e| {
            EngineError::Scan(format!("baseline {}: {e}", op.path.display()))
        })?;
    }
    Ok(ops)
}

/// Snapshot metadata for one target; an absent target yields
/// `exists = false`.
pub fn baseline_for_path(path: &Path) -> io::Result<Baseline> {
    let meta = match std::fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Baseline::default()),
        Err(e) => return Err(e),
    };
    Ok(Baseline {
        exists: true,
        mode: meta.mode(),
        uid: meta.uid(),
        gid: meta.gid(),
        size: meta.size(),
        ctime_ns: meta.ctime() * 1_000_000_000 + meta.ctime_nsec(),
        mtime_ns: meta.mtime() * 1_000_000_000 + meta.mtime_nsec(),
        inode: meta.ino(),
        dev: meta.dev(),
    })
}

/// Fail if any conflict path changed after `txn_start_ns`, using the given
/// stat function (tests inject one; production uses [`stat_path`]).
pub fn check_with<F>(ops: &[Operation], txn_start_ns: i128, stat: F) -> Result<()>
where
    F: Fn(&Path) -> io::Result<FileState>,
{
    for path in conflict_paths(ops) {
        let st = stat(&path).map_err(|e| {
            EngineError::Scan(format!("stat conflict path {}: {e}", path.display()))
        })?;
        if st.exists && st.ctime_ns > txn_start_ns {
            return Err(EngineError::Conflict {
                path: path.display().to_string(),
            });
        }
    }
    Ok(())
}

/// Conflict check against the live filesystem.
pub fn check(ops: &[Operation], txn_start_ns: i128) -> Result<()> {
    check_with(ops, txn_start_ns, stat_path)
}

/// `lstat`-backed [`FileState`], falling back to `mtime` on platforms where
/// the change time is unusable.
pub fn stat_path(path: &Path) -> io::Result<FileState> {
    let meta = match std::fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(FileState::ABSENT),
        Err(e) => return Err(e),
    };
    let mut ctime_ns = ctime_nanos(&meta);
    if ctime_ns <= 0 {
        ctime_ns = i128::from(meta.mtime()) * 1_000_000_000 + i128::from(meta.mtime_nsec());
    }
    Ok(FileState { exists: true, ctime_ns })
}

fn ctime_nanos(meta: &std::fs::Metadata) -> i128 {
    i128::from(meta.ctime()) * 1_000_000_000 + i128::from(meta.ctime_nsec())
}

/// Union of every operation path and every proper ancestor up to `/`,
/// deduplicated and ordered.
#[must_use]
pub fn conflict_paths(ops: &[Operation]) -> Vec<PathBuf> {
    let mut seen: BTreeSet<PathBuf> = BTreeSet::new();
    for op in ops {
        if op.path.as_os_str().is_empty() {
            continue;
        }
        for path in ancestor_chain(&clean_abs(&op.path)) {
            seen.insert(path);
        }
    }
    seen.into_iter().collect()
}
