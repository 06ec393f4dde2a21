//! Durable transaction journal.
//!
//! One JSON record per run at `<journal_dir>/<run_id>.json`, written via
//! write-temp → fsync(file) → rename → fsync(dir) so a crash leaves either
//! the old record or the new one, never a torn write. Terminal records are
//! removed by finalisation; `list_pending` surfaces everything else for the
//! recovery driver.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::types::{BackupRef, Operation};

/// Journal state machine. `Committed` and `RolledBack` are terminal and
/// never revisited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    Committing,
    Committed,
    RollingBack,
    RolledBack,
}

impl State {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack)
    }
}

/// Durable record of one transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Journal {
    pub run_id: String,
    pub state: State,
    pub ops: Vec<Operation>,
    /// Index of the last successfully applied op; `-1` before any.
    pub applied_index: i64,
    #[serde(default)]
    pub backup_refs: BTreeMap<PathBuf, BackupRef>,
    /// Single reference time for conflict detection, fixed before the
    /// script was launched.
    #[serde(with = "time::serde::rfc3339")]
    pub txn_start: OffsetDateTime,
    pub run_dir: PathBuf,
    pub backup_dir: PathBuf,
    #[serde(default)]
    pub keep_artifacts: bool,
}

impl Journal {
    /// Journal file location for `run_id`.
    #[must_use]
    pub fn file_path(journal_dir: &Path, run_id: &str) -> PathBuf {
        journal_dir.join(format!("{run_id}.json"))
    }
}

/// Persist `journal` crash-safely at `path`.
pub fn save(path: &Path, journal: &Journal) -> io::Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let mut blob = serde_json::to_vec_pretty(journal)
        .map_err(|e| io::Error::other(format!("serialize journal: {e}")))?;
    blob.push(b'\n');

    let tmp = sibling_tmp(path);
    {
        use std::os::unix::fs::OpenOptionsExt;
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&tmp)?;
        io::Write::write_all(&mut file, &blob)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    crate::fs::fsync_parent_dir(path)
}

/// Load a journal record.
pub fn load(path: &Path) -> io::Result<Journal> {
    let blob = fs::read(path)?;
    serde_json::from_slice(&blob)
        .map_err(|e| io::Error::other(format!("parse journal {}: {e}", path.display())))
}

/// All journal files in `dir` whose state is not terminal, lexically sorted.
/// A missing directory simply yields nothing.
pub fn list_pending(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let mut out = Vec::new();
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") || path.is_dir() {
            continue;
        }
        let journal = load(&path)?;
        if !journal.state.is_terminal() {
            out.push(path);
        }
    }
    out.sort();
    Ok(out)
}

fn sibling_tmp(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}
