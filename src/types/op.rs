//! The atomic unit of mutation and its journal-side companions.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// What an operation does to its target path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    Upsert,
    Delete,
}

/// Filesystem node kind of an operation's target.
///
/// `Unknown` is valid only on Delete: a whiteout tombstone carries no type
/// information about the node it removes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Unknown,
    File,
    Directory,
    Symlink,
}

/// Metadata snapshot of a target path taken just before the conflict check.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Baseline {
    pub exists: bool,
    #[serde(default)]
    pub mode: u32,
    #[serde(default)]
    pub uid: u32,
    #[serde(default)]
    pub gid: u32,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub ctime_ns: i64,
    #[serde(default)]
    pub mtime_ns: i64,
    #[serde(default)]
    pub inode: u64,
    #[serde(default)]
    pub dev: u64,
}

/// A single sequenced filesystem mutation.
///
/// `path` is absolute and lexically cleaned. `source_path` points into the
/// run workspace and is required for Upserts; Deletes carry none. `opaque`
/// is meaningful only for directory Upserts and requests that the target's
/// prior contents be erased before repopulation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub kind: OpKind,
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_path: Option<PathBuf>,
    pub node_type: NodeType,
    #[serde(default)]
    pub opaque: bool,
    #[serde(default)]
    pub baseline: Baseline,
}

impl Operation {
    /// Tombstone for `path`; node kind of the removed entry is unknowable
    /// from the whiteout alone.
    #[must_use]
    pub fn delete(path: PathBuf) -> Self {
        Self {
            kind: OpKind::Delete,
            path,
            source_path: None,
            node_type: NodeType::Unknown,
            opaque: false,
            baseline: Baseline::default(),
        }
    }

    /// Upsert of `path` staged at `source_path`.
    #[must_use]
    pub fn upsert(path: PathBuf, source_path: PathBuf, node_type: NodeType) -> Self {
        Self {
            kind: OpKind::Upsert,
            path,
            source_path: Some(source_path),
            node_type,
            opaque: false,
            baseline: Baseline::default(),
        }
    }
}

/// Pre-image reference for one path touched by the commit engine.
///
/// `exists == false` records that the target was absent at backup time;
/// rollback must ensure it is absent afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRef {
    pub exists: bool,
    #[serde(default)]
    pub path: PathBuf,
}
