//! Upper-layer diff scanner.
//!
//! Walks an overlay upper directory and translates its cookies into abstract
//! operations keyed by final absolute path:
//!
//! - `.wh.<name>` files and rdev-0 character devices are whiteouts → Delete.
//! - `.wh..wh..opq` marks its containing directory opaque → Upsert(Directory,
//!   opaque), erasing target contents before repopulation.
//! - Regular files and symlinks → Upsert with the upper path as staging
//!   source.
//! - A non-empty directory without an opaque marker is a copy-up container:
//!   only its children produce operations. A directory whose entries are all
//!   whiteouts counts as created-empty and gets an explicit Upsert.
//!
//! Delete shadows Upsert for the same path regardless of encounter order,
//! and `opaque` survives merges. The walk never descends into `.wh.*`
//! subtrees.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};

use crate::constants::{OPAQUE_MARKER, WHITEOUT_PREFIX};
use crate::fs::paths::join_under_mount;
use crate::types::{NodeType, OpKind, Operation};

/// Scan one `(upper_dir, mount_point)` pair into a flat operation sequence.
///
/// The result is ordered by target path (the map key); the plan sequencer
/// imposes the apply order afterwards.
pub fn scan_upper_dir(upper_dir: &Path, mount_point: &Path) -> io::Result<Vec<Operation>> {
    let mut scan = Scan {
        upper_dir,
        mount_point,
        ops: BTreeMap::new(),
    };
    scan.walk_dir(upper_dir)?;
    Ok(scan.ops.into_values().collect())
}

struct Scan<'a> {
    upper_dir: &'a Path,
    mount_point: &'a Path,
    ops: BTreeMap<PathBuf, Operation>,
}

impl Scan<'_> {
    fn walk_dir(&mut self, dir: &Path) -> io::Result<()> {
        let mut entries: Vec<_> = fs::read_dir(dir)?.collect::<io::Result<_>>()?;
        entries.sort_by_key(|e| e.file_name());
        for entry in entries {
            self.visit(&entry.path())?;
        }
        Ok(())
    }

    fn visit(&mut self, path: &Path) -> io::Result<()> {
        let rel = path
            .strip_prefix(self.upper_dir)
            .map_err(|_| io::Error::other(format!("entry escapes upper dir: {}", path.display())))?;
        let name = match path.file_name() {
            Some(n) => n.to_string_lossy().into_owned(),
            None => return Ok(()),
        };

        if name == OPAQUE_MARKER {
            let dir_rel = rel.parent().unwrap_or(Path::new(""));
            let target = join_under_mount(self.mount_point, dir_rel);
            let source = self.upper_dir.join(dir_rel);
            let mut op = Operation::upsert(target.clone(), source, NodeType::Directory);
            op.opaque = true;
            // An opaque marker always wins over a previously suppressed or
            // plain directory entry for the same path.
            self.ops.insert(target, op);
            return Ok(());
        }

        if let Some(victim) = name.strip_prefix(WHITEOUT_PREFIX) {
            let dir_rel = rel.parent().unwrap_or(Path::new(""));
            let target = join_under_mount(self.mount_point, &dir_rel.join(victim));
            // Tombstone shadows any operation already recorded for the path,
            // and the removed subtree's contents are irrelevant.
            self.ops.insert(target.clone(), Operation::delete(target));
            return Ok(());
        }

        let meta = fs::symlink_metadata(path)?;
        if is_whiteout_device(&meta) {
            let target = join_under_mount(self.mount_point, rel);
            self.ops.insert(target.clone(), Operation::delete(target));
            return Ok(());
        }

        let target = join_under_mount(self.mount_point, rel);
        let node_type = detect_node_type(&meta, path)?;

        if node_type == NodeType::Directory {
            let already_opaque = self
                .ops
                .get(&target)
                .is_some_and(|existing| existing.opaque);
            if !already_opaque && !is_empty_upper_dir(path)? {
                // Copy-up container: children carry the changes.
                return self.walk_dir(path);
            }
            if !already_opaque {
                self.record_upsert(target, path.to_path_buf(), NodeType::Directory);
            }
            return self.walk_dir(path);
        }

        self.record_upsert(target, path.to_path_buf(), node_type);
        Ok(())
    }

    fn record_upsert(&mut self, target: PathBuf, source: PathBuf, node_type: NodeType) {
        match self.ops.get_mut(&target) {
            Some(existing) if existing.kind == OpKind::Delete => {
                // Delete wins.
            }
            Some(existing) => {
                let opaque = existing.opaque;
                *existing = Operation::upsert(target, source, node_type);
                existing.opaque = opaque;
            }
            None => {
                self.ops.insert(target.clone(), Operation::upsert(target, source, node_type));
            }
        }
    }
}

fn detect_node_type(meta: &fs::Metadata, path: &Path) -> io::Result<NodeType> {
    let ft = meta.file_type();
    if ft.is_dir() {
        Ok(NodeType::Directory)
    } else if ft.is_symlink() {
        Ok(NodeType::Symlink)
    } else if ft.is_file() {
        Ok(NodeType::File)
    } else {
        Err(io::Error::other(format!(
            "unsupported node type in upper layer: {}",
            path.display()
        )))
    }
}

/// Overlayfs may record whiteouts as character devices with device number 0.
fn is_whiteout_device(meta: &fs::Metadata) -> bool {
    meta.file_type().is_char_device() && meta.rdev() == 0
}

/// Empty for scanning purposes: no entries besides whiteout markers. A
/// directory holding only tombstones was created empty in the upper layer.
fn is_empty_upper_dir(path: &Path) -> io::Result<bool> {
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        if !entry.file_name().to_string_lossy().starts_with(WHITEOUT_PREFIX) {
            return Ok(false);
        }
    }
    Ok(true)
}
