//! Mount table enumeration.
//!
//! Parses the kernel's `/proc/self/mountinfo` and narrows it down to the
//! writable real filesystems overlayfs can stack a lower layer on. The
//! surviving set is sorted shallowest-first, then lexically; the overlay
//! orchestrator and runner both rely on that ordering being stable.

use std::collections::BTreeSet;
use std::io::{self, BufRead};
use std::path::{Path, PathBuf};

use crate::fs::paths::depth;

/// One mount table entry, reduced to the fields the engine cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub mount_point: PathBuf,
    pub fs_type: String,
    pub source: String,
    pub options: BTreeSet<String>,
}

impl Mount {
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.options.contains("ro")
    }
}

/// Parse mountinfo lines from `reader`.
///
/// Line shape: `id parent major:minor root mount-point options [optional…] -
/// fstype source super-options`. Octal escapes in the mount point are
/// decoded.
pub fn parse_mountinfo<R: BufRead>(reader: R) -> io::Result<Vec<Mount>> {
    let mut out = Vec::new();
    for line in reader.lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (left, right) = line.split_once(" - ").ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, format!("invalid mountinfo line: {line:?}"))
        })?;
        let left_fields: Vec<&str> = left.split_whitespace().collect();
        let right_fields: Vec<&str> = right.split_whitespace().collect();
        if left_fields.len() < 6 || right_fields.len() < 2 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid mountinfo fields: {line:?}"),
            ));
        }
        out.push(Mount {
            mount_point: PathBuf::from(decode_escapes(left_fields[4])),
            options: left_fields[5]
                .split(',')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            fs_type: right_fields[0].to_string(),
            source: right_fields[1].to_string(),
        });
    }
    Ok(out)
}

/// Filter to writable, real, non-overlay filesystems and sort by path depth
/// ascending, then lexically.
#[must_use]
pub fn writable_real_mounts(mounts: Vec<Mount>) -> Vec<Mount> {
    let mut out: Vec<Mount> = mounts
        .into_iter()
        .filter(|m| !m.is_read_only() && !is_pseudo_fs(&m.fs_type) && m.fs_type != "overlay")
        .collect();
    out.sort_by(|a, b| {
        depth(&a.mount_point)
            .cmp(&depth(&b.mount_point))
            .then_with(|| a.mount_point.cmp(&b.mount_point))
            .then_with(|| a.fs_type.cmp(&b.fs_type))
    });
    out
}

/// Kernel-internal and memory-backed filesystems overlay cannot (or must
/// not) stack on.
#[must_use]
pub fn is_pseudo_fs(fs_type: &str) -> bool {
    matches!(
        fs_type,
        "proc"
            | "sysfs"
            | "devtmpfs"
            | "devpts"
            | "cgroup"
            | "cgroup2"
            | "tmpfs"
            | "securityfs"
            | "mqueue"
            | "pstore"
            | "tracefs"
            | "debugfs"
            | "autofs"
            | "efivarfs"
            | "hugetlbfs"
            | "fusectl"
            | "configfs"
            | "binfmt_misc"
            | "nsfs"
            | "ramfs"
            | "selinuxfs"
            | "bpf"
    )
}

/// On-disk formats that are supported overlay lower layers.
#[must_use]
pub fn overlay_lower_supported(fs_type: &str) -> bool {
    matches!(fs_type, "ext2" | "ext3" | "ext4" | "xfs" | "btrfs" | "f2fs")
}

/// Read and filter the live mount table.
pub fn live_writable_real_mounts() -> io::Result<Vec<Mount>> {
    let file = std::fs::File::open("/proc/self/mountinfo")?;
    let parsed = parse_mountinfo(io::BufReader::new(file))?;
    Ok(writable_real_mounts(parsed))
}

/// Decode the octal escapes (`\040` and friends) mountinfo uses for
/// whitespace and backslashes in names.
#[must_use]
pub fn decode_escapes(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        let digits: String = chars.clone().take(3).collect();
        if digits.len() == 3 && digits.chars().all(|d| ('0'..='7').contains(&d)) {
            if let Ok(v) = u8::from_str_radix(&digits, 8) {
                out.push(v as char);
                for _ in 0..3 {
                    chars.next();
                }
                continue;
            }
        }
        out.push(c);
    }
    out
}

/// True when `path` sits on (or below) one of `mounts`.
#[must_use]
pub fn covering_mount<'a>(mounts: &'a [Mount], path: &Path) -> Option<&'a Mount> {
    mounts
        .iter()
        .filter(|m| path.starts_with(&m.mount_point))
        .max_by_key(|m| m.mount_point.as_os_str().len())
}
