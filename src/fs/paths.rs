//! Lexical path arithmetic used by the scanner, planner, and commit engine.
//!
//! Everything here is pure: no path ever touches the filesystem.

use std::path::{Component, Path, PathBuf};

/// Lexically clean `path` into an absolute form: forces a leading `/`,
/// resolves `.` and `..` components, and collapses separators.
#[must_use]
pub fn clean_abs(path: &Path) -> PathBuf {
    let mut out = PathBuf::from("/");
    for comp in path.components() {
        match comp {
            Component::RootDir | Component::Prefix(_) | Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(seg) => out.push(seg),
        }
    }
    out
}

/// Join a path relative to an upper layer onto its mount point, producing
/// the final absolute target path.
#[must_use]
pub fn join_under_mount(mount_point: &Path, rel: &Path) -> PathBuf {
    let prefix = clean_abs(mount_point);
    if rel.as_os_str().is_empty() {
        return prefix;
    }
    clean_abs(&prefix.join(rel))
}

/// Number of components below `/`; the root itself has depth zero.
#[must_use]
pub fn depth(path: &Path) -> usize {
    path.components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .count()
}

/// Every proper ancestor of `path` up to and including `/`, plus the path
/// itself. Input must already be cleaned.
#[must_use]
pub fn ancestor_chain(path: &Path) -> Vec<PathBuf> {
    let mut chain = vec![path.to_path_buf()];
    let mut cur = path;
    while let Some(parent) = cur.parent() {
        chain.push(parent.to_path_buf());
        cur = parent;
    }
    chain
}

/// Map an absolute target path into the per-run backup area: leading `/`
/// stripped; the root itself becomes `<backup_dir>/root`.
#[must_use]
pub fn backup_location(backup_dir: &Path, target: &Path) -> PathBuf {
    let clean = clean_abs(target);
    match clean.strip_prefix("/") {
        Ok(rel) if !rel.as_os_str().is_empty() => backup_dir.join(rel),
        _ => backup_dir.join("root"),
    }
}

/// Sibling staging path used by the atomic file-replace protocol.
#[must_use]
pub fn staging_path(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_os_string();
    name.push(crate::constants::TMP_SUFFIX);
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_abs_normalizes() {
        assert_eq!(clean_abs(Path::new("/a/b/../c/./d")), PathBuf::from("/a/c/d"));
        assert_eq!(clean_abs(Path::new("a/b")), PathBuf::from("/a/b"));
        assert_eq!(clean_abs(Path::new("/../..")), PathBuf::from("/"));
        assert_eq!(clean_abs(Path::new("//a//b/")), PathBuf::from("/a/b"));
    }

    #[test]
    fn join_under_mount_handles_root_and_nested_mounts() {
        assert_eq!(
            join_under_mount(Path::new("/"), Path::new("etc/hosts")),
            PathBuf::from("/etc/hosts")
        );
        assert_eq!(
            join_under_mount(Path::new("/home"), Path::new("user/.bashrc")),
            PathBuf::from("/home/user/.bashrc")
        );
        assert_eq!(join_under_mount(Path::new("/home"), Path::new("")), PathBuf::from("/home"));
    }

    #[test]
    fn depth_counts_components() {
        assert_eq!(depth(Path::new("/")), 0);
        assert_eq!(depth(Path::new("/a")), 1);
        assert_eq!(depth(Path::new("/a/b/c")), 3);
    }

    #[test]
    fn ancestor_chain_reaches_root() {
        let chain = ancestor_chain(Path::new("/a/b/c"));
        assert_eq!(
            chain,
            vec![
                PathBuf::from("/a/b/c"),
                PathBuf::from("/a/b"),
                PathBuf::from("/a"),
                PathBuf::from("/"),
            ]
        );
    }

    #[test]
    fn backup_location_strips_leading_slash() {
        let b = Path::new("/state/backups/r1");
        assert_eq!(
            backup_location(b, Path::new("/etc/hosts")),
            PathBuf::from("/state/backups/r1/etc/hosts")
        );
        assert_eq!(backup_location(b, Path::new("/")), PathBuf::from("/state/backups/r1/root"));
    }

    #[test]
    fn staging_path_appends_suffix() {
        assert_eq!(
            staging_path(Path::new("/tmp/t/target.txt")),
            PathBuf::from("/tmp/t/target.txt.atomic.tmp")
        );
    }
}
