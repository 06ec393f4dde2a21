//! Verbatim copy primitives for backups and staged-content application.
//!
//! Copies preserve mode and ownership, keep symlinks as symlinks, and never
//! follow them. Ownership propagation uses `lchown`, so running unprivileged
//! only ever chowns to the caller's own ids.

use std::fs;
use std::io;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use crate::constants::WHITEOUT_PREFIX;
use crate::fs::{ensure_dir, remove_all};

/// Copy a regular file, creating the destination with the source's mode and
/// flushing it to stable storage.
pub fn copy_regular_file(src: &Path, dst: &Path) -> io::Result<()> {
    let meta = fs::symlink_metadata(src)?;
    if let Some(parent) = dst.parent() {
        ensure_dir(parent)?;
    }
    let mut input = fs::File::open(src)?;
    let mut output = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(dst)?;
    io::copy(&mut input, &mut output)?;
    output.set_permissions(fs::Permissions::from_mode(meta.mode() & 0o7777))?;
    output.sync_all()?;
    Ok(())
}

/// Recreate the symlink at `src` as `dst`, replacing any existing node.
pub fn copy_symlink(src: &Path, dst: &Path) -> io::Result<()> {
    if let Some(parent) = dst.parent() {
        ensure_dir(parent)?;
    }
    let link = fs::read_link(src)?;
    remove_all(dst)?;
    std::os::unix::fs::symlink(link, dst)
}

/// Propagate owner/group from `src_meta` onto `dst` without following a
/// symlink at `dst`.
pub fn chown_like(dst: &Path, src_meta: &fs::Metadata) -> io::Result<()> {
    std::os::unix::fs::lchown(dst, Some(src_meta.uid()), Some(src_meta.gid()))
}

/// Copy a node of any kind (file, directory tree, symlink) verbatim.
///
/// `skip_prefixes` prunes subtrees from directory recursion; the commit
/// engine passes the backup area itself here so backing up an ancestor of
/// the backup directory cannot recurse into its own output.
pub fn copy_path(src: &Path, dst: &Path, skip_prefixes: &[PathBuf]) -> io::Result<()> {
    let meta = fs::symlink_metadata(src)?;
    if meta.file_type().is_symlink() {
        copy_symlink(src, dst)?;
        return Ok(());
    }
    if meta.is_dir() {
        ensure_dir(dst)?;
        fs::set_permissions(dst, fs::Permissions::from_mode(meta.mode() & 0o7777))?;
        chown_like(dst, &meta)?;
        let mut entries: Vec<_> = fs::read_dir(src)?.collect::<io::Result<_>>()?;
        entries.sort_by_key(|e| e.file_name());
        for entry in entries {
            let child_src = entry.path();
            if skip_prefixes.iter().any(|p| child_src.starts_with(p)) {
                continue;
            }
            copy_path(&child_src, &dst.join(entry.file_name()), skip_prefixes)?;
        }
        return Ok(());
    }
    copy_regular_file(src, dst)?;
    chown_like(dst, &meta)
}

/// Copy the contents of a staged upper directory into `dst`, filtering the
/// overlay's own cookies: any `.wh.*` entry (whiteouts and the opaque
/// marker) is dropped, and `.wh.*` subtrees are never entered.
pub fn copy_dir_contents_filtered(src: &Path, dst: &Path) -> io::Result<()> {
    let mut entries: Vec<_> = fs::read_dir(src)?.collect::<io::Result<_>>()?;
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
        let name = entry.file_name();
        if name.to_string_lossy().starts_with(WHITEOUT_PREFIX) {
            continue;
        }
        let child_src = entry.path();
        let child_dst = dst.join(&name);
        let meta = fs::symlink_metadata(&child_src)?;
        if meta.file_type().is_symlink() {
            copy_symlink(&child_src, &child_dst)?;
        } else if meta.is_dir() {
            ensure_dir(&child_dst)?;
            fs::set_permissions(&child_dst, fs::Permissions::from_mode(meta.mode() & 0o7777))?;
            chown_like(&child_dst, &meta)?;
            copy_dir_contents_filtered(&child_src, &child_dst)?;
        } else if meta.is_file() {
            copy_regular_file(&child_src, &child_dst)?;
            chown_like(&child_dst, &meta)?;
        } else {
            return Err(io::Error::other(format!(
                "unsupported node type in staged directory: {}",
                child_src.display()
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_regular_file_preserves_mode_and_bytes() {
        let td = tempfile::tempdir().unwrap();
        let src = td.path().join("src");
        fs::write(&src, b"payload").unwrap();
        fs::set_permissions(&src, fs::Permissions::from_mode(0o640)).unwrap();
        let dst = td.path().join("dst");
        copy_regular_file(&src, &dst).unwrap();
        assert_eq!(fs::read(&dst).unwrap(), b"payload");
        assert_eq!(fs::metadata(&dst).unwrap().mode() & 0o777, 0o640);
    }

    #[test]
    fn copy_path_keeps_symlinks_as_symlinks() {
        let td = tempfile::tempdir().unwrap();
        let src = td.path().join("link");
        std::os::unix::fs::symlink("target-that-does-not-exist", &src).unwrap();
        let dst = td.path().join("copy");
        copy_path(&src, &dst, &[]).unwrap();
        assert_eq!(
            fs::read_link(&dst).unwrap(),
            PathBuf::from("target-that-does-not-exist")
        );
    }

    #[test]
    fn copy_path_skips_configured_prefixes() {
        let td = tempfile::tempdir().unwrap();
        let src = td.path().join("tree");
        fs::create_dir_all(src.join("keep")).unwrap();
        fs::create_dir_all(src.join("backups")).unwrap();
        fs::write(src.join("keep/a"), b"a").unwrap();
        fs::write(src.join("backups/b"), b"b").unwrap();
        let dst = td.path().join("out");
        copy_path(&src, &dst, &[src.join("backups")]).unwrap();
        assert!(dst.join("keep/a").exists());
        assert!(!dst.join("backups").exists());
    }

    #[test]
    fn filtered_copy_drops_overlay_cookies() {
        let td = tempfile::tempdir().unwrap();
        let src = td.path().join("upper");
        fs::create_dir_all(src.join("sub")).unwrap();
        fs::write(src.join("file"), b"f").unwrap();
        fs::write(src.join(".wh.gone"), b"").unwrap();
        fs::write(src.join(".wh..wh..opq"), b"").unwrap();
        fs::write(src.join("sub/.wh.nested"), b"").unwrap();
        let dst = td.path().join("out");
        fs::create_dir_all(&dst).unwrap();
        copy_dir_contents_filtered(&src, &dst).unwrap();
        assert!(dst.join("file").exists());
        assert!(dst.join("sub").exists());
        assert!(!dst.join(".wh.gone").exists());
        assert!(!dst.join(".wh..wh..opq").exists());
        assert!(!dst.join("sub/.wh.nested").exists());
    }
}
