//! Shared filesystem helpers: lexical path handling, verbatim copies, and
//! the fsync discipline the durability guarantee rests on.

pub mod copy;
pub mod paths;

use std::fs::File;
use std::io;
use std::path::Path;

/// Open `path` and flush its contents to stable storage.
pub fn fsync_file(path: &Path) -> io::Result<()> {
    File::open(path)?.sync_all()
}

/// Flush the directory containing `path`, making a completed rename durable.
pub fn fsync_parent_dir(path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        File::open(parent)?.sync_all()?;
    }
    Ok(())
}

/// `mkdir -p` with the engine's default directory mode.
pub fn ensure_dir(path: &Path) -> io::Result<()> {
    std::fs::create_dir_all(path)
}

/// Remove `path` recursively; a missing target is not an error.
pub fn remove_all(path: &Path) -> io::Result<()> {
    let meta = match std::fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    if meta.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remove_all_tolerates_missing_target() {
        let td = tempfile::tempdir().unwrap();
        assert!(remove_all(&td.path().join("nope")).is_ok());
    }

    #[test]
    fn remove_all_handles_files_dirs_and_symlinks() {
        let td = tempfile::tempdir().unwrap();
        let f = td.path().join("f");
        std::fs::write(&f, b"x").unwrap();
        remove_all(&f).unwrap();
        assert!(!f.exists());

        let d = td.path().join("d");
        std::fs::create_dir_all(d.join("sub")).unwrap();
        std::fs::write(d.join("sub/x"), b"x").unwrap();
        remove_all(&d).unwrap();
        assert!(!d.exists());

        let l = td.path().join("l");
        std::os::unix::fs::symlink("/nonexistent", &l).unwrap();
        remove_all(&l).unwrap();
        assert!(std::fs::symlink_metadata(&l).is_err());
    }
}
