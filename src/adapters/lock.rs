//! Process-wide mutual exclusion: one active transaction system-wide.
//!
//! The engine requires a try-acquire primitive; a second concurrent run is
//! refused with a busy signal rather than queued. A bounded-wait variant is
//! provided for callers that prefer to poll.

use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use fs2::FileExt;

use crate::constants::LOCK_POLL_MS;
use crate::types::errors::{EngineError, Result};

/// Held for the lifetime of the exclusive claim; dropping releases it.
pub trait LockGuard {}

pub trait LockManager {
    /// Claim the engine lock without waiting; `EngineError::Busy` when
    /// another transaction holds it.
    fn try_acquire(&self) -> Result<Box<dyn LockGuard>>;

    /// Claim the engine lock, polling up to `timeout_ms`.
    fn acquire(&self, timeout_ms: u64) -> Result<Box<dyn LockGuard>>;
}

/// File-backed lock manager using an exclusive flock.
#[derive(Debug)]
pub struct FileLockManager {
    path: PathBuf,
}

impl FileLockManager {
    #[must_use]
    pub const fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn open(&self) -> Result<File> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                EngineError::Unsupported(format!(
                    "create lock directory {}: {e}",
                    parent.display()
                ))
            })?;
        }
        OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(|e| {
                EngineError::Unsupported(format!("open lock file {}: {e}", self.path.display()))
            })
    }
}

struct FileGuard {
    file: File,
}

impl Drop for FileGuard {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

impl LockGuard for FileGuard {}

impl LockManager for FileLockManager {
    fn try_acquire(&self) -> Result<Box<dyn LockGuard>> {
        let file = self.open()?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Box::new(FileGuard { file })),
            Err(_) => Err(EngineError::Busy(format!(
                "another transaction holds {}",
                self.path.display()
            ))),
        }
    }

    fn acquire(&self, timeout_ms: u64) -> Result<Box<dyn LockGuard>> {
        let t0 = Instant::now();
        let file = self.open()?;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(Box::new(FileGuard { file })),
                Err(_) if t0.elapsed() >= Duration::from_millis(timeout_ms) => {
                    return Err(EngineError::Busy(format!(
                        "timeout acquiring {}",
                        self.path.display()
                    )));
                }
                Err(_) => thread::sleep(Duration::from_millis(LOCK_POLL_MS)),
            }
        }
    }
}
