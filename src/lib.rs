//! atomic-shell: transactional execution of shell scripts on Linux.
//!
//! A script runs against a stack of overlay filesystems inside a private
//! mount namespace, so the live system never sees its writes. Afterwards the
//! upper layers are diffed into an ordered operation plan, checked against
//! concurrent external changes, and committed through a crash-safe journal
//! with whole-transaction rollback.
//!
//! Durability model highlights:
//! - Journal writes follow write-temp → fsync(file) → rename → fsync(dir).
//! - Every target is backed up verbatim before its first mutation; rollback
//!   restores pre-images deepest-first.
//! - Recovery at startup resumes or rolls back any journal that did not
//!   reach a terminal state.

pub mod adapters;
pub mod commit;
pub mod conflict;
pub mod constants;
pub mod diff;
pub mod engine;
pub mod fs;
pub mod journal;
pub mod logging;
pub mod mounts;
pub mod overlay;
pub mod plan;
pub mod preflight;
pub mod recover;
pub mod types;

pub use engine::{Engine, RunReport, RunRequest};
pub use types::errors::{EngineError, Result};
