//! Error taxonomy and the exit-code contract.
//!
//! Every failure the engine can surface maps to exactly one of the fixed
//! caller-visible exit codes; see `EngineError::exit_code`.

use thiserror::Error;

/// Exit codes exposed to callers by the surrounding CLI.
pub mod exit {
    pub const OK: i32 = 0;
    pub const SCRIPT_FAILED: i32 = 10;
    pub const UNSUPPORTED: i32 = 20;
    pub const CONFLICT: i32 = 21;
    pub const RECOVERY_FAILURE: i32 = 30;
}

/// Failures surfaced by the transaction engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Precondition not met: non-Linux host, insufficient privilege, no
    /// overlay support, or an empty writable mount set. Nothing was staged
    /// and no journal was written.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Another transaction already holds the engine lock.
    #[error("engine busy: {0}")]
    Busy(String),

    /// The user script exited non-zero; staging was discarded and commit was
    /// never attempted.
    #[error("script failed with exit code {code}")]
    ScriptFailed { code: i32 },

    /// I/O failure while reading an upper layer or sequencing operations.
    #[error("scan failed: {0}")]
    Scan(String),

    /// A concurrent external change invalidated the plan.
    #[error("conflict detected on {path}")]
    Conflict { path: String },

    /// Backup or apply failed mid-commit. `rolled_back` records whether the
    /// automatic rollback restored the pre-transaction state.
    #[error("commit failed ({}): {msg}", rollback_status(.rolled_back))]
    Commit { msg: String, rolled_back: bool },

    /// Startup recovery could not drive a pending journal to a terminal
    /// state; no new transactions may start.
    #[error("recovery failed: {0}")]
    Recovery(String),

    /// Invariant violation that indicates a bug (empty Upsert source path,
    /// unknown node kind). Fatal.
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Fixed mapping from error class to caller-visible exit code.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Unsupported(_) | Self::Busy(_) | Self::Scan(_) => exit::UNSUPPORTED,
            Self::ScriptFailed { .. } => exit::SCRIPT_FAILED,
            Self::Conflict { .. } => exit::CONFLICT,
            Self::Commit { .. } | Self::Recovery(_) => exit::RECOVERY_FAILURE,
            Self::Internal(_) => exit::RECOVERY_FAILURE,
        }
    }
}

fn rollback_status(rolled_back: &bool) -> &'static str {
    if *rolled_back {
        "rolled back"
    } else {
        "rollback also failed"
    }
}

/// Convenient alias for results returning an `EngineError`.
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_the_contract() {
        assert_eq!(EngineError::Unsupported("x".into()).exit_code(), 20);
        assert_eq!(EngineError::Busy("x".into()).exit_code(), 20);
        assert_eq!(EngineError::ScriptFailed { code: 3 }.exit_code(), 10);
        assert_eq!(
            EngineError::Conflict { path: "/etc".into() }.exit_code(),
            21
        );
        assert_eq!(
            EngineError::Commit { msg: "apply /a".into(), rolled_back: true }.exit_code(),
            30
        );
        assert_eq!(EngineError::Recovery("poisoned".into()).exit_code(), 30);
    }

    #[test]
    fn commit_message_distinguishes_rollback_outcome() {
        let ok = EngineError::Commit { msg: "apply /a".into(), rolled_back: true };
        let bad = EngineError::Commit { msg: "apply /a".into(), rolled_back: false };
        assert!(ok.to_string().contains("rolled back"));
        assert!(bad.to_string().contains("rollback also failed"));
    }
}
