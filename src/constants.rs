//! Shared crate-wide constants.
//!
//! Centralizes magic values and default paths used across modules.

/// Default state directory; journal and backup areas live under it.
pub const DEFAULT_STATE_DIR: &str = "/var/lib/atomic-shell";

/// Default work root; per-run overlay workspaces live under it.
pub const DEFAULT_WORK_DIR: &str = "/var/lib/atomic-shell/runs";

/// Default journal directory.
pub const DEFAULT_JOURNAL_DIR: &str = "/var/lib/atomic-shell/journal";

/// Lock file name inside the state directory guarding the one-at-a-time
/// transaction rule.
pub const LOCK_FILE_NAME: &str = "engine.lock";

/// Poll interval in milliseconds for the bounded-wait lock acquisition path.
pub const LOCK_POLL_MS: u64 = 25;

/// Default bounded wait for `acquire` (the try-acquire path never waits).
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 5_000;

/// Prefix overlayfs gives whiteout marker files in an upper layer.
pub const WHITEOUT_PREFIX: &str = ".wh.";

/// Marker overlayfs places inside an upper directory whose lower contents
/// are shadowed entirely.
pub const OPAQUE_MARKER: &str = ".wh..wh..opq";

/// Suffix for the sibling staging file used by the atomic file-replace path.
/// The staging name is `<target>.atomic.tmp`.
pub const TMP_SUFFIX: &str = ".atomic.tmp";

/// Name of the runner specification file inside a run directory.
pub const RUNNER_SPEC_FILE: &str = "runner-spec.json";

/// Argument that switches the re-executed binary into runner mode.
pub const RUNNER_MODE_ARG: &str = "__runner";

/// Infrastructure failure exit code reported by the runner process, distinct
/// from any script exit code it forwards.
pub const RUNNER_INFRA_EXIT: i32 = 2;
