//! Core value types shared across the transaction pipeline.

pub mod errors;
pub mod op;

pub use errors::{EngineError, Result};
pub use op::{BackupRef, Baseline, NodeType, OpKind, Operation};
