//! Error types for the Kiln solver.
//!
//! All errors use `thiserror` for ergonomic error handling and proper error
//! chains. The taxonomy separates input errors (fatal to the submitting job),
//! cache errors (reads degrade to a miss, writes are fatal), worker errors
//! (attached to the failed vertex), cancellation (never logged as an error),
//! and internal invariant violations (fail closed).

use crate::digest::Digest;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for solver operations.
pub type Result<T> = std::result::Result<T, KilnError>;

/// A source-map location registered for a vertex.
///
/// Worker failures carry every location registered for the failed vertex so
/// frontends can point at the line that produced the op.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLocation {
    pub filename: String,
    pub line: u32,
    pub column: u32,
}

/// Main error type for the Kiln solver.
#[derive(Error, Debug)]
pub enum KilnError {
    // Input errors
    #[error("invalid build graph: {reason}")]
    InvalidGraph { reason: String },

    #[error("empty input slot {input} on op {digest}")]
    EmptyInputSlot { digest: Digest, input: usize },

    #[error("unknown op digest: {digest}")]
    UnknownOp { digest: Digest },

    #[error("cycle detected while keying {digest}")]
    CycleDetected { digest: Digest },

    #[error("invalid digest: {value}")]
    InvalidDigest { value: String },

    // Cache errors
    #[error("cache store error: {0}")]
    Store(String),

    #[error("cache migration failed: {reason}")]
    MigrationFailed { reason: String },

    // Worker errors
    #[error("op {vertex} failed: {reason}")]
    Worker { vertex: Digest, locations: Vec<SourceLocation>, reason: String },

    // Cancellation
    #[error("build cancelled")]
    Cancelled,

    // Configuration
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    // Internal invariant violations
    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl KilnError {
    /// Create an Internal error from any error type.
    pub fn internal(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Internal(err.to_string())
    }

    /// True if this error is a cancellation; cancellations propagate
    /// transparently and are never logged as errors.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// True for invariant violations that must fail closed.
    pub fn is_internal(&self) -> bool {
        matches!(self, Self::Internal(_))
    }
}
