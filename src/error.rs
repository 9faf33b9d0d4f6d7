//! Error Taxonomy
//!
//! Every failure the core can produce falls into one of seven kinds.
//! Recoverable kinds are handled at the call site as typed results;
//! `Integrity` is the only kind that halts autonomous operation.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type CoreResult<T> = std::result::Result<T, CoreError>;

/// The core error type. Variants map 1:1 onto the wire-level [`ErrorKind`]
/// tags carried in tool results and onto CLI exit codes.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Missing artifact path, checkpoint id, or tool name. Locally
    /// recoverable; the caller decides create-vs-error.
    #[error("not found: {0}")]
    NotFound(String),

    /// Malformed tool arguments or change-set payload. Rejected before
    /// any mutation takes place.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A human or policy declined an approval request.
    #[error("rejected: {0}")]
    Rejected(String),

    /// A handler failed mid-flight. Any checkpoint opened for the call
    /// has already been rolled back when this surfaces.
    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    /// Sandboxed verification reported failure. The checkpoint used for
    /// the rollback is carried for audit.
    #[error("verification failed: {reason}")]
    VerificationFailed {
        reason: String,
        checkpoint_id: Option<String>,
    },

    /// A sandboxed verification exceeded its wall-clock bound. The
    /// sandbox context has been discarded and replaced.
    #[error("timed out after {timeout_ms}ms: {reason}")]
    Timeout { reason: String, timeout_ms: u64 },

    /// A rollback target is missing from history or its content hash no
    /// longer matches. Fatal: the durability guarantee itself is broken.
    #[error("integrity violation: {0}")]
    Integrity(String),
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::NotFound(_) => ErrorKind::NotFound,
            CoreError::Validation(_) => ErrorKind::Validation,
            CoreError::Rejected(_) => ErrorKind::Rejected,
            CoreError::ExecutionFailed(_) => ErrorKind::ExecutionFailed,
            CoreError::VerificationFailed { .. } => ErrorKind::VerificationFailed,
            CoreError::Timeout { .. } => ErrorKind::Timeout,
            CoreError::Integrity(_) => ErrorKind::Integrity,
        }
    }

    /// Recoverable errors are returned as typed results and handled at
    /// the call site; the rest trigger rollback and cycle-level failure.
    pub fn recoverable(&self) -> bool {
        matches!(
            self,
            CoreError::NotFound(_) | CoreError::Validation(_) | CoreError::Rejected(_)
        )
    }

    /// Stable process exit code for the CLI surface.
    pub fn exit_code(&self) -> i32 {
        self.kind().exit_code()
    }
}

impl From<rusqlite::Error> for CoreError {
    fn from(err: rusqlite::Error) -> Self {
        CoreError::ExecutionFailed(format!("storage: {err}"))
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Validation(format!("malformed JSON: {err}"))
    }
}

/// Wire-level tag for an error kind, carried in tool results and the
/// approval/reflection records.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Validation,
    Rejected,
    ExecutionFailed,
    VerificationFailed,
    Timeout,
    Integrity,
}

impl ErrorKind {
    pub fn exit_code(&self) -> i32 {
        match self {
            ErrorKind::NotFound => 2,
            ErrorKind::Validation => 3,
            ErrorKind::Rejected => 4,
            ErrorKind::ExecutionFailed => 5,
            ErrorKind::VerificationFailed => 6,
            ErrorKind::Timeout => 7,
            ErrorKind::Integrity => 10,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::Validation => "validation",
            ErrorKind::Rejected => "rejected",
            ErrorKind::ExecutionFailed => "execution_failed",
            ErrorKind::VerificationFailed => "verification_failed",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Integrity => "integrity",
        };
        f.write_str(tag)
    }
}
