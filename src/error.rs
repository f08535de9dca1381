/// Error taxonomy for pipeline construction and execution
use std::path::PathBuf;
use thiserror::Error;

/// Exit code when every step succeeded (or was a cache hit)
pub const EXIT_SUCCESS: i32 = 0;
/// Exit code when a step failed
pub const EXIT_STEP_FAILED: i32 = 1;
/// Exit code for malformed pipeline definitions
pub const EXIT_DEFINITION: i32 = 2;
/// Exit code after a user cancellation (128 + SIGINT)
pub const EXIT_CANCELLED: i32 = 130;

#[derive(Debug, Error)]
pub enum StrataError {
    #[error("Duplicate step descriptor id: {0}")]
    DuplicateId(String),

    #[error("Step '{step_id}' is missing required parameter '{parameter}'")]
    MissingParameter { step_id: String, parameter: String },

    #[error("Unknown step descriptor: {0}")]
    UnknownStep(String),

    #[error("Unresolvable stage ordering: {0}")]
    StageOrdering(String),

    #[error("Malformed pipeline definition {path}: {message}")]
    Definition { path: PathBuf, message: String },

    #[error(transparent)]
    StageFailed(#[from] StageFailedError),

    #[error(transparent)]
    Cancelled(#[from] CancelledError),

    #[error("Cache entry {key} is corrupt: {reason}")]
    CacheCorruption { key: String, reason: String },
}

impl StrataError {
    /// Map the error onto the CLI exit code contract
    pub fn exit_code(&self) -> i32 {
        match self {
            StrataError::DuplicateId(_)
            | StrataError::MissingParameter { .. }
            | StrataError::UnknownStep(_)
            | StrataError::StageOrdering(_)
            | StrataError::Definition { .. } => EXIT_DEFINITION,
            StrataError::Cancelled(_) => EXIT_CANCELLED,
            StrataError::StageFailed(_)
            | StrataError::CacheCorruption { .. } => EXIT_STEP_FAILED,
        }
    }
}

/// A step exited non-zero (or failed its result checks); the stage stopped there
#[derive(Debug, Clone, Error)]
#[error("Step '{step_id}' in stage '{stage}' failed (exit code {exit_code}); {} step(s) not executed", remaining.len())]
pub struct StageFailedError {
    pub stage: String,
    pub step_id: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    /// Ids of the steps after the failing one, in declared order
    pub remaining: Vec<String>,
}

/// A cancellation request stopped the run
#[derive(Debug, Clone, Default, Error)]
#[error("Cancelled: {} completed, interrupted {}, {} never started", completed.len(), interrupted.as_deref().unwrap_or("none"), not_started.len())]
pub struct CancelledError {
    pub completed: Vec<String>,
    pub interrupted: Option<String>,
    pub not_started: Vec<String>,
}

pub type Result<T> = std::result::Result<T, StrataError>;
