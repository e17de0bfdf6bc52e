use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::domain::{JobId, JobState};

/// Longest error message kept on a job record.
pub const MAX_ERROR_LEN: usize = 500;

#[derive(Debug, Error)]
pub enum SpindleError {
    /// Malformed job, persisted record, or configuration value.
    #[error("invalid: {0}")]
    Validation(String),

    /// State-machine precondition violated.
    #[error("illegal transition for {id}: cannot {action} from {from}")]
    IllegalTransition {
        id: JobId,
        from: JobState,
        action: &'static str,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate job id: {0}")]
    DuplicateJob(JobId),

    /// The flat-file backend could not take its lock file in time.
    #[error("timed out after {waited:?} waiting for lock {path:?}")]
    LockTimeout { path: PathBuf, waited: Duration },

    /// The executor reported a non-zero exit, a signal, or a timeout.
    #[error("{0}")]
    Execution(String),

    #[error("storage: {0}")]
    Storage(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

impl SpindleError {
    pub fn not_found(id: &JobId) -> Self {
        SpindleError::NotFound(id.to_string())
    }

    /// Programmer-visible contract violations (never a job execution failure).
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            SpindleError::Validation(_) | SpindleError::IllegalTransition { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, SpindleError>;

/// Truncate `message` to at most `max` characters, marking the cut with `…`.
pub fn truncate_message(message: &str, max: usize) -> String {
    if message.chars().count() <= max {
        return message.to_string();
    }
    let mut out: String = message.chars().take(max.saturating_sub(1)).collect();
    out.push('…');
    out
}
