//! Job state.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::SpindleError;

/// Job state.
///
/// State transitions:
/// - Pending -> Processing -> Completed
/// - Pending -> Processing -> Failed -> Processing (re-lease when due)
/// - Pending -> Processing -> Dead (retry budget exhausted)
/// - Dead | Failed -> Pending (revival / manual reset)
/// - Processing | Failed -> Pending (requeue)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Waiting for its first lease (or revived).
    Pending,

    /// Leased: exactly one caller is executing it.
    Processing,

    Completed,

    /// Failed, waiting for `next_attempt_at`.
    Failed,

    /// Retry budget exhausted; only the DLQ can revive it.
    Dead,
}

impl JobState {
    pub const ALL: [JobState; 5] = [
        JobState::Pending,
        JobState::Processing,
        JobState::Completed,
        JobState::Failed,
        JobState::Dead,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Dead => "dead",
        }
    }

    /// No automatic transition leaves this state.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Dead)
    }

    /// Candidate for a lease (subject to its due time).
    pub fn is_leasable(self) -> bool {
        matches!(self, JobState::Pending | JobState::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = SpindleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| SpindleError::Validation(format!("unknown job state: {s}")))
    }
}
