//! Status counters and tracing setup.

use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

use crate::domain::JobState;

/// Jobs per state, plus DLQ size.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub dead: usize,
    pub dlq: usize,
}

impl QueueCounts {
    pub fn add(&mut self, state: JobState, n: usize) {
        match state {
            JobState::Pending => self.pending += n,
            JobState::Processing => self.processing += n,
            JobState::Completed => self.completed += n,
            JobState::Failed => self.failed += n,
            JobState::Dead => self.dead += n,
        }
    }

    /// Jobs in the main collection (DLQ excluded).
    pub fn active_total(&self) -> usize {
        self.pending + self.processing + self.completed + self.failed + self.dead
    }
}

/// Install a fmt subscriber filtered by `RUST_LOG` (default `info`).
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
