//! Dead-letter queue administration over any [`Storage`].

use std::sync::Arc;

use tracing::{info, instrument, warn};

use crate::domain::{Job, JobId, JobState};
use crate::error::{Result, SpindleError};
use crate::ports::Clock;
use crate::storage::Storage;

#[derive(Clone)]
pub struct DlqManager {
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
}

impl DlqManager {
    pub fn new(storage: Arc<dyn Storage>, clock: Arc<dyn Clock>) -> Self {
        Self { storage, clock }
    }

    /// Snapshots in the backend's time-of-death order.
    pub async fn list(&self) -> Result<Vec<Job>> {
        self.storage.list_dlq().await
    }

    pub async fn get(&self, id: &JobId) -> Result<Option<Job>> {
        self.storage.get_dlq(id).await
    }

    /// Revive a dead job as `pending` with zero attempts.
    /// `None` when `id` is not in the DLQ.
    #[instrument(skip_all, err, fields(job_id = %id))]
    pub async fn retry(&self, id: &JobId) -> Result<Option<Job>> {
        let revived = self.storage.retry_from_dlq(id, self.clock.now()).await?;
        match &revived {
            Some(job) => info!(job_id = %job.id(), "job revived from dlq"),
            None => warn!(job_id = %id, "no such dlq entry"),
        }
        Ok(revived)
    }

    /// Move every job still `dead` in the main collection into the DLQ.
    ///
    /// Catches up after a crash between persisting `dead` and the DLQ move.
    /// Idempotent; a job that vanished concurrently is skipped.
    #[instrument(skip_all, err)]
    pub async fn sweep_dead_to_dlq(&self) -> Result<Vec<JobId>> {
        let mut moved = Vec::new();
        for job in self.storage.list(Some(JobState::Dead)).await? {
            match self.storage.move_to_dlq(&job).await {
                Ok(()) => moved.push(job.id().clone()),
                Err(SpindleError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        if !moved.is_empty() {
            info!(count = moved.len(), "swept dead jobs into dlq");
        }
        Ok(moved)
    }
}
