//! Non-durable backend over the in-memory [`Queue`] index.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::{Storage, ensure_dead};
use crate::domain::{Job, JobId, JobState};
use crate::error::Result;
use crate::queue::Queue;

struct MemoryState {
    queue: Queue,
    /// Time-of-death order.
    dlq: Vec<Job>,
}

/// One mutex around index + DLQ makes every operation atomic.
pub struct MemoryStorage {
    state: Mutex<MemoryState>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState {
                queue: Queue::new(),
                dlq: Vec::new(),
            }),
        }
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn enqueue(&self, job: Job) -> Result<()> {
        self.state.lock().await.queue.enqueue(job)
    }

    async fn update(&self, job: &Job) -> Result<()> {
        self.state.lock().await.queue.update_job(job.clone())
    }

    async fn move_to_dlq(&self, job: &Job) -> Result<()> {
        ensure_dead(job)?;
        let mut state = self.state.lock().await;
        state.queue.remove(job.id())?;
        state.dlq.retain(|dead| dead.id() != job.id());
        state.dlq.push(job.clone());
        Ok(())
    }

    async fn get_by_id(&self, id: &JobId) -> Result<Option<Job>> {
        Ok(self.state.lock().await.queue.get(id).cloned())
    }

    async fn lease_next(&self, at: DateTime<Utc>) -> Result<Option<Job>> {
        self.state.lock().await.queue.dequeue(at)
    }

    async fn list(&self, state: Option<JobState>) -> Result<Vec<Job>> {
        Ok(self.state.lock().await.queue.list(state))
    }

    async fn list_dlq(&self) -> Result<Vec<Job>> {
        Ok(self.state.lock().await.dlq.clone())
    }

    async fn retry_from_dlq(&self, id: &JobId, now: DateTime<Utc>) -> Result<Option<Job>> {
        let mut state = self.state.lock().await;
        let Some(pos) = state.dlq.iter().position(|job| job.id() == id) else {
            return Ok(None);
        };
        let mut job = state.dlq[pos].clone();
        job.reset_for_retry(false, now)?;
        if state.queue.get(id).is_some() {
            state.queue.update_job(job.clone())?;
        } else {
            state.queue.enqueue(job.clone())?;
        }
        state.dlq.remove(pos);
        Ok(Some(job))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
