//! `Queue` behind an async mutex, usable as a worker's [`JobSource`].

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::Queue;
use crate::domain::{Job, JobId, JobState};
use crate::error::Result;
use crate::observability::QueueCounts;
use crate::ports::{Clock, JobLease, JobSource};

/// Cheap to clone; every clone sees the same index.
#[derive(Clone)]
pub struct SharedQueue {
    queue: Arc<Mutex<Queue>>,
    clock: Arc<dyn Clock>,
}

impl SharedQueue {
    pub fn new(queue: Queue, clock: Arc<dyn Clock>) -> Self {
        Self {
            queue: Arc::new(Mutex::new(queue)),
            clock,
        }
    }

    pub async fn enqueue(&self, job: Job) -> Result<()> {
        self.queue.lock().await.enqueue(job)
    }

    pub async fn get(&self, id: &JobId) -> Option<Job> {
        self.queue.lock().await.get(id).cloned()
    }

    pub async fn list(&self, state: Option<JobState>) -> Vec<Job> {
        self.queue.lock().await.list(state)
    }

    pub async fn counts(&self) -> QueueCounts {
        self.queue.lock().await.counts()
    }

    pub async fn requeue(&self, id: &JobId) -> Result<Job> {
        let now = self.clock.now();
        self.queue.lock().await.requeue(id, now)
    }

    pub async fn reset_for_retry(&self, id: &JobId, keep_attempts: bool) -> Result<Job> {
        let now = self.clock.now();
        self.queue.lock().await.reset_for_retry(id, keep_attempts, now)
    }
}

#[async_trait]
impl JobSource for SharedQueue {
    async fn lease(&self) -> Result<Option<Box<dyn JobLease>>> {
        let now = self.clock.now();
        // ロックは dequeue の中だけ。実行中はロックを持たない
        let job = self.queue.lock().await.dequeue(now)?;
        Ok(job.map(|job| {
            Box::new(SharedLease {
                job,
                queue: Arc::clone(&self.queue),
                clock: Arc::clone(&self.clock),
            }) as Box<dyn JobLease>
        }))
    }
}

struct SharedLease {
    job: Job,
    queue: Arc<Mutex<Queue>>,
    clock: Arc<dyn Clock>,
}

#[async_trait]
impl JobLease for SharedLease {
    fn job(&self) -> &Job {
        &self.job
    }

    async fn ack(self: Box<Self>) -> Result<Job> {
        let now = self.clock.now();
        self.queue.lock().await.complete(self.job.id(), now)
    }

    async fn fail(self: Box<Self>, error: String) -> Result<Job> {
        let now = self.clock.now();
        self.queue.lock().await.fail(self.job.id(), &error, now)
    }
}
