//! JobSource port - Worker が依存する唯一の "lease 元"
//!
//! The in-memory [`SharedQueue`](crate::queue::SharedQueue) and every
//! [`Storage`](crate::storage::Storage) backend (through
//! [`StorageSource`](crate::storage::StorageSource)) implement this, so the
//! worker loop does not know which one it runs on.

use async_trait::async_trait;

use crate::domain::Job;
use crate::error::Result;

/// A leased job.
/// The holder is the only caller allowed to finish it: `ack` or `fail`.
#[async_trait]
pub trait JobLease: Send {
    /// Snapshot taken at lease time (state = processing).
    fn job(&self) -> &Job;

    /// Mark success. Returns the finished job.
    async fn ack(self: Box<Self>) -> Result<Job>;

    /// Mark failure; the job's backoff policy decides failed vs dead.
    async fn fail(self: Box<Self>, error: String) -> Result<Job>;
}

#[async_trait]
pub trait JobSource: Send + Sync {
    /// Lease the next due job, or `None` when nothing is due right now.
    async fn lease(&self) -> Result<Option<Box<dyn JobLease>>>;
}
