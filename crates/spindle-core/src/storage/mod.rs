//! Storage contract and backends.
//!
//! Every backend guarantees at most one concurrent lease per job:
//! `lease_next` picks the due candidate, flips it to `processing` and
//! returns it as one atomic unit.
//!
//! - [`FileStorage`]: two JSON documents guarded by a lock file.
//! - [`SqliteStorage`]: rows + conditional update with bounded retry.
//! - [`MemoryStorage`]: the in-memory [`Queue`](crate::queue::Queue), not durable.

mod file;
mod memory;
mod sqlite;

pub use file::{DEFAULT_LOCK_TIMEOUT, FileStorage};
pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::SpindleConfig;
use crate::domain::{Job, JobId, JobState};
use crate::error::{Result, SpindleError};
use crate::observability::QueueCounts;
use crate::ports::{Clock, JobLease, JobSource};

#[async_trait]
pub trait Storage: Send + Sync {
    /// Create directories / tables. Idempotent.
    async fn init(&self) -> Result<()>;

    /// Insert a new job. Fails with `DuplicateJob` if the id exists.
    async fn enqueue(&self, job: Job) -> Result<()>;

    /// Overwrite an existing job. Fails with `NotFound` if it is absent.
    async fn update(&self, job: &Job) -> Result<()>;

    /// Remove a `dead` job from the main collection and append its snapshot
    /// to the DLQ, as one unit.
    async fn move_to_dlq(&self, job: &Job) -> Result<()>;

    async fn get_by_id(&self, id: &JobId) -> Result<Option<Job>>;

    /// Atomically pick the next due job, mark it `processing`, return it.
    async fn lease_next(&self, at: DateTime<Utc>) -> Result<Option<Job>>;

    /// Main collection in enqueue order, optionally filtered by state.
    async fn list(&self, state: Option<JobState>) -> Result<Vec<Job>>;

    /// DLQ snapshots in time-of-death order.
    async fn list_dlq(&self) -> Result<Vec<Job>>;

    async fn get_dlq(&self, id: &JobId) -> Result<Option<Job>> {
        Ok(self.list_dlq().await?.into_iter().find(|job| job.id() == id))
    }

    /// Remove the DLQ snapshot, reset it to `pending` with zero attempts and
    /// (re)insert it into the main collection, all-or-nothing.
    /// `None` when the id is not in the DLQ.
    async fn retry_from_dlq(&self, id: &JobId, now: DateTime<Utc>) -> Result<Option<Job>>;

    async fn counts(&self) -> Result<QueueCounts> {
        let mut counts = QueueCounts::default();
        for job in self.list(None).await? {
            counts.add(job.state(), 1);
        }
        counts.dlq = self.list_dlq().await?.len();
        Ok(counts)
    }

    async fn close(&self) -> Result<()>;
}

/// Rejects DLQ moves of anything but a `dead` job.
pub(crate) fn ensure_dead(job: &Job) -> Result<()> {
    if job.state() != JobState::Dead {
        return Err(SpindleError::IllegalTransition {
            id: job.id().clone(),
            from: job.state(),
            action: "move to dlq",
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageDriver {
    #[default]
    File,
    Sqlite,
    Memory,
}

impl fmt::Display for StorageDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageDriver::File => f.write_str("file"),
            StorageDriver::Sqlite => f.write_str("sqlite"),
            StorageDriver::Memory => f.write_str("memory"),
        }
    }
}

impl FromStr for StorageDriver {
    type Err = SpindleError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "file" | "json" => Ok(StorageDriver::File),
            "sqlite" | "sql" => Ok(StorageDriver::Sqlite),
            "memory" => Ok(StorageDriver::Memory),
            other => Err(SpindleError::Validation(format!("unknown storage driver: {other}"))),
        }
    }
}

/// Build and initialise the backend named by `config`.
///
/// For `sqlite`, a location without an extension is treated as a directory
/// and the database lives at `<location>/spindle.db`.
pub async fn open(config: &SpindleConfig) -> Result<Arc<dyn Storage>> {
    let location = config.storage_location.as_path();
    let storage: Arc<dyn Storage> = match config.storage_driver {
        StorageDriver::File => Arc::new(FileStorage::new(location, config.lock_timeout())),
        StorageDriver::Sqlite => Arc::new(SqliteStorage::open(&sqlite_path(location)).await?),
        StorageDriver::Memory => Arc::new(MemoryStorage::new()),
    };
    storage.init().await?;
    info!(driver = %config.storage_driver, location = %location.display(), "storage ready");
    Ok(storage)
}

fn sqlite_path(location: &Path) -> std::path::PathBuf {
    if location.extension().is_some() {
        location.to_path_buf()
    } else {
        location.join("spindle.db")
    }
}

/// Adapts any [`Storage`] into a worker [`JobSource`].
///
/// Finalising a lease runs the job's own transition, persists it with
/// `update`, and moves `dead` jobs into the DLQ.
#[derive(Clone)]
pub struct StorageSource {
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
}

impl StorageSource {
    pub fn new(storage: Arc<dyn Storage>, clock: Arc<dyn Clock>) -> Self {
        Self { storage, clock }
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }
}

#[async_trait]
impl JobSource for StorageSource {
    async fn lease(&self) -> Result<Option<Box<dyn JobLease>>> {
        let job = self.storage.lease_next(self.clock.now()).await?;
        Ok(job.map(|job| {
            Box::new(StorageLease {
                job,
                storage: Arc::clone(&self.storage),
                clock: Arc::clone(&self.clock),
            }) as Box<dyn JobLease>
        }))
    }
}

struct StorageLease {
    job: Job,
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
}

#[async_trait]
impl JobLease for StorageLease {
    fn job(&self) -> &Job {
        &self.job
    }

    async fn ack(self: Box<Self>) -> Result<Job> {
        let mut job = self.job;
        job.mark_completed(self.clock.now())?;
        self.storage.update(&job).await?;
        info!(job_id = %job.id(), attempts = job.attempts(), "job completed");
        Ok(job)
    }

    async fn fail(self: Box<Self>, error: String) -> Result<Job> {
        let mut job = self.job;
        let state = job.mark_failed(&error, self.clock.now())?;
        self.storage.update(&job).await?;
        match state {
            JobState::Dead => {
                self.storage.move_to_dlq(&job).await?;
                warn!(job_id = %job.id(), attempts = job.attempts(), error = %error, "job moved to dlq");
            }
            _ => {
                warn!(
                    job_id = %job.id(),
                    attempts = job.attempts(),
                    next_attempt_at = ?job.next_attempt_at(),
                    error = %error,
                    "job failed, retry scheduled"
                );
            }
        }
        Ok(job)
    }
}
