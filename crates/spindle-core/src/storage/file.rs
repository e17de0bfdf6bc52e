//! Flat-file backend: `jobs.json` + `dlq.json` in one directory.
//!
//! Every operation runs inside a critical section guarded by a lock file
//! created with `create_new` (fails if it already exists). Contention spins
//! with a short sleep until `lock_timeout`, then surfaces `LockTimeout`.
//! Simple and serialising: meant for low-volume local use.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument, warn};

use super::{Storage, ensure_dead};
use crate::domain::{Job, JobId, JobState, timestamp};
use crate::error::{Result, SpindleError};
use crate::queue::pick_due;

const JOBS_FILE: &str = "jobs.json";
const DLQ_FILE: &str = "dlq.json";
const LOCK_FILE: &str = "spindle.lock";

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_LOCK_RETRY: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DlqEntry {
    #[serde(with = "timestamp")]
    moved_at: DateTime<Utc>,
    job: Job,
}

/// Both documents as loaded inside one critical section.
struct Documents {
    jobs: Vec<Job>,
    dlq: Vec<DlqEntry>,
    jobs_dirty: bool,
    dlq_dirty: bool,
}

impl Documents {
    fn jobs_mut(&mut self) -> &mut Vec<Job> {
        self.jobs_dirty = true;
        &mut self.jobs
    }

    fn dlq_mut(&mut self) -> &mut Vec<DlqEntry> {
        self.dlq_dirty = true;
        &mut self.dlq
    }

    fn position(&self, id: &JobId) -> Option<usize> {
        self.jobs.iter().position(|job| job.id() == id)
    }

    fn in_dlq(&self, job: &Job) -> bool {
        self.dlq.iter().any(|entry| entry.job == *job)
    }

    /// A crash between the two writes of a DLQ move leaves the dead job in
    /// both documents; the DLQ copy wins. Only the same death counts: an
    /// older snapshot under a reused id leaves the live record alone.
    fn reconcile(&mut self) {
        let before = self.jobs.len();
        let dlq = &self.dlq;
        self.jobs.retain(|job| {
            job.state() != JobState::Dead || !dlq.iter().any(|entry| entry.job == *job)
        });
        if self.jobs.len() != before {
            warn!(dropped = before - self.jobs.len(), "finished interrupted dlq move");
            self.jobs_dirty = true;
        }
    }
}

/// Removes the lock file when dropped, including on error paths.
struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to release lock file");
        }
    }
}

pub struct FileStorage {
    dir: PathBuf,
    lock_timeout: Duration,
    lock_retry: Duration,
}

impl FileStorage {
    pub fn new(dir: impl Into<PathBuf>, lock_timeout: Duration) -> Self {
        Self {
            dir: dir.into(),
            lock_timeout,
            lock_retry: DEFAULT_LOCK_RETRY,
        }
    }

    /// Sleep between attempts to take a busy lock.
    pub fn with_lock_retry(mut self, lock_retry: Duration) -> Self {
        self.lock_retry = lock_retry;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn lock_path(&self) -> PathBuf {
        self.dir.join(LOCK_FILE)
    }

    async fn lock(&self) -> Result<LockGuard> {
        let path = self.lock_path();
        let started = Instant::now();
        loop {
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(mut file) => {
                    let guard = LockGuard { path };
                    file.write_all(std::process::id().to_string().as_bytes()).await?;
                    return Ok(guard);
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    let waited = started.elapsed();
                    if waited >= self.lock_timeout {
                        return Err(SpindleError::LockTimeout { path, waited });
                    }
                    debug!(path = %path.display(), "lock busy, retrying");
                    tokio::time::sleep(self.lock_retry).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Run `op` against freshly loaded documents inside the critical
    /// section, writing back whichever documents it touched.
    async fn transact<T>(&self, op: impl FnOnce(&mut Documents) -> Result<T>) -> Result<T> {
        let _guard = self.lock().await?;
        let mut docs = Documents {
            jobs: read_doc(&self.dir.join(JOBS_FILE)).await?,
            dlq: read_doc(&self.dir.join(DLQ_FILE)).await?,
            jobs_dirty: false,
            dlq_dirty: false,
        };
        docs.reconcile();

        let out = op(&mut docs)?;

        // DLQ first: an interrupted move leaves a duplicate, never a loss.
        if docs.dlq_dirty {
            write_doc(&self.dir.join(DLQ_FILE), &docs.dlq).await?;
        }
        if docs.jobs_dirty {
            write_doc(&self.dir.join(JOBS_FILE), &docs.jobs).await?;
        }
        Ok(out)
    }
}

async fn read_doc<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    match tokio::fs::read(path).await {
        Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(Vec::new()),
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map_err(|e| SpindleError::Storage(format!("corrupt document {}: {e}", path.display()))),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

/// Write to a sibling temp file, then rename over the target.
async fn write_doc<T: Serialize>(path: &Path, items: &[T]) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(items)?;
    let tmp = path.with_extension("json.tmp");
    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(&bytes).await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[async_trait]
impl Storage for FileStorage {
    #[instrument(skip_all, err, fields(dir = %self.dir.display()))]
    async fn init(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        self.transact(|docs| {
            // materialise both documents
            docs.jobs_mut();
            docs.dlq_mut();
            Ok(())
        })
        .await
    }

    #[instrument(skip_all, err, fields(job_id = %job.id()))]
    async fn enqueue(&self, job: Job) -> Result<()> {
        self.transact(|docs| {
            if docs.position(job.id()).is_some() {
                return Err(SpindleError::DuplicateJob(job.id().clone()));
            }
            docs.jobs_mut().push(job);
            Ok(())
        })
        .await
    }

    #[instrument(skip_all, err, fields(job_id = %job.id()))]
    async fn update(&self, job: &Job) -> Result<()> {
        self.transact(|docs| {
            let pos = docs.position(job.id()).ok_or_else(|| SpindleError::not_found(job.id()))?;
            docs.jobs_mut()[pos] = job.clone();
            Ok(())
        })
        .await
    }

    #[instrument(skip_all, err, fields(job_id = %job.id()))]
    async fn move_to_dlq(&self, job: &Job) -> Result<()> {
        ensure_dead(job)?;
        self.transact(|docs| {
            let Some(pos) = docs.position(job.id()) else {
                // finished by reconcile after an interrupted move
                if docs.in_dlq(job) {
                    return Ok(());
                }
                return Err(SpindleError::not_found(job.id()));
            };
            docs.jobs_mut().remove(pos);
            let dlq = docs.dlq_mut();
            dlq.retain(|entry| entry.job.id() != job.id());
            dlq.push(DlqEntry {
                moved_at: job.updated_at(),
                job: job.clone(),
            });
            Ok(())
        })
        .await
    }

    async fn get_by_id(&self, id: &JobId) -> Result<Option<Job>> {
        self.transact(|docs| Ok(docs.position(id).map(|pos| docs.jobs[pos].clone())))
            .await
    }

    #[instrument(skip_all, err)]
    async fn lease_next(&self, at: DateTime<Utc>) -> Result<Option<Job>> {
        self.transact(|docs| {
            let candidates = docs.jobs.iter().enumerate().map(|(pos, job)| (pos, pos as u64, job));
            let Some(pos) = pick_due(candidates, at) else {
                return Ok(None);
            };
            let job = &mut docs.jobs_mut()[pos];
            job.mark_processing(at)?;
            Ok(Some(job.clone()))
        })
        .await
    }

    async fn list(&self, state: Option<JobState>) -> Result<Vec<Job>> {
        self.transact(|docs| {
            Ok(docs
                .jobs
                .iter()
                .filter(|job| state.is_none_or(|s| job.state() == s))
                .cloned()
                .collect())
        })
        .await
    }

    async fn list_dlq(&self) -> Result<Vec<Job>> {
        self.transact(|docs| Ok(docs.dlq.iter().map(|entry| entry.job.clone()).collect()))
            .await
    }

    #[instrument(skip_all, err, fields(job_id = %id))]
    async fn retry_from_dlq(&self, id: &JobId, now: DateTime<Utc>) -> Result<Option<Job>> {
        self.transact(|docs| {
            let Some(dlq_pos) = docs.dlq.iter().position(|entry| entry.job.id() == id) else {
                return Ok(None);
            };
            let mut job = docs.dlq[dlq_pos].job.clone();
            job.reset_for_retry(false, now)?;

            match docs.position(id) {
                Some(pos) => docs.jobs_mut()[pos] = job.clone(),
                None => docs.jobs_mut().push(job.clone()),
            }
            docs.dlq_mut().remove(dlq_pos);
            Ok(Some(job))
        })
        .await
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
