#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use tempfile::TempDir;

use spindle_core::storage::{self, Storage};
use spindle_core::{Job, JobId, JobOptions, SpindleConfig, StorageDriver};

/// A storage backend living in its own temp directory.
pub struct Harness {
    pub storage: Arc<dyn Storage>,
    pub config: SpindleConfig,
    _dir: TempDir,
}

impl Harness {
    pub async fn open(driver: StorageDriver) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = SpindleConfig {
            storage_driver: driver,
            storage_location: dir.path().join("store"),
            ..SpindleConfig::default()
        };
        let storage = storage::open(&config).await.unwrap();
        Self {
            storage,
            config,
            _dir: dir,
        }
    }

    /// Another handle on the same backing store (same files), as a second
    /// process would open it. Memory storage has nothing to share.
    pub async fn reopen(&self) -> Arc<dyn Storage> {
        assert_ne!(self.config.storage_driver, StorageDriver::Memory);
        storage::open(&self.config).await.unwrap()
    }
}

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap()
}

pub fn secs(n: i64) -> chrono::Duration {
    chrono::Duration::seconds(n)
}

pub fn job(id: &str, options: JobOptions) -> Job {
    Job::create_with_id(JobId::new(id), format!("echo {id}"), options, t0()).unwrap()
}

pub fn ids(jobs: &[Job]) -> Vec<&str> {
    jobs.iter().map(|job| job.id().as_str()).collect()
}
