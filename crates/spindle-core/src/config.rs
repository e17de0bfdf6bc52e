//! Inbound parameters: which storage to open, how to size the worker.
//!
//! Defaults, overlaid by `SPINDLE_*` environment variables. No file merging.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::{Backoff, DEFAULT_MAX_RETRIES, JobOptions};
use crate::error::{Result, SpindleError};
use crate::storage::StorageDriver;

pub const ENV_PREFIX: &str = "SPINDLE_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpindleConfig {
    pub storage_driver: StorageDriver,
    /// Directory for `file`; database file (or its directory) for `sqlite`.
    pub storage_location: PathBuf,
    pub poll_interval_ms: u64,
    pub concurrency: usize,
    /// Per-job execution limit. `None`: unbounded.
    pub job_timeout_secs: Option<u64>,
    pub lock_timeout_ms: u64,
    /// Defaults for newly enqueued jobs.
    pub max_retries: u32,
    pub backoff_base: u32,
}

impl Default for SpindleConfig {
    fn default() -> Self {
        Self {
            storage_driver: StorageDriver::File,
            storage_location: PathBuf::from("./.spindle"),
            poll_interval_ms: 500,
            concurrency: 1,
            job_timeout_secs: None,
            lock_timeout_ms: 5_000,
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_base: Backoff::DEFAULT_BASE,
        }
    }
}

impl SpindleConfig {
    /// Defaults overlaid with `SPINDLE_*` variables from the process
    /// environment, then validated.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an explicit variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}")).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(v) = var("STORAGE_DRIVER") {
            config.storage_driver = v.parse()?;
        }
        if let Some(v) = var("STORAGE_LOCATION") {
            config.storage_location = PathBuf::from(v);
        }
        if let Some(v) = var("POLL_INTERVAL_MS") {
            config.poll_interval_ms = parse_var("POLL_INTERVAL_MS", &v)?;
        }
        if let Some(v) = var("CONCURRENCY") {
            config.concurrency = parse_var("CONCURRENCY", &v)?;
        }
        if let Some(v) = var("JOB_TIMEOUT_SECS") {
            // 0 は無制限
            config.job_timeout_secs = Some(parse_var("JOB_TIMEOUT_SECS", &v)?).filter(|s| *s > 0);
        }
        if let Some(v) = var("LOCK_TIMEOUT_MS") {
            config.lock_timeout_ms = parse_var("LOCK_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = var("MAX_RETRIES") {
            config.max_retries = parse_var("MAX_RETRIES", &v)?;
        }
        if let Some(v) = var("BACKOFF_BASE") {
            config.backoff_base = parse_var("BACKOFF_BASE", &v)?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(SpindleError::Validation("concurrency must be at least 1".into()));
        }
        if self.poll_interval_ms == 0 {
            return Err(SpindleError::Validation("poll interval must be positive".into()));
        }
        Backoff::new(self.backoff_base)?;
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn job_timeout(&self) -> Option<Duration> {
        self.job_timeout_secs.map(Duration::from_secs)
    }

    /// Creation options for jobs enqueued under this configuration.
    pub fn job_options(&self) -> JobOptions {
        JobOptions::default()
            .max_retries(self.max_retries)
            .backoff_base(self.backoff_base)
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| SpindleError::Validation(format!("{ENV_PREFIX}{name}={value:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let config = SpindleConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, SpindleConfig::default());
        assert_eq!(config.storage_driver, StorageDriver::File);
        assert_eq!(config.poll_interval(), Duration::from_millis(500));
        assert_eq!(config.job_timeout(), None);
        assert_eq!(config.job_options(), JobOptions::default());
    }

    #[test]
    fn environment_overrides_defaults() {
        let config = SpindleConfig::from_lookup(lookup(&[
            ("SPINDLE_STORAGE_DRIVER", "sqlite"),
            ("SPINDLE_STORAGE_LOCATION", "/var/lib/spindle/queue.db"),
            ("SPINDLE_POLL_INTERVAL_MS", "50"),
            ("SPINDLE_CONCURRENCY", "4"),
            ("SPINDLE_JOB_TIMEOUT_SECS", "30"),
            ("SPINDLE_MAX_RETRIES", "0"),
            ("SPINDLE_BACKOFF_BASE", "3"),
        ]))
        .unwrap();

        assert_eq!(config.storage_driver, StorageDriver::Sqlite);
        assert_eq!(config.storage_location, PathBuf::from("/var/lib/spindle/queue.db"));
        assert_eq!(config.poll_interval_ms, 50);
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.job_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.job_options().max_retries, 0);
        assert_eq!(config.job_options().backoff_base, 3);
    }

    #[test]
    fn zero_timeout_means_unbounded() {
        let config = SpindleConfig::from_lookup(lookup(&[("SPINDLE_JOB_TIMEOUT_SECS", "0")])).unwrap();
        assert_eq!(config.job_timeout(), None);
    }

    #[test]
    fn blank_values_are_ignored() {
        let config = SpindleConfig::from_lookup(lookup(&[("SPINDLE_CONCURRENCY", "  ")])).unwrap();
        assert_eq!(config.concurrency, 1);
    }

    #[test]
    fn malformed_numbers_name_the_variable() {
        let err = SpindleConfig::from_lookup(lookup(&[("SPINDLE_CONCURRENCY", "many")])).unwrap_err();
        assert!(err.to_string().contains("SPINDLE_CONCURRENCY"), "{err}");
    }

    #[test]
    fn validate_rejects_unusable_values() {
        for bad in [
            SpindleConfig { concurrency: 0, ..SpindleConfig::default() },
            SpindleConfig { poll_interval_ms: 0, ..SpindleConfig::default() },
            SpindleConfig { backoff_base: 0, ..SpindleConfig::default() },
        ] {
            assert!(bad.validate().is_err(), "{bad:?}");
        }
    }

    #[test]
    fn partial_json_fills_in_defaults() {
        let config: SpindleConfig =
            serde_json::from_str(r#"{"storage_driver":"memory","concurrency":2}"#).unwrap();
        assert_eq!(config.storage_driver, StorageDriver::Memory);
        assert_eq!(config.concurrency, 2);
        assert_eq!(config.lock_timeout_ms, 5_000);
    }
}
